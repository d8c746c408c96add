use crate::store::{AnnotationStore, TierKey};
use crate::types::{AnnotationLevel, Phone, SpeakerTier, Syllable, Utterance, Word};
use std::collections::BTreeMap;

/// 問い合わせ結果の音素と、その上位・隣接の注釈
#[derive(Clone, Copy, Debug)]
pub struct PhoneContext<'a> {
    pub key: TierKey,
    pub discourse: &'a str,
    pub tier: &'a SpeakerTier,

    /// 話者ティア内の音素インデックス
    pub index: usize,
}

impl<'a> PhoneContext<'a> {
    pub fn phone(&self) -> &'a Phone {
        &self.tier.phones[self.index]
    }

    pub fn word(&self) -> Option<&'a Word> {
        self.tier.words.get(self.phone().word?)
    }

    pub fn syllable(&self) -> Option<&'a Syllable> {
        self.tier.syllables.get(self.phone().syllable?)
    }

    pub fn utterance(&self) -> Option<&'a Utterance> {
        self.tier.utterances.get(self.tier.utterance_of_phone(self.index)?)
    }

    /// 単語内の位置 (1始まり)
    pub fn position_in_word(&self) -> Option<usize> {
        let word = self.word()?;
        Some(self.index - word.phones.start + 1)
    }

    /// `offset` だけ離れた音素 (同じ話者ティア内)
    pub fn neighbour(&self, offset: isize) -> Option<&'a Phone> {
        let index = self.index.checked_add_signed(offset)?;
        self.tier.phones.get(index)
    }
}

/// サブセットに属するラベルの音素をすべて返す (談話順、時刻順)
///
/// サブセットが未登録の場合は空。
pub fn phones_in_subset<'a, S: AnnotationStore + ?Sized>(store: &'a S, name: &str) -> Vec<PhoneContext<'a>> {
    let Some(labels) = store.subset(AnnotationLevel::Phone, name) else {
        return Vec::new();
    };
    store
        .tiers()
        .into_iter()
        .flat_map(move |t| {
            t.tier
                .phones
                .iter()
                .enumerate()
                .filter(move |(_, p)| labels.contains(p.label()))
                .map(move |(index, _)| PhoneContext {
                    key: t.key,
                    discourse: t.discourse,
                    tier: t.tier,
                    index,
                })
        })
        .collect()
}

/// 音素ラベルごとの出現数と平均持続時間
#[derive(Clone, Debug, PartialEq)]
pub struct PhoneSetEntry {
    pub label: String,
    pub count: usize,
    pub average_duration: f64,
}

/// 音素目録の要約 (ラベル順)
pub fn summarize_phoneset<S: AnnotationStore + ?Sized>(store: &S) -> Vec<PhoneSetEntry> {
    let mut totals: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    let tiers = store.tiers();
    for t in &tiers {
        for phone in &t.tier.phones {
            let entry = totals.entry(phone.label()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += phone.interval.duration();
        }
    }
    totals
        .into_iter()
        .map(|(label, (count, total))| PhoneSetEntry {
            label: label.to_string(),
            count,
            average_duration: total / count as f64,
        })
        .collect()
}

/// 音素目録の要約をログに出力
pub fn log_phoneset<S: AnnotationStore + ?Sized>(store: &S) {
    let entries = summarize_phoneset(store);
    if entries.is_empty() {
        log::info!("コーパスに音素がありません");
        return;
    }
    for entry in &entries {
        log::info!(
            "音素 {} : {} 回出現, 平均持続時間 {:.4} 秒",
            entry.label,
            entry.count,
            entry.average_duration
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{encode_type_subset, VOWEL};
    use crate::store::fixtures::{corpus_with, tier};
    use crate::store::Corpus;

    fn sample() -> Corpus {
        corpus_with(vec![
            tier(
                "spk1",
                &[
                    ("si", &[("s", 0.0, 0.1), ("i", 0.1, 0.3)]),
                    ("la", &[("l", 0.3, 0.4), ("a", 0.4, 0.6)]),
                ],
            ),
            tier("spk2", &[("sa", &[("s", 0.0, 0.2), ("a", 0.2, 0.3)])]),
        ])
    }

    #[test]
    fn test_classify_then_query_returns_exactly_tagged_phones() {
        let mut corpus = sample();
        let vowels = ["a", "i", "u"].iter().map(|s| s.to_string()).collect();
        encode_type_subset(&mut corpus, AnnotationLevel::Phone, VOWEL, &vowels).unwrap();

        let hits = phones_in_subset(&corpus, VOWEL);
        let labels: Vec<(&str, &str)> = hits
            .iter()
            .map(|h| (h.tier.speaker.as_str(), h.phone().label()))
            .collect();
        assert_eq!(labels, vec![("spk1", "i"), ("spk1", "a"), ("spk2", "a")]);

        let expected = corpus
            .tiers()
            .iter()
            .flat_map(|t| t.tier.phones.iter())
            .filter(|p| ["a", "i"].contains(&p.label()))
            .count();
        assert_eq!(hits.len(), expected);
    }

    #[test]
    fn test_unknown_subset_is_empty() {
        let corpus = sample();
        assert!(phones_in_subset(&corpus, "nasal").is_empty());
    }

    #[test]
    fn test_context_navigation() {
        let mut corpus = sample();
        corpus.set_subset(AnnotationLevel::Phone, "liquid", ["l".to_string()].into_iter().collect());
        let hits = phones_in_subset(&corpus, "liquid");
        let l = hits[0];
        assert_eq!(l.word().map(|w| w.label()), Some("la"));
        assert_eq!(l.position_in_word(), Some(1));
        assert_eq!(l.neighbour(-1).map(|p| p.label()), Some("i"));
        assert_eq!(l.neighbour(1).map(|p| p.label()), Some("a"));
        assert!(l.neighbour(2).is_none());
        assert!(l.syllable().is_none());
        assert!(l.utterance().is_none());
    }

    #[test]
    fn test_summarize_phoneset() {
        let corpus = sample();
        let summary = summarize_phoneset(&corpus);
        let s = summary.iter().find(|e| e.label == "s").unwrap();
        assert_eq!(s.count, 2);
        assert!((s.average_duration - 0.15).abs() < 1e-9);
        let labels: Vec<_> = summary.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "i", "l", "s"]);
    }
}
