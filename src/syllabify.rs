use crate::classify::PhoneClasses;
use crate::error::{PipelineError, Result};
use crate::store::AnnotationStore;
use crate::summary::{IssueKind, Stage, StageReport};
use crate::types::{Interval, Phone, SpeakerTier, Syllable};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::Range;

/// 語頭に現れた頭子音連続の集合 (音素ラベル列)
pub type OnsetInventory = BTreeSet<Vec<String>>;

/// 音節化
///
/// 単語ごとに、音節核 (syllabic) の音素を起点として音節を作る。
///
/// # アルゴリズム
///
/// 1. 単語内の音素をポーズ音素で区切り、連続した非ポーズ音素列ごとに処理
/// 2. 核の前の子音 (前の核または単語境界の後) は後続の核の頭子音 (最大頭子音原則)
/// 3. 最後の核の後の子音はその核の尾子音
/// 4. `onsets` が与えられた場合、母音間の子音連続のうち語頭で観測された
///    最長の末尾部分だけを頭子音にし、残りを前の音節の尾子音にする
///    (観測された末尾部分がなければ連続全体を頭子音にする)
///
/// 核を持たない非ポーズ音素列 (ポーズ音素の前後にはみ出した子音など) は音節にしない。
/// 核を持たない単語は空のベクタを返す。
///
/// # Errors
///
/// 単語内の音素が逆転・重なっている場合は `MalformedInterval`。
pub fn syllabify_word(
    phones: &[Phone],
    range: Range<usize>,
    word: usize,
    classes: &PhoneClasses,
    onsets: Option<&OnsetInventory>,
) -> Result<Vec<Syllable>> {
    for p in range.clone() {
        let phone = &phones[p];
        if !phone.interval.is_well_formed() {
            return Err(PipelineError::malformed(&phone.interval, "begin >= end"));
        }
        if p > range.start && phones[p - 1].interval.overlaps(&phone.interval) {
            return Err(PipelineError::malformed(
                &phone.interval,
                format!("overlaps preceding phone {:?}", phones[p - 1].label()),
            ));
        }
    }

    let mut syllables = Vec::new();
    for run in non_pause_runs(phones, range, classes) {
        let nuclei: Vec<usize> = run
            .clone()
            .filter(|&p| classes.is_syllabic(phones[p].label()))
            .collect();
        if nuclei.is_empty() {
            continue;
        }

        let mut starts = Vec::with_capacity(nuclei.len());
        starts.push(run.start);
        for pair in nuclei.windows(2) {
            let cluster = pair[0] + 1..pair[1];
            let onset_len = match onsets {
                Some(inventory) => attested_onset_len(phones, cluster.clone(), inventory),
                None => cluster.len(),
            };
            starts.push(pair[1] - onset_len);
        }

        for (k, &nucleus) in nuclei.iter().enumerate() {
            let start = starts[k];
            let end = starts.get(k + 1).copied().unwrap_or(run.end);
            syllables.push(make_syllable(phones, start..end, nucleus, word));
        }
    }
    Ok(syllables)
}

/// 頭子音の長さ: 語頭で観測された最長の末尾部分
fn attested_onset_len(phones: &[Phone], cluster: Range<usize>, inventory: &OnsetInventory) -> usize {
    let labels: Vec<String> = phones[cluster].iter().map(|p| p.label().to_string()).collect();
    (1..=labels.len())
        .rev()
        .find(|&len| inventory.contains(&labels[labels.len() - len..].to_vec()))
        .unwrap_or(labels.len())
}

fn make_syllable(phones: &[Phone], range: Range<usize>, nucleus: usize, word: usize) -> Syllable {
    let members = &phones[range.clone()];
    let label = members
        .iter()
        .map(|p| p.label())
        .collect::<Vec<_>>()
        .join(".");
    let begin = members.first().map(|p| p.interval.begin).unwrap_or_default();
    let end = members.last().map(|p| p.interval.end).unwrap_or_default();
    Syllable {
        interval: Interval::new(label, begin, end),
        phones: range,
        nucleus,
        word,
    }
}

/// ポーズ音素で区切られた連続する非ポーズ音素の範囲
fn non_pause_runs(phones: &[Phone], range: Range<usize>, classes: &PhoneClasses) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for p in range.clone() {
        if classes.is_pause(phones[p].label()) {
            if let Some(s) = start.take() {
                runs.push(s..p);
            }
        } else if start.is_none() {
            start = Some(p);
        }
    }
    if let Some(s) = start {
        runs.push(s..range.end);
    }
    runs
}

/// 語頭の頭子音連続を収集
pub fn collect_onsets<S: AnnotationStore + ?Sized>(store: &S, classes: &PhoneClasses) -> OnsetInventory {
    let mut inventory = OnsetInventory::new();
    for tier_ref in store.tiers() {
        let tier = tier_ref.tier;
        for word in &tier.words {
            let onset: Vec<String> = tier.phones[word.phones.clone()]
                .iter()
                .take_while(|p| !classes.is_syllabic(p.label()) && !classes.is_pause(p.label()))
                .map(|p| p.label().to_string())
                .collect();
            let has_nucleus = tier.phones[word.phones.clone()]
                .iter()
                .any(|p| classes.is_syllabic(p.label()));
            if has_nucleus && !onset.is_empty() {
                inventory.insert(onset);
            }
        }
    }
    inventory
}

/// 1話者ティアを音節化 (既存の音節は置き換える)
pub fn syllabify_tier(tier: &mut SpeakerTier, classes: &PhoneClasses, onsets: Option<&OnsetInventory>) -> StageReport {
    let mut report = StageReport::new(Stage::Syllabify);
    tier.syllables.clear();
    for phone in &mut tier.phones {
        phone.syllable = None;
    }

    for (w, word) in tier.words.iter().enumerate() {
        let range = word.phones.clone();
        if range.is_empty() {
            continue;
        }
        report.processed += 1;
        match syllabify_word(&tier.phones, range.clone(), w, classes, onsets) {
            Ok(syllables) => {
                // 音節は非ポーズ音素だけを含むので、数が合わなければ取り残された音素がある
                let speech = tier.phones[range].iter().filter(|p| !classes.is_pause(p.label())).count();
                let covered: usize = syllables.iter().map(|s| s.phones.len()).sum();
                if covered < speech {
                    log::debug!(
                        "音節核のない音素列: {:?} ({}) の {} 音素",
                        word.label(),
                        tier.speaker,
                        speech - covered
                    );
                    report.record(IssueKind::NoNucleus);
                }
                tier.syllables.extend(syllables);
            }
            Err(e) => {
                log::warn!("単語 {:?} をスキップ ({}): {}", word.label(), tier.speaker, e);
                report.record(IssueKind::MalformedInterval);
            }
        }
    }

    for (s, syllable) in tier.syllables.iter().enumerate() {
        for p in syllable.phones.clone() {
            tier.phones[p].syllable = Some(s);
        }
    }
    report
}

/// コーパス全体を音節化
///
/// 話者ティアごとに並列で処理する。
pub fn syllabify_corpus<S: AnnotationStore + ?Sized>(store: &mut S, attested_onsets: bool) -> StageReport {
    let classes = PhoneClasses::from_store(store);
    if classes.syllabic.is_empty() {
        log::warn!("syllabic サブセットが空です。音節は作成されません");
    }
    let onsets = attested_onsets.then(|| collect_onsets(store, &classes));
    if let Some(inventory) = &onsets {
        log::info!("語頭の頭子音連続: {} 種類", inventory.len());
    }

    let reports: Vec<StageReport> = store
        .tiers_mut()
        .into_par_iter()
        .map(|t| syllabify_tier(t.tier, &classes, onsets.as_ref()))
        .collect();

    let mut report = StageReport::new(Stage::Syllabify);
    for partial in reports {
        report.merge(partial);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::tier;

    fn classes(syllabic: &[&str], pause: &[&str]) -> PhoneClasses {
        PhoneClasses {
            syllabic: syllabic.iter().map(|s| s.to_string()).collect(),
            pause: pause.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn labels(tier: &SpeakerTier) -> Vec<&str> {
        tier.syllables.iter().map(|s| s.interval.label.as_str()).collect()
    }

    #[test]
    fn test_maximal_onset() {
        // "patron": p a t R O~
        let mut t = tier(
            "spk",
            &[(
                "patron",
                &[("p", 0.0, 0.1), ("a", 0.1, 0.2), ("t", 0.2, 0.3), ("R", 0.3, 0.4), ("O~", 0.4, 0.6)],
            )],
        );
        let report = syllabify_tier(&mut t, &classes(&["a", "O~"], &[]), None);
        assert_eq!(labels(&t), vec!["p.a", "t.R.O~"]);
        assert_eq!(report.processed, 1);
        assert_eq!(t.syllables[1].interval.begin, 0.2);
        assert_eq!(t.syllables[1].onset_len(), 2);
        assert_eq!(t.phones[2].syllable, Some(1));
    }

    #[test]
    fn test_coda_attaches_to_last_nucleus() {
        let mut t = tier(
            "spk",
            &[("parc", &[("p", 0.0, 0.1), ("a", 0.1, 0.2), ("R", 0.2, 0.3), ("k", 0.3, 0.4)])],
        );
        syllabify_tier(&mut t, &classes(&["a"], &[]), None);
        assert_eq!(labels(&t), vec!["p.a.R.k"]);
        assert_eq!(t.syllables[0].coda_len(), 2);
        assert_eq!(t.syllables[0].interval.end, 0.4);
    }

    #[test]
    fn test_consecutive_nuclei_form_separate_syllables() {
        let mut t = tier("spk", &[("aïe", &[("a", 0.0, 0.1), ("i", 0.1, 0.2)])]);
        syllabify_tier(&mut t, &classes(&["a", "i"], &[]), None);
        assert_eq!(labels(&t), vec!["a", "i"]);
    }

    #[test]
    fn test_word_without_nucleus_is_not_syllabified() {
        let mut t = tier(
            "spk",
            &[
                ("psst", &[("p", 0.0, 0.1), ("s", 0.1, 0.3), ("t", 0.3, 0.4)]),
                ("<sil>", &[("<sil>", 0.4, 0.6)]),
            ],
        );
        let report = syllabify_tier(&mut t, &classes(&["a"], &["<sil>"]), None);
        assert!(t.syllables.is_empty());
        // ポーズだけの単語は数えない
        assert_eq!(report.count(IssueKind::NoNucleus), 1);
        assert!(t.phones.iter().all(|p| p.syllable.is_none()));
    }

    #[test]
    fn test_nucleus_less_run_after_internal_pause_is_reported() {
        // "la<sil>t": 核の後のポーズ音素の先に子音だけが残る
        let mut t = tier(
            "spk",
            &[(
                "lat",
                &[("l", 0.0, 0.1), ("a", 0.1, 0.2), ("<sil>", 0.2, 0.3), ("t", 0.3, 0.4)],
            )],
        );
        let report = syllabify_tier(&mut t, &classes(&["a"], &["<sil>"]), None);
        assert_eq!(labels(&t), vec!["l.a"]);
        assert_eq!(report.count(IssueKind::NoNucleus), 1);
        assert_eq!(t.phones[3].syllable, None);
    }

    #[test]
    fn test_attested_onsets_split_cluster() {
        // 語頭に "t" は現れるが "R.t" は現れない
        let mut t = tier(
            "spk",
            &[(
                "porte",
                &[("p", 0.0, 0.1), ("O", 0.1, 0.2), ("R", 0.2, 0.3), ("t", 0.3, 0.4), ("a", 0.4, 0.5)],
            )],
        );
        let inventory: OnsetInventory = [vec!["t".to_string()], vec!["p".to_string()]].into_iter().collect();
        syllabify_tier(&mut t, &classes(&["O", "a"], &[]), Some(&inventory));
        assert_eq!(labels(&t), vec!["p.O.R", "t.a"]);

        // 観測されない連続は全体が頭子音
        let empty = OnsetInventory::new();
        syllabify_tier(&mut t, &classes(&["O", "a"], &[]), Some(&empty));
        assert_eq!(labels(&t), vec!["p.O", "R.t.a"]);
    }

    #[test]
    fn test_overlapping_phones_skip_word() {
        let mut t = tier(
            "spk",
            &[
                ("bad", &[("b", 0.0, 0.2), ("a", 0.1, 0.3)]),
                ("la", &[("l", 0.3, 0.4), ("a", 0.4, 0.5)]),
            ],
        );
        let report = syllabify_tier(&mut t, &classes(&["a"], &[]), None);
        assert_eq!(report.count(IssueKind::MalformedInterval), 1);
        assert_eq!(labels(&t), vec!["l.a"]);
        assert_eq!(t.syllables[0].word, 1);
    }

    #[test]
    fn test_syllables_partition_non_pause_phones() {
        let mut t = tier(
            "spk",
            &[
                ("strict", &[("s", 0.0, 0.1), ("t", 0.1, 0.15), ("R", 0.15, 0.2), ("i", 0.2, 0.3), ("k", 0.3, 0.35), ("t", 0.35, 0.4)]),
                ("<sil>", &[("<sil>", 0.4, 0.7)]),
                ("ananas", &[("a", 0.7, 0.8), ("n", 0.8, 0.85), ("a", 0.85, 0.95), ("n", 0.95, 1.0), ("a", 1.0, 1.1), ("s", 1.1, 1.2)]),
                ("oiseau", &[("w", 1.2, 1.25), ("a", 1.25, 1.35), ("z", 1.35, 1.4), ("o", 1.4, 1.5)]),
            ],
        );
        let c = classes(&["a", "i", "o"], &["<sil>"]);
        syllabify_tier(&mut t, &c, None);

        let mut covered = BTreeSet::new();
        for (s, syllable) in t.syllables.iter().enumerate() {
            // 核はちょうど1つ
            let nuclei = t.phones[syllable.phones.clone()]
                .iter()
                .filter(|p| c.is_syllabic(p.label()))
                .count();
            assert_eq!(nuclei, 1);
            // 区間は構成音素の和集合
            assert_eq!(syllable.interval.begin, t.phones[syllable.phones.start].interval.begin);
            assert_eq!(syllable.interval.end, t.phones[syllable.phones.end - 1].interval.end);
            if s > 0 {
                let prev = &t.syllables[s - 1];
                assert!(prev.phones.end <= syllable.phones.start);
                assert!(prev.interval.end <= syllable.interval.begin);
            }
            for p in syllable.phones.clone() {
                assert!(covered.insert(p), "phone {} in two syllables", p);
            }
        }
        let expected: BTreeSet<usize> = (0..t.phones.len())
            .filter(|&p| !c.is_pause(t.phones[p].label()))
            .collect();
        assert_eq!(covered, expected);
        assert_eq!(t.syllables.len(), 1 + 3 + 2);
    }
}
