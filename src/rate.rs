use crate::store::AnnotationStore;
use crate::summary::{IssueKind, Stage, StageReport};
use crate::types::{Interval, Phone, SpeakerTier, Syllable, Utterance, Word};
use rayon::prelude::*;

/// 時間区間を持つ注釈
pub trait Spanned {
    fn span(&self) -> &Interval;
}

impl Spanned for Interval {
    fn span(&self) -> &Interval {
        self
    }
}

impl Spanned for Phone {
    fn span(&self) -> &Interval {
        &self.interval
    }
}

impl Spanned for Word {
    fn span(&self) -> &Interval {
        &self.interval
    }
}

impl Spanned for Syllable {
    fn span(&self) -> &Interval {
        &self.interval
    }
}

impl Spanned for Utterance {
    fn span(&self) -> &Interval {
        &self.interval
    }
}

/// 各親区間に完全に含まれる子区間の数
///
/// `children` は開始時刻順に並んでいること。
pub fn count_within<P: Spanned, C: Spanned>(parents: &[P], children: &[C]) -> Vec<u32> {
    parents
        .iter()
        .map(|parent| {
            let parent = parent.span();
            let start = children.partition_point(|c| c.span().end <= parent.begin);
            children[start..]
                .iter()
                .take_while(|c| c.span().begin < parent.end)
                .filter(|c| parent.contains(c.span()))
                .count() as u32
        })
        .collect()
}

/// 各親区間の子区間の密度 (個/秒)
///
/// 長さ0 (または不正) の親区間は `None`。
///
/// # Examples
///
/// ```
/// # use corpus_enrich::rate::rate_within;
/// # use corpus_enrich::types::Interval;
/// let utterance = vec![Interval::new("u", 0.0, 2.0)];
/// let syllables: Vec<Interval> = (0..6)
///     .map(|i| Interval::new("s", i as f64 / 3.0, (i + 1) as f64 / 3.0))
///     .collect();
/// assert_eq!(rate_within(&utterance, &syllables), vec![Some(3.0)]);
/// ```
pub fn rate_within<P: Spanned, C: Spanned>(parents: &[P], children: &[C]) -> Vec<Option<f64>> {
    count_within(parents, children)
        .into_iter()
        .zip(parents)
        .map(|(count, parent)| {
            let duration = parent.span().duration();
            (duration > 0.0).then(|| count as f64 / duration)
        })
        .collect()
}

/// 1話者ティアの発話速度と単語の音節数を付与 (既存の値は上書き)
pub fn annotate_tier(tier: &mut SpeakerTier) -> StageReport {
    let mut report = StageReport::new(Stage::Rate);

    let rates = rate_within(&tier.utterances, &tier.syllables);
    for (utterance, rate) in tier.utterances.iter_mut().zip(rates) {
        if rate.is_none() {
            report.record(IssueKind::MalformedInterval);
        }
        utterance.speech_rate = rate;
        report.processed += 1;
    }

    let counts = count_within(&tier.words, &tier.syllables);
    for (word, count) in tier.words.iter_mut().zip(counts) {
        word.num_syllables = Some(count);
        report.processed += 1;
    }
    report
}

/// コーパス全体に発話速度と音節数を付与
pub fn annotate_corpus<S: AnnotationStore + ?Sized>(store: &mut S) -> StageReport {
    let reports: Vec<StageReport> = store
        .tiers_mut()
        .into_par_iter()
        .map(|t| annotate_tier(t.tier))
        .collect();

    let mut report = StageReport::new(Stage::Rate);
    for partial in reports {
        report.merge(partial);
    }
    report
}
