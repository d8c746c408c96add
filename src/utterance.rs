use crate::error::{PipelineError, Result};
use crate::store::AnnotationStore;
use crate::summary::{IssueKind, Stage, StageReport};
use crate::types::{Interval, SpeakerTier, Utterance, TIME_EPSILON};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::Range;

/// 発話区切りの状態
#[derive(Clone, Copy, Debug, PartialEq)]
enum SegmenterState {
    /// 発話の外 (先頭、または長いポーズの後)
    Idle,
    /// 発話中
    Speech {
        /// 発話の最初の単語
        first: usize,
        /// 最後の非ポーズ単語
        last: usize,
        /// 最後の非ポーズ単語の後に続くポーズの合計長 (秒)
        pause: f64,
    },
}

/// 発話区切り器
///
/// 単語を時刻順に受け取り、閾値以上のポーズで発話を区切る。
/// ポーズ単語は境界の手がかりとしてのみ使い、発話の先頭・末尾にはならない。
///
/// # 状態遷移
///
/// - `Idle` で非ポーズ単語 → `Speech` (発話開始)
/// - `Speech` でポーズ単語 → ポーズ長を加算
/// - `Speech` で非ポーズ単語 → 加算したポーズ長が閾値以上なら発話を確定して
///   新しい発話を開始、未満なら同じ発話を継続
///
/// # Examples
///
/// ```
/// # use corpus_enrich::utterance::UtteranceSegmenter;
/// let mut segmenter = UtteranceSegmenter::new(0.15);
/// assert_eq!(segmenter.push(0, 0.5, false), None);
/// assert_eq!(segmenter.push(1, 0.2, true), None);
/// assert_eq!(segmenter.push(2, 0.5, false), Some(0..1));
/// assert_eq!(segmenter.finish(), Some(2..3));
/// ```
pub struct UtteranceSegmenter {
    /// 発話を区切るポーズ長の閾値 (秒、この値を含む)
    min_pause: f64,

    state: SegmenterState,
}

impl UtteranceSegmenter {
    pub fn new(min_pause: f64) -> Self {
        Self {
            min_pause,
            state: SegmenterState::Idle,
        }
    }

    /// 単語を1つ処理する
    ///
    /// # Arguments
    /// * `index` - 単語のインデックス
    /// * `duration` - 単語の長さ (秒)
    /// * `is_pause` - ポーズ単語かどうか
    ///
    /// # Returns
    /// 確定した発話の単語範囲 (あれば)
    pub fn push(&mut self, index: usize, duration: f64, is_pause: bool) -> Option<Range<usize>> {
        let (next, closed) = match self.state {
            SegmenterState::Idle if is_pause => (SegmenterState::Idle, None),
            SegmenterState::Idle => (
                SegmenterState::Speech {
                    first: index,
                    last: index,
                    pause: 0.0,
                },
                None,
            ),
            SegmenterState::Speech { first, last, pause } if is_pause => (
                SegmenterState::Speech {
                    first,
                    last,
                    pause: pause + duration,
                },
                None,
            ),
            SegmenterState::Speech { first, last, pause } => {
                if pause + TIME_EPSILON >= self.min_pause {
                    log::trace!("発話境界: 単語 {} の前 (ポーズ {:.3} 秒)", index, pause);
                    (
                        SegmenterState::Speech {
                            first: index,
                            last: index,
                            pause: 0.0,
                        },
                        Some(first..last + 1),
                    )
                } else {
                    (
                        SegmenterState::Speech {
                            first,
                            last: index,
                            pause: 0.0,
                        },
                        None,
                    )
                }
            }
        };
        self.state = next;
        closed
    }

    /// 残っている発話を確定する
    pub fn finish(&mut self) -> Option<Range<usize>> {
        let closed = match self.state {
            SegmenterState::Idle => None,
            SegmenterState::Speech { first, last, .. } => Some(first..last + 1),
        };
        self.state = SegmenterState::Idle;
        closed
    }
}

/// 1話者ティアを発話に区切る (既存の発話は置き換える)
pub fn segment_tier(tier: &mut SpeakerTier, pauses: &BTreeSet<String>, min_pause: f64) -> StageReport {
    let mut report = StageReport::new(Stage::Segment);
    let mut segmenter = UtteranceSegmenter::new(min_pause);
    let mut ranges = Vec::new();

    for (w, word) in tier.words.iter().enumerate() {
        if !word.interval.is_well_formed() {
            log::warn!("不正な単語区間をスキップ ({}): {:?}", tier.speaker, word.interval);
            report.record(IssueKind::MalformedInterval);
            continue;
        }
        report.processed += 1;
        let is_pause = pauses.contains(word.label());
        if let Some(range) = segmenter.push(w, word.interval.duration(), is_pause) {
            ranges.push(range);
        }
    }
    if let Some(range) = segmenter.finish() {
        ranges.push(range);
    }

    for word in &mut tier.words {
        word.utterance = None;
    }
    tier.utterances = ranges
        .into_iter()
        .enumerate()
        .map(|(u, range)| {
            let words = &mut tier.words[range.clone()];
            for word in words.iter_mut().filter(|w| !pauses.contains(w.label())) {
                word.utterance = Some(u);
            }
            let label = words
                .iter()
                .filter(|w| !pauses.contains(w.label()))
                .map(|w| w.label())
                .collect::<Vec<_>>()
                .join(" ");
            let begin = words.first().map(|w| w.interval.begin).unwrap_or_default();
            let end = words.last().map(|w| w.interval.end).unwrap_or_default();
            Utterance {
                interval: Interval::new(label, begin, end),
                words: range,
                speech_rate: None,
            }
        })
        .collect();

    log::debug!("{}: {} 発話", tier.speaker, tier.utterances.len());
    report
}

/// コーパス全体を発話に区切る
///
/// # Errors
///
/// 設定のポーズ語彙 `pauses` が空の場合は `Configuration`。
/// コーパスにポーズ単語が1つも無くてもエラーにはならない (連続した単語列が1発話になる)。
pub fn segment_corpus<S: AnnotationStore + ?Sized>(
    store: &mut S,
    pauses: &BTreeSet<String>,
    min_pause: f64,
) -> Result<StageReport> {
    if pauses.is_empty() {
        return Err(PipelineError::configuration(
            "utterance segmentation needs a non-empty `pause` label set",
        ));
    }
    if min_pause.is_nan() || min_pause < 0.0 {
        return Err(PipelineError::configuration(format!(
            "min_pause_duration must be >= 0, got {}",
            min_pause
        )));
    }

    let reports: Vec<StageReport> = store
        .tiers_mut()
        .into_par_iter()
        .map(|t| segment_tier(t.tier, pauses, min_pause))
        .collect();

    let mut report = StageReport::new(Stage::Segment);
    for partial in reports {
        report.merge(partial);
    }
    Ok(report)
}
