use crate::classify::VOWEL;
use crate::config::{CentroidScope, FormantConfig};
use crate::error::Result;
use crate::measure::{FormantCandidate, FormantMeasurer};
use crate::prototype::{Prototype, PrototypeTable};
use crate::sound::Sound;
use crate::store::{AnnotationStore, TierKey};
use crate::summary::{IssueKind, Stage, StageReport};
use crate::types::{AnnotationLevel, FormantMeasurement, Interval, TIME_EPSILON};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// 測定点における (F1, F2)
pub type Point = [f64; 2];

/// 精緻化の対象となる母音トークン
#[derive(Clone, Debug)]
pub struct Token {
    pub key: TierKey,

    /// 話者ティア内の音素インデックス
    pub phone: usize,

    /// 所属する母音グループのインデックス
    pub group: usize,

    pub candidates: Vec<FormantCandidate>,

    /// 候補ごとの測定点の値。F1/F2 が揃わない候補は `None` (選択不可)
    pub points: Vec<Option<Point>>,

    /// 現在選択している候補
    pub choice: usize,
}

impl Token {
    /// 候補から測定点の値を求めてトークンを作る
    ///
    /// 初期選択は素朴な割り当て (候補0)。候補0が測定点の値を持たない場合は
    /// 値を持つ最初の候補。どの候補も値を持たなければ `None`。
    pub fn new(key: TierKey, phone: usize, group: usize, candidates: Vec<FormantCandidate>, measurement_point: f64) -> Option<Self> {
        let points: Vec<Option<Point>> = candidates
            .iter()
            .map(|c| Some([c.formant_at(1, measurement_point)?, c.formant_at(2, measurement_point)?]))
            .collect();
        let choice = points.iter().position(Option::is_some)?;
        Some(Self {
            key,
            phone,
            group,
            candidates,
            points,
            choice,
        })
    }

    fn point(&self) -> Option<Point> {
        self.points.get(self.choice).copied().flatten()
    }

    /// 重心までの標準化距離が最小の候補 (同点はインデックスの小さい方)
    fn best_choice(&self, centroid: Option<&Centroid>) -> usize {
        let Some(centroid) = centroid else {
            return self.choice;
        };
        let mut best: Option<(usize, f64)> = None;
        for (i, point) in self.points.iter().enumerate() {
            let Some(point) = point else { continue };
            let score = centroid.distance(point);
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i).unwrap_or(self.choice)
    }

    /// 選択した候補から出力値を作る
    pub fn measurement(&self, config: &FormantConfig) -> Option<FormantMeasurement> {
        let candidate = self.candidates.get(self.choice)?;
        let point = config.measurement_point;
        Some(FormantMeasurement {
            f1: candidate.formant_at(1, point)?,
            f2: candidate.formant_at(2, point)?,
            f3: candidate.formant_at(3, point),
            candidate: candidate.id.clone(),
            track: config
                .output_tracks
                .then(|| candidate.track(config.track_points)),
        })
    }
}

/// 母音グループ (スコープ × 母音ラベル)
#[derive(Clone, Debug, PartialEq)]
pub struct VowelGroup {
    /// 話者名 (`centroid_scope = "corpus"` の場合は空)
    pub scope: String,
    pub label: String,
    pub prototype: Option<Prototype>,
}

/// グループの重心
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid {
    pub mean: Point,
    pub sd: Point,
}

impl Centroid {
    /// 標準化距離の2乗
    pub fn distance(&self, point: &Point) -> f64 {
        (0..2)
            .map(|d| {
                let z = (point[d] - self.mean[d]) / self.sd[d];
                z * z
            })
            .sum()
    }
}

/// 現在の選択から各グループの重心を求める
///
/// 母集団の平均・分散をプロトタイプと混合する。プロトタイプは
/// `prior_weight` 個分の仮想トークンとして扱う。標準偏差は
/// `min_spread_hz` を下限とする。
pub fn centroids(tokens: &[Token], groups: &[VowelGroup], config: &FormantConfig) -> Vec<Option<Centroid>> {
    let mut sums = vec![(0usize, [0.0f64; 2], [0.0f64; 2]); groups.len()];
    for token in tokens {
        if let Some(point) = token.point() {
            let (n, sum, sum_sq) = &mut sums[token.group];
            *n += 1;
            for d in 0..2 {
                sum[d] += point[d];
                sum_sq[d] += point[d] * point[d];
            }
        }
    }

    groups
        .iter()
        .zip(sums)
        .map(|(group, (n, sum, sum_sq))| {
            let n = n as f64;
            let mut mean = [0.0; 2];
            let mut var = [0.0; 2];
            for d in 0..2 {
                let (pop_mean, pop_var) = if n > 0.0 {
                    let m = sum[d] / n;
                    (m, (sum_sq[d] / n - m * m).max(0.0))
                } else {
                    (0.0, 0.0)
                };
                match &group.prototype {
                    Some(prototype) => {
                        let w = config.prior_weight.max(0.0);
                        if n + w <= 0.0 {
                            mean[d] = prototype.mean[d];
                            var[d] = prototype.sd[d] * prototype.sd[d];
                        } else {
                            mean[d] = (n * pop_mean + w * prototype.mean[d]) / (n + w);
                            var[d] = (n * pop_var + w * prototype.sd[d] * prototype.sd[d]) / (n + w);
                        }
                    }
                    None if n > 0.0 => {
                        mean[d] = pop_mean;
                        var[d] = pop_var;
                    }
                    None => return None,
                }
            }
            Some(Centroid {
                mean,
                sd: [
                    var[0].sqrt().max(config.min_spread_hz),
                    var[1].sqrt().max(config.min_spread_hz),
                ],
            })
        })
        .collect()
}

/// 精緻化の結果
#[derive(Clone, Debug, PartialEq)]
pub struct Refinement {
    /// 実行した反復回数
    pub iterations: usize,

    /// 変化のない反復に到達したかどうか
    pub converged: bool,

    /// 最初の選択から変わったトークン数
    pub reassigned: usize,
}

/// 反復的に候補を選び直す
///
/// 各反復の最初に重心を計算し、反復中は固定する。
/// 選択が1つも変わらなかった反復で終了する。
pub fn refine(tokens: &mut [Token], groups: &[VowelGroup], config: &FormantConfig) -> Refinement {
    let initial: Vec<usize> = tokens.iter().map(|t| t.choice).collect();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.iterations {
        iterations += 1;
        let current = centroids(tokens, groups, config);
        let next: Vec<usize> = tokens
            .par_iter()
            .map(|t| t.best_choice(current[t.group].as_ref()))
            .collect();

        let mut changed = 0;
        for (token, choice) in tokens.iter_mut().zip(next) {
            if token.choice != choice {
                token.choice = choice;
                changed += 1;
            }
        }
        log::debug!("反復 {}: {} トークンの候補が変化", iterations, changed);
        if changed == 0 {
            converged = true;
            break;
        }
    }

    let reassigned = tokens
        .iter()
        .zip(initial)
        .filter(|(t, first)| t.choice != *first)
        .count();
    Refinement {
        iterations,
        converged,
        reassigned,
    }
}

/// 測定待ちの母音
struct PendingVowel {
    key: TierKey,
    phone: usize,
    scope: String,
    interval: Interval,
}

/// フォルマント精緻化エンジン
///
/// # 処理の流れ
///
/// 1. `vowel` サブセットの音素のうち、閾値以上の長さのものを談話ごとに測定
/// 2. 全トークンを素朴な割り当て (候補0) で初期化
/// 3. (スコープ, 母音) ごとの重心に最も近い候補を選び直す (不動点まで反復)
/// 4. 測定点の F1/F2/F3 (と必要なら軌跡) を音素に書き込む
pub struct FormantRefiner<'a> {
    measurer: &'a dyn FormantMeasurer,
    prototypes: &'a PrototypeTable,
    config: &'a FormantConfig,
}

impl<'a> FormantRefiner<'a> {
    pub fn new(measurer: &'a dyn FormantMeasurer, prototypes: &'a PrototypeTable, config: &'a FormantConfig) -> Self {
        Self {
            measurer,
            prototypes,
            config,
        }
    }

    pub fn run<S: AnnotationStore + ?Sized>(&self, store: &mut S) -> Result<StageReport> {
        let mut report = StageReport::new(Stage::Formants);

        for tier in store.tiers_mut() {
            for phone in &mut tier.tier.phones {
                phone.formants = None;
            }
        }
        let vowels = store.subset(AnnotationLevel::Phone, VOWEL).cloned().unwrap_or_default();
        if vowels.is_empty() {
            log::warn!("vowel サブセットが空です。フォルマントは測定されません");
            return Ok(report);
        }

        let mut pending: BTreeMap<usize, Vec<PendingVowel>> = BTreeMap::new();
        for tier_ref in store.tiers() {
            let scope = match self.config.centroid_scope {
                CentroidScope::Speaker => tier_ref.tier.speaker.clone(),
                CentroidScope::Corpus => String::new(),
            };
            for (p, phone) in tier_ref.tier.phones.iter().enumerate() {
                if !vowels.contains(phone.label()) {
                    continue;
                }
                report.processed += 1;
                if phone.interval.duration() + TIME_EPSILON < self.config.duration_threshold {
                    report.record(IssueKind::TooShort);
                    continue;
                }
                pending.entry(tier_ref.key.discourse).or_default().push(PendingVowel {
                    key: tier_ref.key,
                    phone: p,
                    scope: scope.clone(),
                    interval: phone.interval.clone(),
                });
            }
        }

        log::info!(
            "フォルマント測定: {} 母音 ({} 談話, 測定器 {})",
            pending.values().map(Vec::len).sum::<usize>(),
            pending.len(),
            self.measurer.name()
        );

        let mut groups: Vec<VowelGroup> = Vec::new();
        let mut group_index: BTreeMap<(String, String), usize> = BTreeMap::new();
        let mut unprototyped: BTreeSet<String> = BTreeSet::new();
        let mut tokens: Vec<Token> = Vec::new();

        for (discourse, batch) in pending {
            let sound = match store.audio_path(discourse) {
                Some(path) => match Sound::from_file(path) {
                    Ok(sound) => sound,
                    Err(e) => {
                        log::warn!("音声を読み込めません: {}", e);
                        report.record(IssueKind::MissingAudio);
                        report.record_n(IssueKind::MeasurementUnavailable, batch.len());
                        continue;
                    }
                },
                None => {
                    log::warn!(
                        "談話 {:?} に音声ファイルがありません",
                        store.discourse_name(discourse).unwrap_or_default()
                    );
                    report.record(IssueKind::MissingAudio);
                    report.record_n(IssueKind::MeasurementUnavailable, batch.len());
                    continue;
                }
            };

            let measured: Vec<_> = batch
                .par_iter()
                .map(|v| self.measurer.measure(&sound, &v.interval))
                .collect();

            for (vowel, result) in batch.into_iter().zip(measured) {
                let candidates = match result {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        log::debug!("{}", e);
                        report.record(IssueKind::MeasurementUnavailable);
                        continue;
                    }
                };

                let label = vowel.interval.label.clone();
                let group = *group_index
                    .entry((vowel.scope.clone(), label.clone()))
                    .or_insert_with(|| {
                        groups.push(VowelGroup {
                            scope: vowel.scope.clone(),
                            label: label.clone(),
                            prototype: self.prototypes.get(&label).copied(),
                        });
                        groups.len() - 1
                    });
                if groups[group].prototype.is_none() && unprototyped.insert(label.clone()) {
                    log::warn!("母音 {:?} のプロトタイプがありません。母集団のみで重心を推定します", label);
                    report.record(IssueKind::MissingPrototype);
                }

                match Token::new(vowel.key, vowel.phone, group, candidates, self.config.measurement_point) {
                    Some(token) => tokens.push(token),
                    None => {
                        log::debug!("候補がありません: {:?} [{:.3}, {:.3})", label, vowel.interval.begin, vowel.interval.end);
                        report.record(IssueKind::MeasurementUnavailable);
                    }
                }
            }
        }

        let outcome = refine(&mut tokens, &groups, self.config);
        if outcome.converged {
            log::info!(
                "フォルマント精緻化: {} 回の反復で収束 ({} トークン中 {} 件を再割り当て)",
                outcome.iterations,
                tokens.len(),
                outcome.reassigned
            );
        } else {
            log::info!(
                "フォルマント精緻化: {} 回の反復で収束しませんでした。最後の状態を使用します",
                outcome.iterations
            );
            report.record(IssueKind::ConvergenceNotReached);
        }

        let mut by_key: BTreeMap<TierKey, Vec<&Token>> = BTreeMap::new();
        for token in &tokens {
            by_key.entry(token.key).or_default().push(token);
        }
        for tier in store.tiers_mut() {
            let Some(list) = by_key.get(&tier.key) else { continue };
            for token in list {
                tier.tier.phones[token.phone].formants = token.measurement(self.config);
            }
        }
        Ok(report)
    }
}
