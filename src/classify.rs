use crate::config::LabelSets;
use crate::error::{PipelineError, Result};
use crate::store::AnnotationStore;
use crate::summary::{IssueKind, Stage, StageReport};
use crate::types::AnnotationLevel;
use std::collections::BTreeSet;

pub const VOWEL: &str = "vowel";
pub const SIBILANT: &str = "sibilant";
pub const SYLLABIC: &str = "syllabic";
pub const PAUSE: &str = "pause";

/// サブセット名に使えない構造上の名前
pub const RESERVED_NAMES: [&str; 6] = ["phone", "word", "syllable", "utterance", "discourse", "speaker"];

/// タイプ単位のサブセットタグを付与
///
/// `labels` に含まれ、かつコーパスに出現するラベルだけを `name` の
/// サブセットとして登録する。同名の既存タグは置き換える (加算しない)。
/// 戻り値はコーパスに出現しなかったラベルの数。
///
/// # Errors
///
/// - `name` が構造上の名前 (`phone`, `word` など) と衝突する場合
/// - `name` が `pause` でラベル集合が空の場合
pub fn encode_type_subset<S: AnnotationStore + ?Sized>(
    store: &mut S,
    level: AnnotationLevel,
    name: &str,
    labels: &BTreeSet<String>,
) -> Result<usize> {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() || RESERVED_NAMES.contains(&normalized.as_str()) {
        return Err(PipelineError::configuration(format!(
            "subset name {:?} collides with a structural annotation type",
            name
        )));
    }
    if normalized == PAUSE && labels.is_empty() {
        return Err(PipelineError::configuration(
            "the `pause` subset needs at least one label",
        ));
    }

    let present = store.type_labels(level);
    let (tagged, unused): (BTreeSet<String>, BTreeSet<String>) =
        labels.iter().cloned().partition(|label| present.contains(label));

    if !unused.is_empty() {
        log::info!(
            "{} サブセット '{}': コーパスに出現しないラベル {:?}",
            level,
            name,
            unused
        );
    }
    log::debug!("{} サブセット '{}' = {:?}", level, name, tagged);

    store.set_subset(level, name, tagged);
    Ok(unused.len())
}

/// 設定されたラベル集合をすべてタグ付け
///
/// - 音素レベル: vowel / sibilant / syllabic / pause / 追加サブセット
/// - 単語レベル: pause
pub fn classify_corpus<S: AnnotationStore + ?Sized>(store: &mut S, labels: &LabelSets) -> Result<StageReport> {
    let mut report = StageReport::new(Stage::Classify);

    let mut phone_subsets: Vec<(&str, &BTreeSet<String>)> = vec![
        (VOWEL, &labels.vowels),
        (SIBILANT, &labels.sibilants),
        (SYLLABIC, &labels.syllabics),
    ];
    for (name, set) in &labels.extra {
        phone_subsets.push((name.as_str(), set));
    }

    for (name, set) in phone_subsets {
        log::info!("{} サブセットを作成...", name);
        let unused = encode_type_subset(store, AnnotationLevel::Phone, name, set)?;
        report.record_n(IssueKind::UnusedLabel, unused);
        report.processed += 1;
    }

    if !labels.pauses.is_empty() {
        log::info!("pause サブセットを作成...");
        for level in [AnnotationLevel::Phone, AnnotationLevel::Word] {
            let unused = encode_type_subset(store, level, PAUSE, &labels.pauses)?;
            report.record_n(IssueKind::UnusedLabel, unused);
            report.processed += 1;
        }
    }

    Ok(report)
}

/// 音素ラベルの述語をまとめたもの
///
/// ステージ内でティアを並列処理する前にストアから複製しておく。
#[derive(Clone, Debug, Default)]
pub struct PhoneClasses {
    pub syllabic: BTreeSet<String>,
    pub pause: BTreeSet<String>,
}

impl PhoneClasses {
    pub fn from_store<S: AnnotationStore + ?Sized>(store: &S) -> Self {
        Self {
            syllabic: store
                .subset(AnnotationLevel::Phone, SYLLABIC)
                .cloned()
                .unwrap_or_default(),
            pause: store
                .subset(AnnotationLevel::Phone, PAUSE)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn is_syllabic(&self, label: &str) -> bool {
        self.syllabic.contains(label)
    }

    pub fn is_pause(&self, label: &str) -> bool {
        self.pause.contains(label)
    }
}
