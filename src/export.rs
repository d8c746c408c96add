use crate::classify::{SIBILANT, VOWEL};
use crate::config::ExportKind;
use crate::error::{PipelineError, Result};
use crate::query::{phones_in_subset, PhoneContext};
use crate::store::AnnotationStore;
use crate::summary::{Stage, StageReport};
use crate::types::FormantMeasurement;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 音素行の共通列
const PHONE_COLUMNS: [&str; 17] = [
    "discourse",
    "speaker",
    "phone",
    "phone_duration",
    "phone_begin",
    "phone_end",
    "phone_position",
    "previous_phone",
    "following_phone",
    "following_following_phone",
    "syllable",
    "syllable_begin",
    "syllable_end",
    "word",
    "transcription",
    "word_begin",
    "word_end",
];

/// ヘッダーと行からなる表
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn new(header: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    #[cfg(test)]
    fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.header.iter().position(|h| h == name)?;
        Some(self.rows.iter().map(|r| r[index].as_str()).collect())
    }

    /// CSVとして書き出す
    ///
    /// 出力ディレクトリが存在しない場合は作成する。
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| PipelineError::io(format!("creating {:?}", parent), e))?;
            }
        }
        let file = File::create(path).map_err(|e| PipelineError::io(format!("creating {:?}", path), e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| PipelineError::io(format!("writing {:?}", path), e))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write_record(writer, &self.header)?;
        for row in &self.rows {
            write_record(writer, row)?;
        }
        Ok(())
    }
}

fn write_record<W: Write>(writer: &mut W, fields: &[String]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(writer, "{}", line)
}

/// 区切り文字・引用符・改行を含むフィールドを引用符で囲む
fn escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn num(value: f64) -> String {
    format!("{}", value)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// 音素行の共通列の値
fn phone_fields(hit: &PhoneContext<'_>) -> Vec<String> {
    let phone = hit.phone();
    let syllable = hit.syllable();
    let word = hit.word();
    vec![
        hit.discourse.to_string(),
        hit.tier.speaker.clone(),
        phone.label().to_string(),
        num(phone.interval.duration()),
        num(phone.interval.begin),
        num(phone.interval.end),
        opt(hit.position_in_word()),
        opt(hit.neighbour(-1).map(|p| p.label())),
        opt(hit.neighbour(1).map(|p| p.label())),
        opt(hit.neighbour(2).map(|p| p.label())),
        opt(syllable.map(|s| s.interval.label.as_str())),
        opt(syllable.map(|s| s.interval.begin)),
        opt(syllable.map(|s| s.interval.end)),
        opt(word.map(|w| w.label())),
        opt(word.map(|w| w.transcription(&hit.tier.phones))),
        opt(word.map(|w| w.interval.begin)),
        opt(word.map(|w| w.interval.end)),
    ]
}

fn formant_fields(measurement: Option<&FormantMeasurement>, track_points: Option<usize>) -> Vec<String> {
    let mut fields = vec![
        opt(measurement.map(|m| m.f1)),
        opt(measurement.map(|m| m.f2)),
        opt(measurement.and_then(|m| m.f3)),
        opt(measurement.map(|m| m.candidate.as_str())),
    ];
    if let Some(points) = track_points {
        let track = measurement.and_then(|m| m.track.as_deref()).unwrap_or_default();
        for i in 0..points {
            let point = track.get(i);
            fields.push(opt(point.and_then(|p| p.f1)));
            fields.push(opt(point.and_then(|p| p.f2)));
            fields.push(opt(point.and_then(|p| p.f3)));
        }
    }
    fields
}

/// 母音の表
///
/// `track_points` を指定すると軌跡の列 (`F1_0`, `F2_0`, `F3_0`, ...) を加える。
pub fn vowel_table<S: AnnotationStore + ?Sized>(store: &S, track_points: Option<usize>) -> Table {
    let mut header: Vec<String> = PHONE_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(
        ["utterance_begin", "utterance_end", "speech_rate", "F1", "F2", "F3", "formant_candidate"]
            .iter()
            .map(|c| c.to_string()),
    );
    if let Some(points) = track_points {
        for i in 0..points {
            for formant in ["F1", "F2", "F3"] {
                header.push(format!("{}_{}", formant, i));
            }
        }
    }

    let mut table = Table::new(header);
    for hit in phones_in_subset(store, VOWEL) {
        let utterance = hit.utterance();
        let mut row = phone_fields(&hit);
        row.push(opt(utterance.map(|u| u.interval.begin)));
        row.push(opt(utterance.map(|u| u.interval.end)));
        row.push(opt(utterance.and_then(|u| u.speech_rate)));
        row.extend(formant_fields(hit.phone().formants.as_ref(), track_points));
        table.rows.push(row);
    }
    table
}

/// 歯擦音の表
pub fn sibilant_table<S: AnnotationStore + ?Sized>(store: &S) -> Table {
    let header = PHONE_COLUMNS.iter().copied().chain([
        "word_num_syllables",
        "utterance_begin",
        "utterance_end",
        "utterance_speech_rate",
    ]);
    let mut table = Table::new(header);
    for hit in phones_in_subset(store, SIBILANT) {
        let utterance = hit.utterance();
        let mut row = phone_fields(&hit);
        row.push(opt(hit.word().and_then(|w| w.num_syllables)));
        row.push(opt(utterance.map(|u| u.interval.begin)));
        row.push(opt(utterance.map(|u| u.interval.end)));
        row.push(opt(utterance.and_then(|u| u.speech_rate)));
        table.rows.push(row);
    }
    table
}

/// 単語の表
pub fn word_table<S: AnnotationStore + ?Sized>(store: &S) -> Table {
    let mut table = Table::new([
        "discourse",
        "speaker",
        "word",
        "transcription",
        "word_begin",
        "word_end",
        "num_syllables",
        "utterance_begin",
        "utterance_end",
        "speech_rate",
    ]);
    for t in store.tiers() {
        for word in &t.tier.words {
            let utterance = word.utterance.and_then(|u| t.tier.utterances.get(u));
            table.rows.push(vec![
                t.discourse.to_string(),
                t.tier.speaker.clone(),
                word.label().to_string(),
                word.transcription(&t.tier.phones),
                num(word.interval.begin),
                num(word.interval.end),
                opt(word.num_syllables),
                opt(utterance.map(|u| u.interval.begin)),
                opt(utterance.map(|u| u.interval.end)),
                opt(utterance.and_then(|u| u.speech_rate)),
            ]);
        }
    }
    table
}

/// 発話の表
///
/// `discourse_begin` / `discourse_end` は談話内の全話者の発話の最初と最後。
pub fn utterance_table<S: AnnotationStore + ?Sized>(store: &S) -> Table {
    let tiers = store.tiers();

    let mut spans: BTreeMap<usize, (f64, f64)> = BTreeMap::new();
    for t in &tiers {
        if let (Some(first), Some(last)) = (t.tier.utterances.first(), t.tier.utterances.last()) {
            let span = spans
                .entry(t.key.discourse)
                .or_insert((first.interval.begin, last.interval.end));
            span.0 = span.0.min(first.interval.begin);
            span.1 = span.1.max(last.interval.end);
        }
    }

    let mut table = Table::new([
        "speaker",
        "utterance_label",
        "utterance_begin",
        "utterance_end",
        "following_utterance_begin",
        "following_utterance_end",
        "speech_rate",
        "discourse",
        "discourse_begin",
        "discourse_end",
    ]);
    for t in &tiers {
        let span = spans.get(&t.key.discourse);
        for (u, utterance) in t.tier.utterances.iter().enumerate() {
            let following = t.tier.utterances.get(u + 1);
            table.rows.push(vec![
                t.tier.speaker.clone(),
                utterance.interval.label.clone(),
                num(utterance.interval.begin),
                num(utterance.interval.end),
                opt(following.map(|f| f.interval.begin)),
                opt(following.map(|f| f.interval.end)),
                opt(utterance.speech_rate),
                t.discourse.to_string(),
                opt(span.map(|s| s.0)),
                opt(span.map(|s| s.1)),
            ]);
        }
    }
    table
}

/// エクスポート先のファイル名 (`<出力先>/<コーパス名>_<種類>.csv`)
pub fn export_path(output_dir: &Path, corpus: &str, kind: ExportKind) -> PathBuf {
    let suffix = match kind {
        ExportKind::Vowels => "vowels",
        ExportKind::Sibilants => "sibilants",
        ExportKind::Words => "words",
        ExportKind::Utterances => "utterances",
    };
    output_dir.join(format!("{}_{}.csv", corpus, suffix))
}

/// 設定された種類の表をすべて書き出す
pub fn export_corpus<S: AnnotationStore + ?Sized>(
    store: &S,
    output_dir: &Path,
    kinds: &[ExportKind],
    track_points: Option<usize>,
) -> Result<StageReport> {
    let mut report = StageReport::new(Stage::Export);
    for &kind in kinds {
        let table = match kind {
            ExportKind::Vowels => vowel_table(store, track_points),
            ExportKind::Sibilants => sibilant_table(store),
            ExportKind::Words => word_table(store),
            ExportKind::Utterances => utterance_table(store),
        };
        let path = export_path(output_dir, store.name(), kind);
        log::info!("{} 行を書き出します: {:?}", table.rows.len(), path);
        table.write_csv(&path)?;
        report.processed += table.rows.len();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::PhoneClasses;
    use crate::store::fixtures::{corpus_with, tier};
    use crate::store::Corpus;
    use crate::syllabify::syllabify_tier;
    use crate::types::{AnnotationLevel, TrackPoint};
    use crate::utterance::segment_tier;
    use tempfile::TempDir;

    fn enriched() -> Corpus {
        let mut t = tier(
            "spk",
            &[
                ("sa", &[("s", 0.0, 0.1), ("a", 0.1, 0.3)]),
                ("<sil>", &[("<sil>", 0.3, 0.6)]),
                ("si", &[("s", 0.6, 0.7), ("i", 0.7, 0.9)]),
            ],
        );
        let classes = PhoneClasses {
            syllabic: ["a".to_string(), "i".to_string()].into_iter().collect(),
            pause: ["<sil>".to_string()].into_iter().collect(),
        };
        syllabify_tier(&mut t, &classes, None);
        segment_tier(&mut t, &classes.pause, 0.15);
        crate::rate::annotate_tier(&mut t);
        t.phones[1].formants = Some(FormantMeasurement {
            f1: 700.0,
            f2: 1300.0,
            f3: None,
            candidate: "lpc5".to_string(),
            track: Some(vec![
                TrackPoint { time: 0.0, f1: Some(690.0), f2: Some(1290.0), f3: None },
                TrackPoint { time: 1.0, f1: Some(710.0), f2: Some(1310.0), f3: None },
            ]),
        });

        let mut corpus = corpus_with(vec![t]);
        corpus.set_subset(AnnotationLevel::Phone, VOWEL, classes.syllabic.clone());
        corpus.set_subset(AnnotationLevel::Phone, SIBILANT, ["s".to_string()].into_iter().collect());
        corpus
    }

    #[test]
    fn test_vowel_table_columns() {
        let table = vowel_table(&enriched(), None);
        assert_eq!(&table.header[..17], &PHONE_COLUMNS.map(String::from)[..]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.column("phone"), Some(vec!["a", "i"]));
        assert_eq!(table.column("phone_position"), Some(vec!["2", "2"]));
        assert_eq!(table.column("previous_phone"), Some(vec!["s", "s"]));
        assert_eq!(table.column("following_phone"), Some(vec!["<sil>", ""]));
        assert_eq!(table.column("following_following_phone"), Some(vec!["s", ""]));
        assert_eq!(table.column("syllable"), Some(vec!["s.a", "s.i"]));
        assert_eq!(table.column("transcription"), Some(vec!["s a", "s i"]));
        assert_eq!(table.column("utterance_begin"), Some(vec!["0", "0.6"]));
        for rate in table.column("speech_rate").unwrap() {
            assert!((rate.parse::<f64>().unwrap() - 10.0 / 3.0).abs() < 1e-9);
        }
        assert_eq!(table.column("F1"), Some(vec!["700", ""]));
        assert_eq!(table.column("formant_candidate"), Some(vec!["lpc5", ""]));
    }

    #[test]
    fn test_vowel_table_track_columns() {
        let table = vowel_table(&enriched(), Some(3));
        assert_eq!(table.header.len(), 17 + 7 + 9);
        assert_eq!(table.column("F1_0"), Some(vec!["690", ""]));
        assert_eq!(table.column("F2_1"), Some(vec!["1310", ""]));
        // 軌跡が短い場合は空
        assert_eq!(table.column("F1_2"), Some(vec!["", ""]));
    }

    #[test]
    fn test_sibilant_word_and_utterance_tables() {
        let corpus = enriched();
        let sibilants = sibilant_table(&corpus);
        assert_eq!(sibilants.column("word_num_syllables"), Some(vec!["1", "1"]));
        assert_eq!(sibilants.column("utterance_end"), Some(vec!["0.3", "0.9"]));

        let words = word_table(&corpus);
        assert_eq!(words.column("word"), Some(vec!["sa", "<sil>", "si"]));
        assert_eq!(words.column("num_syllables"), Some(vec!["1", "0", "1"]));
        assert_eq!(words.column("utterance_begin"), Some(vec!["0", "", "0.6"]));

        let utterances = utterance_table(&corpus);
        assert_eq!(utterances.column("utterance_label"), Some(vec!["sa", "si"]));
        assert_eq!(utterances.column("following_utterance_begin"), Some(vec!["0.6", ""]));
        assert_eq!(utterances.column("discourse_begin"), Some(vec!["0", "0"]));
        assert_eq!(utterances.column("discourse_end"), Some(vec!["0.9", "0.9"]));
    }

    #[test]
    fn test_csv_escaping() {
        let mut table = Table::new(["word", "note"]);
        table.rows.push(vec!["a,b".to_string(), "say \"hi\"".to_string()]);
        let mut out = Vec::new();
        table.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "word,note\n\"a,b\",\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn test_export_corpus_writes_one_file_per_kind() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let out = temp_dir.path().join("extract");
        let corpus = enriched();
        let report = export_corpus(&corpus, &out, &[ExportKind::Vowels, ExportKind::Utterances], None)?;
        assert_eq!(report.processed, 4);

        let vowels = fs::read_to_string(export_path(&out, "test", ExportKind::Vowels))?;
        assert_eq!(vowels.lines().count(), 3);
        assert!(vowels.starts_with("discourse,speaker,phone,phone_duration"));
        assert!(export_path(&out, "test", ExportKind::Utterances).exists());
        assert!(!export_path(&out, "test", ExportKind::Words).exists());
        Ok(())
    }
}
