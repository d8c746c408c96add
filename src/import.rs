use crate::config::ImportConfig;
use crate::error::{PipelineError, Result};
use crate::store::AnnotationStore;
use crate::summary::{IssueKind, Stage, StageReport};
use crate::textgrid::{TextGrid, Tier};
use crate::types::{Discourse, Interval, Phone, SpeakerTier, Word};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// 取り込み対象のファイル組
#[derive(Clone, Debug, PartialEq)]
pub struct AlignmentFile {
    /// 話者 (ディレクトリ名)
    pub speaker: String,
    pub textgrid: PathBuf,
    pub audio: Option<PathBuf>,
}

/// コーパスのルートから話者ディレクトリとTextGrid/音声の組を探す
///
/// ```text
/// root/
///   speaker_a/
///     rec01.TextGrid
///     rec01.wav
///   speaker_b/
///     rec02.TextGrid
///     rec02.flac
/// ```
///
/// ルート直下のTextGridはファイル名を話者名として扱う。
pub fn discover(root: &Path, config: &ImportConfig) -> Result<Vec<AlignmentFile>> {
    if !root.is_dir() {
        return Err(PipelineError::configuration(format!(
            "corpus root {:?} is not a directory",
            root
        )));
    }

    let mut files = Vec::new();
    for entry in read_dir_sorted(root)? {
        if entry.is_dir() {
            let speaker = file_name(&entry);
            for file in read_dir_sorted(&entry)? {
                if is_textgrid(&file) {
                    files.push(pair(&file, &speaker, config));
                }
            }
        } else if is_textgrid(&entry) {
            let speaker = file_stem(&entry);
            files.push(pair(&entry, &speaker, config));
        }
    }
    Ok(files)
}

/// TextGridを読み込んでストアに談話として追加
pub fn import_corpus<S: AnnotationStore + ?Sized>(
    store: &mut S,
    root: &Path,
    config: &ImportConfig,
) -> Result<StageReport> {
    let files = discover(root, config)?;
    log::info!("{} 個のTextGridを取り込みます: {:?}", files.len(), root);

    let results: Vec<(Option<Discourse>, StageReport)> = files
        .par_iter()
        .map(|file| {
            let mut report = StageReport::new(Stage::Import);
            match load_discourse(file, config, &mut report) {
                Ok(discourse) => {
                    report.processed += 1;
                    (Some(discourse), report)
                }
                Err(e) => {
                    log::error!("TextGridの読み込みに失敗: {}", e);
                    report.record(IssueKind::UnreadableFile);
                    (None, report)
                }
            }
        })
        .collect();

    let mut report = StageReport::new(Stage::Import);
    for (discourse, partial) in results {
        report.merge(partial);
        if let Some(discourse) = discourse {
            store.add_discourse(discourse);
        }
    }
    Ok(report)
}

/// 1つのTextGridから談話を作る
pub fn load_discourse(
    file: &AlignmentFile,
    config: &ImportConfig,
    report: &mut StageReport,
) -> Result<Discourse> {
    let grid = TextGrid::from_file(&file.textgrid)?;
    let name = file_stem(&file.textgrid);

    let speaker_tiers = grid.speaker_tiers(&config.words_tier, &config.phones_tier, &file.speaker);
    if speaker_tiers.is_empty() {
        return Err(PipelineError::TextGrid {
            path: file.textgrid.clone(),
            message: format!(
                "no `{}` / `{}` interval tiers",
                config.words_tier, config.phones_tier
            ),
        });
    }

    if file.audio.is_none() {
        log::warn!("音声ファイルが見つかりません: {:?}", file.textgrid);
        report.record(IssueKind::MissingAudio);
    }

    let tiers = speaker_tiers
        .into_iter()
        .map(|(speaker, words, phones)| build_tier(&speaker, words, phones, &config.empty_label, report))
        .collect();

    Ok(Discourse {
        name,
        audio_path: file.audio.clone(),
        tiers,
    })
}

/// 単語ティアと音素ティアから話者ティアを構築
///
/// - 空ラベルは `empty_label` に置き換える
/// - 逆転・重なりのある区間はスキップして記録する
/// - 音素は包含関係で単語に割り当てる
pub fn build_tier(
    speaker: &str,
    words: &Tier,
    phones: &Tier,
    empty_label: &str,
    report: &mut StageReport,
) -> SpeakerTier {
    let mut tier = SpeakerTier::new(speaker);
    tier.words = clean_intervals(&words.intervals, empty_label, report)
        .into_iter()
        .map(Word::new)
        .collect();
    tier.phones = clean_intervals(&phones.intervals, empty_label, report)
        .into_iter()
        .map(Phone::new)
        .collect();
    assign_phones_to_words(&mut tier, report);
    tier
}

fn clean_intervals(intervals: &[Interval], empty_label: &str, report: &mut StageReport) -> Vec<Interval> {
    let mut sorted: Vec<Interval> = intervals
        .iter()
        .filter(|interval| {
            if interval.is_well_formed() {
                return true;
            }
            log::warn!("{}", PipelineError::malformed(interval, "begin >= end"));
            report.record(IssueKind::MalformedInterval);
            false
        })
        .map(|interval| {
            let mut interval = interval.clone();
            if interval.label.is_empty() {
                interval.label = empty_label.to_string();
            }
            interval
        })
        .collect();
    sorted.sort_by(|a, b| a.begin.total_cmp(&b.begin));

    let mut out: Vec<Interval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        if let Some(prev) = out.last() {
            if prev.overlaps(&interval) {
                log::warn!(
                    "{}",
                    PipelineError::malformed(&interval, format!("overlaps {:?}", prev.label))
                );
                report.record(IssueKind::MalformedInterval);
                continue;
            }
        }
        out.push(interval);
    }
    out
}

fn assign_phones_to_words(tier: &mut SpeakerTier, report: &mut StageReport) {
    let mut w = 0;
    let mut first: Vec<Option<usize>> = vec![None; tier.words.len()];
    let mut last: Vec<Option<usize>> = vec![None; tier.words.len()];

    for (p, phone) in tier.phones.iter_mut().enumerate() {
        while w < tier.words.len() && tier.words[w].interval.end <= phone.interval.begin + crate::types::TIME_EPSILON {
            w += 1;
        }
        match tier.words.get(w) {
            Some(word) if word.interval.contains(&phone.interval) => {
                phone.word = Some(w);
                first[w].get_or_insert(p);
                last[w] = Some(p);
            }
            _ => {
                log::debug!(
                    "どの単語にも含まれない音素: {:?} [{:.3}, {:.3})",
                    phone.label(),
                    phone.interval.begin,
                    phone.interval.end
                );
                report.record(IssueKind::OrphanPhone);
            }
        }
    }

    let mut next_phone = 0;
    for (w, word) in tier.words.iter_mut().enumerate() {
        word.phones = match (first[w], last[w]) {
            (Some(f), Some(l)) => {
                next_phone = l + 1;
                f..l + 1
            }
            _ => next_phone..next_phone,
        };
    }
}

fn pair(textgrid: &Path, speaker: &str, config: &ImportConfig) -> AlignmentFile {
    let audio = config
        .audio_extensions
        .iter()
        .map(|ext| textgrid.with_extension(ext))
        .find(|candidate| candidate.exists());
    AlignmentFile {
        speaker: speaker.to_string(),
        textgrid: textgrid.to_path_buf(),
        audio,
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(format!("reading directory {:?}", dir), e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| !file_name(p).starts_with('.'))
        .collect();
    entries.sort();
    Ok(entries)
}

fn is_textgrid(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("TextGrid"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Corpus;
    use crate::textgrid::fixtures::long_textgrid;
    use crate::textgrid::TierClass;
    use tempfile::TempDir;

    fn tier_of(name: &str, intervals: &[(f64, f64, &str)]) -> Tier {
        Tier {
            name: name.to_string(),
            class: TierClass::IntervalTier,
            intervals: intervals
                .iter()
                .map(|(b, e, l)| Interval::new(*l, *b, *e))
                .collect(),
        }
    }

    #[test]
    fn test_build_tier_assigns_phones_by_containment() {
        let words = tier_of("words", &[(0.0, 0.3, "la"), (0.3, 0.5, ""), (0.5, 0.9, "mer")]);
        let phones = tier_of(
            "phones",
            &[
                (0.0, 0.1, "l"),
                (0.1, 0.3, "a"),
                (0.3, 0.5, ""),
                (0.5, 0.6, "m"),
                (0.6, 0.8, "E"),
                (0.8, 0.9, "R"),
            ],
        );
        let mut report = StageReport::new(Stage::Import);
        let tier = build_tier("spk", &words, &phones, "<sil>", &mut report);

        assert_eq!(tier.words.len(), 3);
        assert_eq!(tier.words[1].label(), "<sil>");
        assert_eq!(tier.phones[2].label(), "<sil>");
        assert_eq!(tier.words[0].phones, 0..2);
        assert_eq!(tier.words[1].phones, 2..3);
        assert_eq!(tier.words[2].phones, 3..6);
        assert_eq!(tier.phones[4].word, Some(2));
        assert_eq!(report.total_issues(), 0);
    }

    #[test]
    fn test_malformed_and_orphan_intervals_are_skipped() {
        let words = tier_of("words", &[(0.0, 0.5, "oui"), (0.4, 0.6, "bad"), (1.0, 0.9, "inv")]);
        let phones = tier_of("phones", &[(0.0, 0.2, "w"), (0.2, 0.5, "i"), (0.7, 0.8, "x")]);
        let mut report = StageReport::new(Stage::Import);
        let tier = build_tier("spk", &words, &phones, "<sil>", &mut report);

        assert_eq!(tier.words.len(), 1);
        assert_eq!(report.count(IssueKind::MalformedInterval), 2);
        assert_eq!(report.count(IssueKind::OrphanPhone), 1);
        assert_eq!(tier.phones[2].word, None);
        assert_eq!(tier.words[0].phones, 0..2);
    }

    #[test]
    fn test_import_corpus_from_speaker_directories() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let speaker_dir = temp_dir.path().join("spk1");
        fs::create_dir_all(&speaker_dir)?;
        let content = long_textgrid(
            0.6,
            &[
                ("words", &[(0.0, 0.6, "si")]),
                ("phones", &[(0.0, 0.2, "s"), (0.2, 0.6, "i")]),
            ],
        );
        fs::write(speaker_dir.join("rec01.TextGrid"), &content)?;
        fs::write(speaker_dir.join("rec01.wav"), b"RIFF")?;
        fs::write(speaker_dir.join("rec02.TextGrid"), "garbage")?;
        fs::write(speaker_dir.join(".DS_Store"), "")?;

        let config = ImportConfig::default();
        let files = discover(temp_dir.path(), &config)?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].speaker, "spk1");
        assert_eq!(files[0].audio, Some(speaker_dir.join("rec01.wav")));
        assert_eq!(files[1].audio, None);

        let mut corpus = Corpus::new("test");
        let report = import_corpus(&mut corpus, temp_dir.path(), &config)?;
        assert_eq!(report.processed, 1);
        assert_eq!(report.count(IssueKind::UnreadableFile), 1);
        assert_eq!(corpus.discourses.len(), 1);
        assert_eq!(corpus.discourses[0].name, "rec01");
        assert_eq!(corpus.discourses[0].tiers[0].speaker, "spk1");
        assert_eq!(corpus.phone_count(), 2);
        Ok(())
    }

    #[test]
    fn test_discover_rejects_missing_root() {
        let result = discover(Path::new("/nonexistent/corpus/root"), &ImportConfig::default());
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
