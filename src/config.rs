use crate::error::PipelineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub formants: FormantConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// コーパス設定
///
/// # デフォルト値
///
/// - `name`: "corpus"
/// - `root`: "./align" (話者ディレクトリを含むルート)
/// - `database`: None (`<name>.corpus.json` を使用)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_name")]
    pub name: String,
    #[serde(default = "default_corpus_root")]
    pub root: PathBuf,
    pub database: Option<PathBuf>,
}

/// ラベル集合の設定
///
/// 各集合は音素ラベルのリスト。`pauses` は単語ラベルと音素ラベルの
/// 両方に適用される。
///
/// - `syllabics` を省略した場合は `vowels` を使う (警告を出す)
/// - `pauses` は発話分割に必須
/// - `extra` で任意の名前付きサブセットを追加できる
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LabelConfig {
    #[serde(default)]
    pub vowels: Vec<String>,
    #[serde(default)]
    pub sibilants: Vec<String>,
    pub syllabics: Option<Vec<String>>,
    pub pauses: Option<Vec<String>>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// TextGrid取り込み設定
///
/// # デフォルト値
///
/// - `words_tier`: "words"
/// - `phones_tier`: "phones"
/// - `empty_label`: "<sil>" (空ラベルの区間に付けるラベル)
/// - `audio_extensions`: ["wav", "flac"]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportConfig {
    #[serde(default = "default_words_tier")]
    pub words_tier: String,
    #[serde(default = "default_phones_tier")]
    pub phones_tier: String,
    #[serde(default = "default_empty_label")]
    pub empty_label: String,
    #[serde(default = "default_audio_extensions")]
    pub audio_extensions: Vec<String>,
}

/// 音節化・発話分割の設定
///
/// # デフォルト値
///
/// - `min_pause_duration`: 0.15 秒
/// - `attested_onsets`: false (母音間の子音はすべて後続音節の頭子音)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnrichConfig {
    #[serde(default = "default_min_pause_duration")]
    pub min_pause_duration: f64,
    #[serde(default)]
    pub attested_onsets: bool,
}

/// 重心の集計単位
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CentroidScope {
    /// 話者 × 母音ラベルごと
    Speaker,
    /// 母音ラベルごと (コーパス全体)
    Corpus,
}

/// フォルマント精緻化の設定
///
/// # デフォルト値
///
/// - `prototypes`: None (フォルマント処理を要求した場合は必須)
/// - `duration_threshold`: 0.05 秒 (これ未満の母音は除外)
/// - `iterations`: 20 回
/// - `track_points`: 21 点
/// - `output_tracks`: false
/// - `prior_weight`: 5.0 (プロトタイプの擬似トークン数)
/// - `centroid_scope`: speaker
/// - `measurement_point`: 0.5 (音素内の相対位置)
/// - `min_spread_hz`: 50.0 Hz (標準偏差の下限)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FormantConfig {
    pub prototypes: Option<PathBuf>,
    #[serde(default = "default_duration_threshold")]
    pub duration_threshold: f64,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_track_points")]
    pub track_points: usize,
    #[serde(default)]
    pub output_tracks: bool,
    #[serde(default = "default_prior_weight")]
    pub prior_weight: f64,
    #[serde(default = "default_centroid_scope")]
    pub centroid_scope: CentroidScope,
    #[serde(default = "default_measurement_point")]
    pub measurement_point: f64,
    #[serde(default = "default_min_spread_hz")]
    pub min_spread_hz: f64,
    #[serde(default)]
    pub lpc: LpcConfig,
}

/// LPC測定器の設定
///
/// # デフォルト値
///
/// - `max_formant_hz`: 5500 Hz
/// - `window_length`: 0.025 秒
/// - `time_step`: 0.005 秒
/// - `pre_emphasis_from`: 50 Hz
/// - `num_formants`: [5, 4, 6] (先頭が既定の割り当て)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LpcConfig {
    #[serde(default = "default_max_formant_hz")]
    pub max_formant_hz: f64,
    #[serde(default = "default_window_length")]
    pub window_length: f64,
    #[serde(default = "default_time_step")]
    pub time_step: f64,
    #[serde(default = "default_pre_emphasis_from")]
    pub pre_emphasis_from: f64,
    #[serde(default = "default_num_formants")]
    pub num_formants: Vec<usize>,
}

/// エクスポートの種類
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Vowels,
    Sibilants,
    Words,
    Utterances,
}

/// エクスポート設定
///
/// # デフォルト値
///
/// - `output_dir`: "./extract"
/// - `kinds`: ["vowels"]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_export_kinds")]
    pub kinds: Vec<ExportKind>,
}

/// ログ出力設定
///
/// # デフォルト値
///
/// - `log_level`: "info"
/// - `log_file`: "./logs/corpus-enrich.log"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

// Default functions
fn default_corpus_name() -> String {
    "corpus".to_string()
}

fn default_corpus_root() -> PathBuf {
    PathBuf::from("./align")
}

fn default_words_tier() -> String {
    "words".to_string()
}

fn default_phones_tier() -> String {
    "phones".to_string()
}

fn default_empty_label() -> String {
    "<sil>".to_string()
}

fn default_audio_extensions() -> Vec<String> {
    vec!["wav".to_string(), "flac".to_string()]
}

fn default_min_pause_duration() -> f64 {
    0.15
}

fn default_duration_threshold() -> f64 {
    0.05
}

fn default_iterations() -> usize {
    20
}

fn default_track_points() -> usize {
    21
}

fn default_prior_weight() -> f64 {
    5.0
}

fn default_centroid_scope() -> CentroidScope {
    CentroidScope::Speaker
}

fn default_measurement_point() -> f64 {
    0.5
}

fn default_min_spread_hz() -> f64 {
    50.0
}

fn default_max_formant_hz() -> f64 {
    5500.0
}

fn default_window_length() -> f64 {
    0.025
}

fn default_time_step() -> f64 {
    0.005
}

fn default_pre_emphasis_from() -> f64 {
    50.0
}

fn default_num_formants() -> Vec<usize> {
    vec![5, 4, 6]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./extract")
}

fn default_export_kinds() -> Vec<ExportKind> {
    vec![ExportKind::Vowels]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("./logs/corpus-enrich.log"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus: CorpusConfig::default(),
            labels: LabelConfig::default(),
            import: ImportConfig::default(),
            enrich: EnrichConfig::default(),
            formants: FormantConfig::default(),
            export: ExportConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            name: default_corpus_name(),
            root: default_corpus_root(),
            database: None,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            words_tier: default_words_tier(),
            phones_tier: default_phones_tier(),
            empty_label: default_empty_label(),
            audio_extensions: default_audio_extensions(),
        }
    }
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            min_pause_duration: default_min_pause_duration(),
            attested_onsets: false,
        }
    }
}

impl Default for FormantConfig {
    fn default() -> Self {
        Self {
            prototypes: None,
            duration_threshold: default_duration_threshold(),
            iterations: default_iterations(),
            track_points: default_track_points(),
            output_tracks: false,
            prior_weight: default_prior_weight(),
            centroid_scope: default_centroid_scope(),
            measurement_point: default_measurement_point(),
            min_spread_hz: default_min_spread_hz(),
            lpc: LpcConfig::default(),
        }
    }
}

impl Default for LpcConfig {
    fn default() -> Self {
        Self {
            max_formant_hz: default_max_formant_hz(),
            window_length: default_window_length(),
            time_step: default_time_step(),
            pre_emphasis_from: default_pre_emphasis_from(),
            num_formants: default_num_formants(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            kinds: default_export_kinds(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: default_log_file(),
        }
    }
}

/// 検証済みのラベル集合
///
/// 実行開始時に一度だけ解決され、以降のステージはこれを参照する。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSets {
    pub vowels: BTreeSet<String>,
    pub sibilants: BTreeSet<String>,
    pub syllabics: BTreeSet<String>,
    pub pauses: BTreeSet<String>,
    pub extra: BTreeMap<String, BTreeSet<String>>,
}

impl LabelConfig {
    /// ラベル設定を検証して `LabelSets` に解決する
    ///
    /// - `syllabics` 省略時は `vowels` で代用
    /// - `require_pauses` が真で `pauses` が空なら設定エラー
    /// - 母音と歯擦音の両方に属するラベルは設定エラー
    /// - 音節核とポーズの両方に属するラベルは設定エラー
    pub fn resolve(&self, require_pauses: bool) -> Result<LabelSets, PipelineError> {
        let vowels: BTreeSet<String> = self.vowels.iter().cloned().collect();
        let sibilants: BTreeSet<String> = self.sibilants.iter().cloned().collect();

        let syllabics: BTreeSet<String> = match &self.syllabics {
            Some(labels) if !labels.is_empty() => labels.iter().cloned().collect(),
            _ => {
                log::warn!("音節核 (syllabics) が指定されていないため、母音 (vowels) を使用します");
                vowels.clone()
            }
        };

        let pauses: BTreeSet<String> = self
            .pauses
            .as_ref()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        if require_pauses && pauses.is_empty() {
            return Err(PipelineError::configuration(
                "no pause labels in the `labels.pauses` setting; utterance segmentation needs a pause vocabulary",
            ));
        }

        let both: Vec<&String> = vowels.intersection(&sibilants).collect();
        if !both.is_empty() {
            return Err(PipelineError::configuration(format!(
                "labels {:?} are listed as both vowels and sibilants",
                both
            )));
        }

        let both: Vec<&String> = syllabics.intersection(&pauses).collect();
        if !both.is_empty() {
            return Err(PipelineError::configuration(format!(
                "labels {:?} are listed as both syllabics and pauses",
                both
            )));
        }

        let extra = self
            .extra
            .iter()
            .map(|(name, labels)| (name.clone(), labels.iter().cloned().collect()))
            .collect();

        Ok(LabelSets {
            vowels,
            sibilants,
            syllabics,
            pauses,
            extra,
        })
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use corpus_enrich::config::Config;
    /// let config = Config::from_file("corpus.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// コーパスの永続化ファイルのパス
    pub fn database_path(&self) -> PathBuf {
        self.corpus
            .database
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.corpus.json", self.corpus.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.enrich.min_pause_duration, 0.15);
        assert_eq!(config.formants.duration_threshold, 0.05);
        assert_eq!(config.formants.iterations, 20);
        assert_eq!(config.formants.track_points, 21);
        assert!(!config.formants.output_tracks);
        assert_eq!(config.formants.centroid_scope, CentroidScope::Speaker);
        assert_eq!(config.formants.lpc.num_formants, vec![5, 4, 6]);
        assert_eq!(config.import.empty_label, "<sil>");
        assert_eq!(config.export.kinds, vec![ExportKind::Vowels]);
        assert_eq!(config.database_path(), PathBuf::from("corpus.corpus.json"));
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        Config::write_default(path).unwrap();

        let config = Config::from_file(path).unwrap();
        assert_eq!(config.formants.iterations, 20);
        assert_eq!(config.import.words_tier, "words");
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[corpus]
name = "AssNat"
root = "../align"
database = "/tmp/assnat.json"

[labels]
vowels = ["a", "e", "i", "o", "u", "E", "O"]
sibilants = ["s", "z", "S", "Z"]
pauses = ["<sil>", "sp"]

[labels.extra]
fricative = ["f", "v", "s", "z", "S", "Z"]

[enrich]
min_pause_duration = 0.2
attested_onsets = true

[formants]
prototypes = "meta/prototypes.csv"
iterations = 10
output_tracks = true
centroid_scope = "corpus"

[formants.lpc]
num_formants = [5]

[export]
output_dir = "../extract"
kinds = ["vowels", "utterances"]

[output]
log_level = "debug"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.corpus.name, "AssNat");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/assnat.json"));
        assert_eq!(config.labels.vowels.len(), 7);
        assert!(config.labels.syllabics.is_none());
        assert_eq!(config.labels.extra["fricative"].len(), 6);
        assert_eq!(config.enrich.min_pause_duration, 0.2);
        assert!(config.enrich.attested_onsets);
        assert_eq!(
            config.formants.prototypes,
            Some(PathBuf::from("meta/prototypes.csv"))
        );
        assert_eq!(config.formants.iterations, 10);
        assert!(config.formants.output_tracks);
        assert_eq!(config.formants.centroid_scope, CentroidScope::Corpus);
        assert_eq!(config.formants.lpc.num_formants, vec![5]);
        // 指定していない値はデフォルト
        assert_eq!(config.formants.track_points, 21);
        assert_eq!(config.formants.lpc.max_formant_hz, 5500.0);
        assert_eq!(
            config.export.kinds,
            vec![ExportKind::Vowels, ExportKind::Utterances]
        );
        assert_eq!(config.output.log_level, "debug");
        assert_eq!(
            config.output.log_file,
            Some(PathBuf::from("./logs/corpus-enrich.log"))
        );
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = Config::load_or_default("nonexistent_file.toml").unwrap();
        assert_eq!(config.corpus.name, "corpus");
    }

    #[test]
    fn test_syllabics_fall_back_to_vowels() {
        let config = LabelConfig {
            vowels: labels(&["a", "i"]),
            pauses: Some(labels(&["<sil>"])),
            ..Default::default()
        };
        let sets = config.resolve(true).unwrap();
        assert_eq!(sets.syllabics, sets.vowels);
    }

    #[test]
    fn test_missing_pauses_is_fatal_only_when_required() {
        let config = LabelConfig {
            vowels: labels(&["a"]),
            pauses: None,
            ..Default::default()
        };
        let err = config.resolve(true).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("pauses"));
        assert!(config.resolve(false).is_ok());

        let empty = LabelConfig {
            pauses: Some(vec![]),
            ..config
        };
        assert!(empty.resolve(true).is_err());
    }

    #[test]
    fn test_vowel_sibilant_overlap_rejected() {
        let config = LabelConfig {
            vowels: labels(&["a", "s"]),
            sibilants: labels(&["s", "z"]),
            pauses: Some(labels(&["<sil>"])),
            ..Default::default()
        };
        let err = config.resolve(true).unwrap_err();
        assert!(err.to_string().contains("both vowels and sibilants"));
    }

    #[test]
    fn test_syllabic_pause_overlap_rejected() {
        let config = LabelConfig {
            vowels: labels(&["a"]),
            syllabics: Some(labels(&["a", "sp"])),
            pauses: Some(labels(&["sp"])),
            ..Default::default()
        };
        assert!(config.resolve(true).is_err());
    }
}
