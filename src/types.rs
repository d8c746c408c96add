use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

/// 区間の包含判定に使う許容誤差 (秒)
///
/// TextGridの時刻は小数点以下の丸めを含むため、厳密比較では
/// 隣接する区間の境界が一致しないことがある。
pub const TIME_EPSILON: f64 = 1e-6;

/// 注釈レベル
///
/// サブセットタグを付与する対象の種類。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationLevel {
    /// 音素
    Phone,
    /// 単語
    Word,
}

impl std::fmt::Display for AnnotationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotationLevel::Phone => write!(f, "phone"),
            AnnotationLevel::Word => write!(f, "word"),
        }
    }
}

/// ラベル付きの時間区間
///
/// `[begin, end)` の半開区間。時刻は談話の先頭からの秒数。
///
/// # Examples
///
/// ```
/// # use corpus_enrich::types::Interval;
/// let vowel = Interval::new("a", 0.10, 0.25);
/// assert!((vowel.duration() - 0.15).abs() < 1e-9);
/// assert!(vowel.is_well_formed());
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Interval {
    /// ラベル (音素記号、単語綴りなど)
    pub label: String,

    /// 開始時刻 (秒)
    pub begin: f64,

    /// 終了時刻 (秒)
    pub end: f64,
}

impl Interval {
    pub fn new(label: impl Into<String>, begin: f64, end: f64) -> Self {
        Self {
            label: label.into(),
            begin,
            end,
        }
    }

    /// 区間の長さ (秒)
    pub fn duration(&self) -> f64 {
        self.end - self.begin
    }

    /// `begin < end` かつ両端が有限値かどうか
    pub fn is_well_formed(&self) -> bool {
        self.begin.is_finite() && self.end.is_finite() && self.begin < self.end
    }

    /// `other` がこの区間に完全に含まれるかどうか
    pub fn contains(&self, other: &Interval) -> bool {
        other.begin >= self.begin - TIME_EPSILON && other.end <= self.end + TIME_EPSILON
    }

    /// 2つの区間が重なっているかどうか (端点の接触は重なりとみなさない)
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.begin < other.end - TIME_EPSILON && other.begin < self.end - TIME_EPSILON
    }

    /// 区間内の相対位置 (0.0 ~ 1.0) を絶対時刻に変換
    pub fn time_at(&self, relative: f64) -> f64 {
        self.begin + self.duration() * relative
    }
}

/// 音素インスタンス
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Phone {
    pub interval: Interval,

    /// 所属する単語のインデックス (同じ話者ティア内)
    ///
    /// どの単語にも含まれない音素は `None`。
    pub word: Option<usize>,

    /// 所属する音節のインデックス (音節化の後に設定される)
    #[serde(default)]
    pub syllable: Option<usize>,

    /// 精緻化されたフォルマント値 (母音のみ)
    #[serde(default)]
    pub formants: Option<FormantMeasurement>,
}

impl Phone {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            word: None,
            syllable: None,
            formants: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.interval.label
    }
}

/// 単語インスタンス
///
/// 子の音素は話者ティアの `phones` 上の連続した範囲として保持する。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Word {
    pub interval: Interval,

    /// 子音素の範囲 (話者ティアの `phones` へのインデックス)
    pub phones: Range<usize>,

    /// 音節数 (Rate/Count 付与の後に設定される)
    #[serde(default)]
    pub num_syllables: Option<u32>,

    /// 所属する発話のインデックス (ポーズ単語は常に `None`)
    #[serde(default)]
    pub utterance: Option<usize>,
}

impl Word {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            phones: 0..0,
            num_syllables: None,
            utterance: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.interval.label
    }

    /// 子音素ラベルを空白区切りで連結した発音表記
    pub fn transcription(&self, phones: &[Phone]) -> String {
        phones[self.phones.clone()]
            .iter()
            .map(|p| p.label())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 音節 (派生区間)
///
/// 1つの単語内の連続した音素列で、核 (syllabic) を1つだけ含む。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Syllable {
    /// 区間。ラベルは構成音素を `.` で連結したもの
    pub interval: Interval,

    /// 構成音素の範囲 (話者ティアの `phones` へのインデックス)
    pub phones: Range<usize>,

    /// 核音素のインデックス
    pub nucleus: usize,

    /// 所属する単語のインデックス
    pub word: usize,
}

impl Syllable {
    /// 頭子音の数
    pub fn onset_len(&self) -> usize {
        self.nucleus - self.phones.start
    }

    /// 尾子音の数
    pub fn coda_len(&self) -> usize {
        self.phones.end - self.nucleus - 1
    }
}

/// 発話 (派生区間)
///
/// 長いポーズで区切られた連続した単語列。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Utterance {
    pub interval: Interval,

    /// 構成単語の範囲 (話者ティアの `words` へのインデックス)
    ///
    /// 範囲は閾値未満の短いポーズ単語をまたぐことがあるが、
    /// ポーズ単語は発話の構成要素ではない (`Word::utterance` は `None`)。
    pub words: Range<usize>,

    /// 発話速度 (音節/秒)。長さ0の発話では `None`
    #[serde(default)]
    pub speech_rate: Option<f64>,
}

/// 1話者分の注釈ティア
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SpeakerTier {
    /// 話者名
    pub speaker: String,

    /// 単語 (開始時刻順、重なりなし)
    pub words: Vec<Word>,

    /// 音素 (開始時刻順、重なりなし)
    pub phones: Vec<Phone>,

    /// 音節 (派生)
    #[serde(default)]
    pub syllables: Vec<Syllable>,

    /// 発話 (派生)
    #[serde(default)]
    pub utterances: Vec<Utterance>,
}

impl SpeakerTier {
    pub fn new(speaker: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            ..Default::default()
        }
    }

    /// 音素を含む発話のインデックス
    pub fn utterance_of_phone(&self, phone: usize) -> Option<usize> {
        let word = self.phones.get(phone)?.word?;
        self.words.get(word)?.utterance
    }
}

/// 談話 (1つの録音セッション)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Discourse {
    /// 談話名 (TextGridのファイル名から拡張子を除いたもの)
    pub name: String,

    /// 対応する音声ファイル
    pub audio_path: Option<PathBuf>,

    /// 話者ティア
    pub tiers: Vec<SpeakerTier>,
}

/// フォルマント軌跡の1サンプル
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct TrackPoint {
    /// 音素内の相対時刻 (0.0 ~ 1.0)
    pub time: f64,
    pub f1: Option<f64>,
    pub f2: Option<f64>,
    pub f3: Option<f64>,
}

/// 母音1つ分のフォルマント測定結果
///
/// # JSON出力例
///
/// ```json
/// {
///   "f1": 512.3,
///   "f2": 1488.0,
///   "f3": 2490.1,
///   "candidate": "lpc5",
///   "track": null
/// }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FormantMeasurement {
    pub f1: f64,
    pub f2: f64,
    pub f3: Option<f64>,

    /// 採用された候補 (フォルマント番号の割り当て) の識別子
    pub candidate: String,

    /// 固定点数に再サンプリングされた軌跡 (`output_tracks` 有効時のみ)
    pub track: Option<Vec<TrackPoint>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_duration_and_shape() {
        let interval = Interval::new("a", 1.0, 1.5);
        assert!((interval.duration() - 0.5).abs() < 1e-12);
        assert!(interval.is_well_formed());

        assert!(!Interval::new("x", 1.0, 1.0).is_well_formed());
        assert!(!Interval::new("x", 2.0, 1.0).is_well_formed());
        assert!(!Interval::new("x", f64::NAN, 1.0).is_well_formed());
    }

    #[test]
    fn test_interval_contains_with_rounding() {
        let word = Interval::new("bonjour", 0.5, 1.0);
        assert!(word.contains(&Interval::new("b", 0.5, 0.6)));
        assert!(word.contains(&Interval::new("R", 0.9, 1.0000000001)));
        assert!(!word.contains(&Interval::new("x", 0.4, 0.6)));
    }

    #[test]
    fn test_interval_overlap_ignores_touching() {
        let a = Interval::new("a", 0.0, 0.5);
        let b = Interval::new("b", 0.5, 1.0);
        let c = Interval::new("c", 0.4, 0.6);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_word_transcription() {
        let phones = vec![
            Phone::new(Interval::new("b", 0.0, 0.1)),
            Phone::new(Interval::new("O~", 0.1, 0.2)),
            Phone::new(Interval::new("Z", 0.2, 0.3)),
        ];
        let mut word = Word::new(Interval::new("bonjour", 0.0, 0.3));
        word.phones = 0..3;
        assert_eq!(word.transcription(&phones), "b O~ Z");
    }

    #[test]
    fn test_formant_measurement_json_serialization() {
        let measurement = FormantMeasurement {
            f1: 500.0,
            f2: 1500.0,
            f3: None,
            candidate: "lpc5".to_string(),
            track: None,
        };
        let json = serde_json::to_string(&measurement).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["f1"], 500.0);
        assert_eq!(parsed["candidate"], "lpc5");
        assert!(parsed["track"].is_null());
    }
}
