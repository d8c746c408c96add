use crate::error::{PipelineError, Result};
use crate::types::{AnnotationLevel, Discourse, SpeakerTier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// 話者ティアの識別子 (談話インデックス, ティアインデックス)
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TierKey {
    pub discourse: usize,
    pub tier: usize,
}

/// 読み取り用の話者ティア参照
#[derive(Clone, Copy, Debug)]
pub struct TierRef<'a> {
    pub key: TierKey,
    pub discourse: &'a str,
    pub tier: &'a SpeakerTier,
}

/// 書き込み用の話者ティア参照
///
/// 各ティアは互いに独立しているため、ステージ内で並列に処理できる。
#[derive(Debug)]
pub struct TierMut<'a> {
    pub key: TierKey,
    pub tier: &'a mut SpeakerTier,
}

/// 注釈ストアのトレイト
///
/// パイプラインの各ステージはこのトレイトを通してのみ区間を読み書きする。
/// - 区間の読み出し (`tiers`)
/// - タイプ単位のサブセットタグの書き込み (`set_subset`)
/// - 派生区間・派生値の書き込み (`tiers_mut`)
pub trait AnnotationStore {
    /// コーパス名
    fn name(&self) -> &str;

    /// 全話者ティア (談話順、ティア順)
    fn tiers(&self) -> Vec<TierRef<'_>>;

    /// 全話者ティアへの可変参照
    fn tiers_mut(&mut self) -> Vec<TierMut<'_>>;

    /// 談話名
    fn discourse_name(&self, discourse: usize) -> Option<&str>;

    /// 談話の音声ファイル
    fn audio_path(&self, discourse: usize) -> Option<&Path>;

    /// 指定レベルに出現するラベル (タイプ) の集合
    fn type_labels(&self, level: AnnotationLevel) -> BTreeSet<String>;

    /// サブセットタグのラベル集合
    fn subset(&self, level: AnnotationLevel, name: &str) -> Option<&BTreeSet<String>>;

    /// サブセットタグを設定 (同名の既存タグは置き換える)
    fn set_subset(&mut self, level: AnnotationLevel, name: &str, labels: BTreeSet<String>);

    /// 登録済みのサブセット名
    fn subset_names(&self, level: AnnotationLevel) -> Vec<String>;

    /// 談話を追加し、そのインデックスを返す
    fn add_discourse(&mut self, discourse: Discourse) -> usize;

    /// 全データを削除
    fn reset(&mut self);

    /// ラベルがサブセットに属するかどうか
    fn in_subset(&self, level: AnnotationLevel, name: &str, label: &str) -> bool {
        self.subset(level, name)
            .map(|labels| labels.contains(label))
            .unwrap_or(false)
    }
}

/// インメモリのコーパス
///
/// JSONファイルとして永続化し、サブコマンド間で状態を引き継ぐ。
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Corpus {
    pub name: String,
    pub discourses: Vec<Discourse>,

    /// レベル → サブセット名 → ラベル集合
    #[serde(default)]
    pub subsets: BTreeMap<AnnotationLevel, BTreeMap<String, BTreeSet<String>>>,
}

impl Corpus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// JSONファイルから読み込み
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("reading corpus {:?}", path), e))?;
        serde_json::from_str(&data)
            .map_err(|e| PipelineError::json(format!("parsing corpus {:?}", path), e))
    }

    /// ファイルがあれば読み込み、なければ空のコーパスを作成
    pub fn load_or_new<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        if path.as_ref().exists() {
            let corpus = Self::load(path)?;
            if corpus.name != name {
                log::warn!(
                    "コーパス名が設定と異なります: ファイル={}, 設定={}",
                    corpus.name,
                    name
                );
            }
            Ok(corpus)
        } else {
            Ok(Self::new(name))
        }
    }

    /// JSONファイルに書き出し
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::io(format!("creating {:?}", parent), e))?;
            }
        }
        let data = serde_json::to_string(self)
            .map_err(|e| PipelineError::json("serializing corpus", e))?;
        fs::write(path, data).map_err(|e| PipelineError::io(format!("writing corpus {:?}", path), e))?;
        log::debug!("コーパスを保存しました: {:?}", path);
        Ok(())
    }

    /// 永続化ファイルを削除
    pub fn remove_file<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path).map_err(|e| PipelineError::io(format!("removing {:?}", path), e))?;
        Ok(true)
    }

    pub fn phone_count(&self) -> usize {
        self.discourses
            .iter()
            .flat_map(|d| d.tiers.iter())
            .map(|t| t.phones.len())
            .sum()
    }

    pub fn word_count(&self) -> usize {
        self.discourses
            .iter()
            .flat_map(|d| d.tiers.iter())
            .map(|t| t.words.len())
            .sum()
    }

    pub fn speakers(&self) -> BTreeSet<&str> {
        self.discourses
            .iter()
            .flat_map(|d| d.tiers.iter())
            .map(|t| t.speaker.as_str())
            .collect()
    }
}

impl AnnotationStore for Corpus {
    fn name(&self) -> &str {
        &self.name
    }

    fn tiers(&self) -> Vec<TierRef<'_>> {
        let mut out = Vec::new();
        for (d, discourse) in self.discourses.iter().enumerate() {
            for (t, tier) in discourse.tiers.iter().enumerate() {
                out.push(TierRef {
                    key: TierKey {
                        discourse: d,
                        tier: t,
                    },
                    discourse: &discourse.name,
                    tier,
                });
            }
        }
        out
    }

    fn tiers_mut(&mut self) -> Vec<TierMut<'_>> {
        let mut out = Vec::new();
        for (d, discourse) in self.discourses.iter_mut().enumerate() {
            for (t, tier) in discourse.tiers.iter_mut().enumerate() {
                out.push(TierMut {
                    key: TierKey {
                        discourse: d,
                        tier: t,
                    },
                    tier,
                });
            }
        }
        out
    }

    fn discourse_name(&self, discourse: usize) -> Option<&str> {
        self.discourses.get(discourse).map(|d| d.name.as_str())
    }

    fn audio_path(&self, discourse: usize) -> Option<&Path> {
        self.discourses.get(discourse)?.audio_path.as_deref()
    }

    fn type_labels(&self, level: AnnotationLevel) -> BTreeSet<String> {
        let tiers = self.discourses.iter().flat_map(|d| d.tiers.iter());
        match level {
            AnnotationLevel::Phone => tiers
                .flat_map(|t| t.phones.iter().map(|p| p.label().to_string()))
                .collect(),
            AnnotationLevel::Word => tiers
                .flat_map(|t| t.words.iter().map(|w| w.label().to_string()))
                .collect(),
        }
    }

    fn subset(&self, level: AnnotationLevel, name: &str) -> Option<&BTreeSet<String>> {
        self.subsets.get(&level)?.get(name)
    }

    fn set_subset(&mut self, level: AnnotationLevel, name: &str, labels: BTreeSet<String>) {
        self.subsets
            .entry(level)
            .or_default()
            .insert(name.to_string(), labels);
    }

    fn subset_names(&self, level: AnnotationLevel) -> Vec<String> {
        self.subsets
            .get(&level)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn add_discourse(&mut self, discourse: Discourse) -> usize {
        self.discourses.push(discourse);
        self.discourses.len() - 1
    }

    fn reset(&mut self) {
        self.discourses.clear();
        self.subsets.clear();
    }
}
