//! corpus-enrich - 強制アライメント済み音声コーパスの注釈付与パイプライン
//!
//! 話者ごとのTextGrid (単語ティア・音素ティア) と音声ファイルを取り込み、
//! 音節・発話・発話速度を派生させ、母音フォルマントを精緻化してCSVに書き出す。
//!
//! # 主な機能
//!
//! - **取り込み**: MFA形式のTextGridを談話・話者ティアとして読み込む
//! - **分類**: 母音・歯擦音・音節核・ポーズなどのラベル集合をタグ付け
//! - **音節化**: 最大頭子音原則 (または語頭で観測された頭子音) による音節分割
//! - **発話分割**: 閾値以上のポーズで単語列を発話に区切る
//! - **発話速度**: 発話・単語ごとの音節数と音節/秒
//! - **フォルマント精緻化**: LPC候補の中から母音プロトタイプと話者重心に最も近いものを反復選択
//! - **エクスポート**: 母音・歯擦音・単語・発話の表をCSVで出力
//!
//! # アーキテクチャ
//!
//! ```text
//! [TextGrid + WAV/FLAC] → [import] → [Corpus (AnnotationStore)]
//!                                           ↓
//!                                      [classify]
//!                                           ↓
//!                          ┌────────────────┼────────────────┐
//!                          │                │                │
//!                     [syllabify]      [utterance]     [formant] ← [measure (LPC)]
//!                          │                │                ↑
//!                          └──────→ [rate] ←┘           [prototype]
//!                                           ↓
//!                                       [export] → [CSV]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use corpus_enrich::config::Config;
//! use corpus_enrich::pipeline::{Pipeline, Procedure};
//!
//! let config = Config::load_or_default("config.toml").unwrap();
//! let settings = config.resolve(&[Procedure::Import, Procedure::Enrich]).unwrap();
//! let summary = Pipeline::new(settings).unwrap().run().unwrap();
//! summary.log();
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod export;
pub mod formant;
pub mod import;
pub mod measure;
pub mod pipeline;
pub mod prototype;
pub mod query;
pub mod rate;
pub mod sound;
pub mod store;
pub mod summary;
pub mod syllabify;
pub mod textgrid;
pub mod types;
pub mod utterance;
