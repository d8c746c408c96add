use std::path::PathBuf;
use thiserror::Error;

/// パイプラインのエラー
///
/// - `Configuration`: 致命的。どのステージも開始する前に実行を中止する
/// - `MalformedInterval` / `MeasurementUnavailable`: 項目単位。
///   該当項目をスキップしてログに記録し、バッチは継続する
/// - その他: 入出力まわりの失敗
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed interval {label:?} [{begin:.4}, {end:.4}): {reason}")]
    MalformedInterval {
        label: String,
        begin: f64,
        end: f64,
        reason: String,
    },

    #[error("measurement unavailable for {label:?} [{begin:.4}, {end:.4}): {reason}")]
    MeasurementUnavailable {
        label: String,
        begin: f64,
        end: f64,
        reason: String,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error while {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("TextGrid parse error in {path}: {message}")]
    TextGrid { path: PathBuf, message: String },

    #[error("audio error in {path}: {message}")]
    Audio { path: PathBuf, message: String },
}

impl PipelineError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn malformed(interval: &crate::types::Interval, reason: impl Into<String>) -> Self {
        Self::MalformedInterval {
            label: interval.label.clone(),
            begin: interval.begin,
            end: interval.end,
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(interval: &crate::types::Interval, reason: impl Into<String>) -> Self {
        Self::MeasurementUnavailable {
            label: interval.label.clone(),
            begin: interval.begin,
            end: interval.end,
            reason: reason.into(),
        }
    }

    /// 実行全体を中止すべきエラーかどうか
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MalformedInterval { .. } | Self::MeasurementUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
