use serde::Serialize;
use std::collections::BTreeMap;

/// パイプラインのステージ
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Import,
    Classify,
    Syllabify,
    Segment,
    Rate,
    Formants,
    Export,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Import => "import",
            Stage::Classify => "classify",
            Stage::Syllabify => "syllabify",
            Stage::Segment => "segment",
            Stage::Rate => "rate",
            Stage::Formants => "formants",
            Stage::Export => "export",
        };
        write!(f, "{}", name)
    }
}

/// スキップ・劣化した項目の種類
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// 重なり・逆転した区間
    MalformedInterval,
    /// どの単語にも含まれない音素
    OrphanPhone,
    /// 音節核を持たない単語または非ポーズ音素列 (音節化されない)
    NoNucleus,
    /// 閾値より短くフォルマント測定から除外された母音
    TooShort,
    /// 測定候補が得られなかった母音
    MeasurementUnavailable,
    /// プロトタイプ表にない母音ラベル (母集団のみで重心を推定)
    MissingPrototype,
    /// 反復上限に達しても不動点に到達しなかった
    ConvergenceNotReached,
    /// 設定されたがコーパスに出現しないラベル
    UnusedLabel,
    /// 音声ファイルがない、または読み込めない談話
    MissingAudio,
    /// 読み込めないTextGridファイル
    UnreadableFile,
}

/// 1ステージ分の処理件数と問題件数
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StageReport {
    pub stage: Stage,

    /// 処理した項目数
    pub processed: usize,

    /// 種類ごとの問題件数
    pub issues: BTreeMap<IssueKind, usize>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            processed: 0,
            issues: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, kind: IssueKind) {
        self.record_n(kind, 1);
    }

    pub fn record_n(&mut self, kind: IssueKind, n: usize) {
        if n > 0 {
            *self.issues.entry(kind).or_insert(0) += n;
        }
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_issues(&self) -> usize {
        self.issues.values().sum()
    }

    /// 並列処理した部分レポートを統合
    pub fn merge(&mut self, other: StageReport) {
        self.processed += other.processed;
        for (kind, n) in other.issues {
            self.record_n(kind, n);
        }
    }

    pub fn log(&self) {
        if self.issues.is_empty() {
            log::info!("[{}] {} 件処理, 問題なし", self.stage, self.processed);
            return;
        }
        let details = self
            .issues
            .iter()
            .map(|(kind, n)| format!("{:?}={}", kind, n))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(
            "[{}] {} 件処理, スキップ/劣化 {} 件 ({})",
            self.stage,
            self.processed,
            self.total_issues(),
            details
        );
    }
}

/// 実行全体のサマリー
///
/// 正常終了した場合も、ステージごとのスキップ件数を必ず報告する。
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub reports: Vec<StageReport>,
}

impl RunSummary {
    pub fn push(&mut self, report: StageReport) {
        report.log();
        self.reports.push(report);
    }

    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.reports.iter().rev().find(|r| r.stage == stage)
    }

    pub fn log(&self) {
        log::info!("=== 実行サマリー ===");
        for report in &self.reports {
            report.log();
        }
    }
}
