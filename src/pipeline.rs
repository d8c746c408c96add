use crate::classify::classify_corpus;
use crate::config::{Config, EnrichConfig, ExportConfig, FormantConfig, ImportConfig, LabelSets};
use crate::error::{PipelineError, Result};
use crate::export::export_corpus;
use crate::formant::FormantRefiner;
use crate::import::import_corpus;
use crate::measure::{FormantMeasurer, LpcFormantMeasurer};
use crate::prototype::PrototypeTable;
use crate::query::log_phoneset;
use crate::rate::annotate_corpus;
use crate::store::{AnnotationStore, Corpus};
use crate::summary::RunSummary;
use crate::syllabify::syllabify_corpus;
use crate::utterance::segment_corpus;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// 実行する手続き
///
/// 宣言順がそのまま実行順になる。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Procedure {
    /// 永続化されたコーパスを削除
    Reset,
    /// TextGridの取り込み
    Import,
    /// 音素目録の要約をログに出力
    Phones,
    /// ラベル集合のタグ付け
    Classify,
    /// 音節化・発話分割・発話速度
    Enrich,
    /// フォルマントの測定と精緻化
    Formants,
    /// CSVの書き出し
    Export,
    /// reset 以外のすべて
    All,
}

impl Procedure {
    /// 終了時にコーパスの保存が必要な手続きか
    ///
    /// `reset` はファイル自体を削除するので含めない。
    pub fn mutates(self) -> bool {
        !matches!(self, Procedure::Reset | Procedure::Phones | Procedure::Export)
    }
}

/// 検証済みの実行設定
///
/// ステージを開始する前に `Config::resolve` で一度だけ作る。
#[derive(Clone, Debug)]
pub struct Settings {
    pub corpus_name: String,
    pub root: PathBuf,
    pub database: PathBuf,

    /// 実行する手続き (`All` は展開済み)
    pub procedures: BTreeSet<Procedure>,

    pub labels: LabelSets,
    pub import: ImportConfig,
    pub enrich: EnrichConfig,
    pub formants: FormantConfig,

    /// フォルマント処理を行う場合のみ読み込む
    pub prototypes: Option<PrototypeTable>,

    pub export: ExportConfig,
}

impl Settings {
    pub fn runs(&self, procedure: Procedure) -> bool {
        self.procedures.contains(&procedure)
    }

    /// 書き出す軌跡の点数 (`output_tracks` が偽なら `None`)
    pub fn track_points(&self) -> Option<usize> {
        self.formants.output_tracks.then_some(self.formants.track_points)
    }
}

impl Config {
    /// 要求された手続きに対して設定を検証する
    ///
    /// `enrich` は `classify` を含む。`all` はプロトタイプ表が設定されていない
    /// 場合にフォルマント処理を省く。
    ///
    /// # Errors
    ///
    /// 設定の不備はすべて `PipelineError::Configuration`。
    pub fn resolve(&self, requested: &[Procedure]) -> Result<Settings> {
        if requested.is_empty() {
            return Err(PipelineError::configuration("no procedure requested"));
        }

        let mut procedures = BTreeSet::new();
        for &procedure in requested {
            match procedure {
                Procedure::All => {
                    procedures.extend([
                        Procedure::Import,
                        Procedure::Phones,
                        Procedure::Classify,
                        Procedure::Enrich,
                        Procedure::Export,
                    ]);
                    if self.formants.prototypes.is_some() {
                        procedures.insert(Procedure::Formants);
                    } else {
                        log::warn!("プロトタイプ表が設定されていないため、フォルマント処理を省きます");
                    }
                }
                Procedure::Enrich => {
                    procedures.extend([Procedure::Classify, Procedure::Enrich]);
                }
                other => {
                    procedures.insert(other);
                }
            }
        }

        let enrich = procedures.contains(&Procedure::Enrich);
        let labels = self.labels.resolve(enrich)?;

        if enrich {
            let min_pause = self.enrich.min_pause_duration;
            if !min_pause.is_finite() || min_pause < 0.0 {
                return Err(PipelineError::configuration(format!(
                    "enrich.min_pause_duration must be a non-negative number, got {}",
                    min_pause
                )));
            }
        }

        let prototypes = if procedures.contains(&Procedure::Formants) {
            validate_formants(&self.formants)?;
            let path = self.formants.prototypes.as_ref().ok_or_else(|| {
                PipelineError::configuration("formant refinement needs a prototype table (`formants.prototypes`)")
            })?;
            Some(PrototypeTable::from_file(path)?)
        } else {
            None
        };

        if procedures.contains(&Procedure::Export) && self.export.kinds.is_empty() {
            return Err(PipelineError::configuration("export.kinds is empty"));
        }

        Ok(Settings {
            corpus_name: self.corpus.name.clone(),
            root: self.corpus.root.clone(),
            database: self.database_path(),
            procedures,
            labels,
            import: self.import.clone(),
            enrich: self.enrich.clone(),
            formants: self.formants.clone(),
            prototypes,
            export: self.export.clone(),
        })
    }
}

fn validate_formants(config: &FormantConfig) -> Result<()> {
    let invalid = |field: &str, value: String| {
        Err(PipelineError::configuration(format!(
            "formants.{} is out of range: {}",
            field, value
        )))
    };
    if !config.duration_threshold.is_finite() || config.duration_threshold < 0.0 {
        return invalid("duration_threshold", config.duration_threshold.to_string());
    }
    if config.iterations == 0 {
        return invalid("iterations", "0".to_string());
    }
    if config.output_tracks && config.track_points < 2 {
        return invalid("track_points", config.track_points.to_string());
    }
    if !(0.0..=1.0).contains(&config.measurement_point) {
        return invalid("measurement_point", config.measurement_point.to_string());
    }
    if !config.prior_weight.is_finite() || config.prior_weight < 0.0 {
        return invalid("prior_weight", config.prior_weight.to_string());
    }
    if !config.min_spread_hz.is_finite() || config.min_spread_hz <= 0.0 {
        return invalid("min_spread_hz", config.min_spread_hz.to_string());
    }
    Ok(())
}

/// 手続きを順に実行するパイプライン
///
/// ```text
/// reset → import → phones → classify → enrich → formants → export
///                                    (syllabify, segment, rate)
/// ```
pub struct Pipeline {
    settings: Settings,
    /// `formants` を実行しない場合は None
    measurer: Option<Box<dyn FormantMeasurer>>,
}

impl Pipeline {
    /// 設定された LPC 測定器でパイプラインを作る
    ///
    /// LPC 設定は `formants` を実行する場合のみ検証する。
    pub fn new(settings: Settings) -> Result<Self> {
        let measurer: Option<Box<dyn FormantMeasurer>> = if settings.runs(Procedure::Formants) {
            Some(Box::new(LpcFormantMeasurer::new(&settings.formants.lpc)?))
        } else {
            None
        };
        Ok(Self { settings, measurer })
    }

    /// 測定器を差し替えてパイプラインを作る
    pub fn with_measurer(settings: Settings, measurer: Box<dyn FormantMeasurer>) -> Self {
        Self {
            settings,
            measurer: Some(measurer),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 永続化されたコーパスに対して実行し、変更があれば保存する
    pub fn run(&self) -> Result<RunSummary> {
        let database = &self.settings.database;
        if self.settings.runs(Procedure::Reset) && Corpus::remove_file(database)? {
            log::info!("コーパスを削除しました: {:?}", database);
        }

        let mut corpus = Corpus::load_or_new(database, &self.settings.corpus_name)?;
        log::info!(
            "コーパス {}: {} 話者, {} 単語, {} 音素",
            corpus.name,
            corpus.speakers().len(),
            corpus.word_count(),
            corpus.phone_count()
        );

        let summary = self.run_on(&mut corpus)?;

        if self.settings.procedures.iter().any(|p| p.mutates()) {
            corpus.save(database)?;
            log::info!("コーパスを保存しました: {:?}", database);
        }
        Ok(summary)
    }

    /// ストアに対して手続きを実行する (永続化はしない)
    pub fn run_on<S: AnnotationStore + ?Sized>(&self, store: &mut S) -> Result<RunSummary> {
        let settings = &self.settings;
        let mut summary = RunSummary::default();

        if settings.runs(Procedure::Reset) {
            store.reset();
        }

        if settings.runs(Procedure::Import) {
            if !store.tiers().is_empty() {
                log::warn!("既存の談話を破棄して取り込み直します");
                store.reset();
            }
            summary.push(import_corpus(store, &settings.root, &settings.import)?);
            for t in store.tiers() {
                log::debug!(
                    "{} / {}: {} 単語, {} 音素",
                    t.discourse,
                    t.tier.speaker,
                    t.tier.words.len(),
                    t.tier.phones.len()
                );
            }
        }

        if settings.runs(Procedure::Phones) {
            log_phoneset(store);
        }

        if settings.runs(Procedure::Classify) {
            summary.push(classify_corpus(store, &settings.labels)?);
        }

        if settings.runs(Procedure::Enrich) {
            log::info!("音節を作成...");
            summary.push(syllabify_corpus(store, settings.enrich.attested_onsets));
            log::info!("発話を作成...");
            summary.push(segment_corpus(
                store,
                &settings.labels.pauses,
                settings.enrich.min_pause_duration,
            )?);
            log::info!("発話速度を計算...");
            summary.push(annotate_corpus(store));
        }

        if settings.runs(Procedure::Formants) {
            let prototypes = settings.prototypes.as_ref().ok_or_else(|| {
                PipelineError::configuration("formant refinement needs a prototype table (`formants.prototypes`)")
            })?;
            let measurer = self
                .measurer
                .as_deref()
                .ok_or_else(|| PipelineError::configuration("formant refinement needs a formant measurer"))?;
            let refiner = FormantRefiner::new(measurer, prototypes, &settings.formants);
            summary.push(refiner.run(store)?);
        }

        if settings.runs(Procedure::Export) {
            summary.push(export_corpus(
                store,
                &settings.export.output_dir,
                &settings.export.kinds,
                settings.track_points(),
            )?);
        }

        Ok(summary)
    }
}
