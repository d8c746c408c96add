use anyhow::{Context, Result};
use clap::Parser;
use corpus_enrich::config::Config;
use corpus_enrich::pipeline::{Pipeline, Procedure};
use env_logger::{Env, Target};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// 強制アライメント済みコーパスに音節・発話・発話速度・母音フォルマントを付与する
#[derive(Parser, Debug)]
#[command(name = "corpus-enrich", version, about)]
struct Args {
    /// 設定ファイル (TOML)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// アライメントのルートディレクトリ (corpus.root を上書き)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// コーパス名 (corpus.name を上書き)
    #[arg(long)]
    corpus: Option<String>,

    /// 実行する手続き (複数指定可)
    #[arg(short, long = "procedure", value_enum, default_values_t = [Procedure::All])]
    procedures: Vec<Procedure>,

    /// デフォルト設定ファイルを書き出して終了
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "config.toml")]
    generate_config: Option<PathBuf>,
}

/// 標準エラーとログファイルの両方に書く
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logger(level: &str, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        )
    });

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("ログディレクトリの作成に失敗: {:?}", parent))?;
            }
        }
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("ログファイルを開けません: {:?}", path))?;
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 設定ファイル生成モード
    if let Some(path) = &args.generate_config {
        Config::write_default(path)?;
        println!("設定ファイルを生成しました: {:?}", path);
        return Ok(());
    }

    let mut config = Config::load_or_default(&args.config)?;
    if let Some(dir) = args.dir {
        config.corpus.root = dir;
    }
    if let Some(name) = args.corpus {
        config.corpus.name = name;
    }

    init_logger(&config.output.log_level, config.output.log_file.as_deref())?;

    log::info!("corpus-enrich を起動します");
    if !args.config.exists() {
        log::warn!("設定ファイルが見つかりません。デフォルト設定を使用します: {:?}", args.config);
    }
    log::info!("手続き: {:?}", args.procedures);
    log::debug!("設定: {:?}", config);

    let settings = config
        .resolve(&args.procedures)
        .context("設定の検証に失敗")?;
    let pipeline = Pipeline::new(settings).context("パイプラインの初期化に失敗")?;

    let summary = pipeline
        .run()
        .with_context(|| format!("コーパス {} の処理に失敗", config.corpus.name))?;
    summary.log();

    log::info!("完了しました");
    Ok(())
}
