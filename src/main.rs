//! mlmap コマンドライン
//!
//! 注釈ファイルから学習データを作って分類器を学習し、タイルを走査します。

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use mlmap_lib::dataset::{JsonFileStore, TrainingPersistence};
use mlmap_lib::extraction::{ExtractorGate, PatchExtractor, PretrainedExtractor};
use mlmap_lib::logging::init_logging;
use mlmap_lib::ml::{
    cancel_flag, CnnFeatureExtractor, CpuBackend, CpuTrainBackend, GpuBackend, GpuTrainBackend, InferenceEngine,
    IntervalTicker,
};
use mlmap_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType, ExtractionMode};
use mlmap_lib::tiles::{fetch_with_retry, DirectoryTileSource};
use mlmap_lib::{GeoBBox, Label, Session, TileCoord};

/// 地図タイルの注釈から分類器を学習する
#[derive(Debug, Parser)]
#[command(name = "mlmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// ログを詳しく出す（-vv でさらに詳しく）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 注釈を追加して分類器を学習する
    Train {
        /// 注釈ファイル（`[{"bbox": [min_lon, min_lat, max_lon, max_lat], "label": 0|1}]`）
        #[arg(long)]
        annotations: Option<PathBuf>,
        /// タイルディレクトリ（`{z}/{x}/{y}.png`）
        #[arg(long)]
        tiles: Option<PathBuf>,
        /// 分類器の保存先
        #[arg(short, long, default_value = "models/classifier.tar.gz")]
        output: PathBuf,
    },
    /// 保存済みの分類器でタイルを走査する
    Scan {
        /// 分類器（tar.gz）
        #[arg(long)]
        model: PathBuf,
        /// タイル座標 `z/x/y`
        #[arg(long, value_parser = parse_tile)]
        tile: TileCoord,
        /// タイルディレクトリ
        #[arg(long)]
        tiles: Option<PathBuf>,
        /// 表示する候補数
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// 注釈を削除する
    Remove {
        /// 矩形 `min_lon,min_lat,max_lon,max_lat`
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: GeoBBox,
    },
    /// 保存済みの学習データをすべて削除する
    Clear,
    /// モデルアーカイブの情報を表示する
    Info {
        /// モデル（tar.gz）
        path: PathBuf,
    },
    /// 初期化済みの重みで特徴抽出器アーカイブを作る
    InitExtractor {
        /// 出力クラス数
        #[arg(long, default_value_t = 1000)]
        classes: usize,
        /// 保存先
        #[arg(short, long, default_value = "models/extractor.tar.gz")]
        output: PathBuf,
    },
    /// 設定を管理する
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigAction {
    /// 現在の設定を表示する
    Show,
    /// デフォルト設定ファイルを作成する
    Init,
}

/// 注釈ファイルの1件
#[derive(Debug, Deserialize)]
struct AnnotationEntry {
    bbox: GeoBBox,
    label: Label,
}

fn parse_tile(s: &str) -> std::result::Result<TileCoord, String> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 3 {
        return Err(format!("タイル座標は z/x/y 形式で指定してください: {}", s));
    }
    let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| format!("{}: {}", v, e));
    Ok(TileCoord::new(parse(parts[1])?, parse(parts[2])?, parse(parts[0])?))
}

fn parse_bbox(s: &str) -> std::result::Result<GeoBBox, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("{}: {}", v, e)))
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    let array: [f64; 4] = values
        .try_into()
        .map_err(|_| format!("矩形は4つの数値で指定してください: {}", s))?;
    Ok(GeoBBox::from(array))
}

fn tile_source(arg: Option<PathBuf>, config: &AppConfig) -> Result<DirectoryTileSource> {
    let dir = arg
        .or_else(|| config.tiles.tile_dir.as_ref().map(PathBuf::from))
        .context("タイルディレクトリを --tiles か設定ファイルの tiles.tile_dir で指定してください")?;
    Ok(DirectoryTileSource::new(dir))
}

/// 特徴抽出器モードなら重みの読み込みをバックグラウンドで開始する
fn extractor_gate(config: &AppConfig) -> Result<ExtractorGate> {
    let gate = ExtractorGate::new();
    if config.extraction.mode != ExtractionMode::Pretrained {
        return Ok(gate);
    }
    let path = config
        .extraction
        .extractor_path
        .clone()
        .context("特徴抽出器モードでは extraction.extractor_path が必要です")?;

    gate.spawn_load(async move {
        let loaded = tokio::task::spawn_blocking(move || CnnFeatureExtractor::<CpuBackend>::load(&path, NdArrayDevice::Cpu))
            .await
            .map_err(|e| mlmap_lib::MlMapError::Task(e.to_string()))?;
        let extractor = loaded.map_err(|e| mlmap_lib::MlMapError::ExtractorLoad(format!("{:#}", e)))?;
        Ok::<_, mlmap_lib::MlMapError>(Arc::new(extractor) as Arc<dyn PretrainedExtractor>)
    });
    Ok(gate)
}

fn read_annotations(path: &Path) -> Result<Vec<AnnotationEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("注釈ファイルを読み込めません: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("注釈ファイルの形式が不正です: {}", path.display()))
}

async fn run_train<B: AutodiffBackend>(
    config: AppConfig,
    device: B::Device,
    annotations: Option<PathBuf>,
    tiles: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let source = Arc::new(tile_source(tiles, &config)?);
    let persistence = JsonFileStore::open(&config.storage.store_path, config.tiles.zoom)?;
    let gate = extractor_gate(&config)?;
    let mut session = Session::<B>::new(config.clone(), Box::new(persistence), gate, device)?;

    session.restore(source.as_ref()).await?;

    if let Some(path) = annotations {
        for entry in read_annotations(&path)? {
            let report = session.annotate(entry.bbox, entry.label, Arc::clone(&source)).await?;
            if !report.failed_tiles.is_empty() {
                warn!("{}枚のタイルを取得できませんでした", report.failed_tiles.len());
            }
        }
    }

    let cancel = cancel_flag();
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut ticker = IntervalTicker::from_settings(&config.training);
    let report = session.train(&mut ticker, &cancel).await?;
    println!(
        "学習完了: {} tick, {} ステップ, 最終損失 {}",
        report.ticks,
        report.steps,
        report.final_loss.map_or("-".to_string(), |l| format!("{:.6}", l))
    );

    session.save_model(&output)?;
    println!("分類器を保存しました: {}", mlmap_lib::model::archive_path(&output).display());
    Ok(())
}

async fn run_scan<B: Backend>(
    config: AppConfig,
    device: B::Device,
    model: PathBuf,
    coord: TileCoord,
    tiles: Option<PathBuf>,
    top: usize,
) -> Result<()> {
    let engine = InferenceEngine::<B>::load(&model, device)?;
    let metadata = engine.metadata();
    if metadata.zoom != coord.z {
        warn!("分類器の学習ズーム ({}) と走査タイルのズーム ({}) が異なります", metadata.zoom, coord.z);
    }

    let extractor = PatchExtractor::new(metadata.extraction_mode, metadata.input_size);
    let pretrained = match metadata.extraction_mode {
        ExtractionMode::Raw => None,
        ExtractionMode::Pretrained => Some(extractor_gate(&config)?.wait_ready().await?),
    };

    let source = tile_source(tiles, &config)?;
    let raster = fetch_with_retry(&source, coord, config.tiles.fetch_retries).await?;
    let candidates = engine.scan_tile(&extractor, &raster, coord, pretrained.as_deref())?;

    println!("タイル {} の候補:", coord);
    for candidate in candidates.iter().take(top) {
        let b = candidate.bbox;
        println!(
            "  score {:.4}  px ({}, {})-({}, {})  bbox [{:.6}, {:.6}, {:.6}, {:.6}]",
            candidate.score,
            candidate.crop.min_x,
            candidate.crop.min_y,
            candidate.crop.max_x,
            candidate.crop.max_y,
            b.min_lon,
            b.min_lat,
            b.max_lon,
            b.max_lat
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default_from(&config_path);

    match cli.command {
        Command::Train { annotations, tiles, output } => match config.device_type {
            DeviceType::Cpu => run_train::<CpuTrainBackend>(config, NdArrayDevice::Cpu, annotations, tiles, output).await,
            DeviceType::Wgpu => run_train::<GpuTrainBackend>(config, WgpuDevice::default(), annotations, tiles, output).await,
        },
        Command::Scan { model, tile, tiles, top } => match config.device_type {
            DeviceType::Cpu => run_scan::<CpuBackend>(config, NdArrayDevice::Cpu, model, tile, tiles, top).await,
            DeviceType::Wgpu => run_scan::<GpuBackend>(config, WgpuDevice::default(), model, tile, tiles, top).await,
        },
        Command::Remove { bbox } => {
            let mut store = JsonFileStore::open(&config.storage.store_path, config.tiles.zoom)?;
            let removed = store.delete_bbox(&bbox)?;
            println!("{}件の保存データを削除しました", removed);
            Ok(())
        }
        Command::Clear => {
            let mut store = JsonFileStore::open(&config.storage.store_path, config.tiles.zoom)?;
            store.clear()?;
            println!("保存データをすべて削除しました");
            Ok(())
        }
        Command::Info { path } => {
            let metadata = load_metadata(&path)?;
            print_metadata_info(&metadata);
            Ok(())
        }
        Command::InitExtractor { classes, output } => {
            let extractor =
                CnnFeatureExtractor::<CpuBackend>::new(classes, config.extraction.canonical_size, NdArrayDevice::Cpu)?;
            extractor.save(&output)?;
            info!("特徴抽出器を作成しました: {} ({}クラス)", output.display(), classes);
            Ok(())
        }
        Command::Config { action } => {
            match action {
                ConfigAction::Show => config.display(),
                ConfigAction::Init => {
                    if config_path.exists() {
                        anyhow::bail!("設定ファイルはすでに存在します: {}", config_path.display());
                    }
                    AppConfig::default().save(&config_path)?;
                    println!("設定ファイルを作成しました: {}", config_path.display());
                }
            }
            Ok(())
        }
    }
}
