//! 注釈から学習・保存・推論までの通しテスト

#![cfg(feature = "ml")]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use burn_ndarray::NdArrayDevice;

use mlmap_lib::dataset::{JsonFileStore, MemoryStore, TrainingPersistence};
use mlmap_lib::extraction::{ExtractorGate, PretrainedExtractor};
use mlmap_lib::geo::tile_bbox;
use mlmap_lib::ml::{CnnFeatureExtractor, CpuBackend, CpuTrainBackend, InferenceEngine, ManualTicker};
use mlmap_lib::model::{load_metadata, AppConfig, ExtractionMode, ModelKind};
use mlmap_lib::tiles::{MemoryTileSource, TileRaster};
use mlmap_lib::{GeoBBox, Label, MlMapError, Session, TileCoord, TrainingKey};

const TILE: TileCoord = TileCoord { x: 10, y: 20, z: 17 };

fn small_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model.input_size = 30;
    config.model.hidden_sizes = [8, 4, 2];
    config
}

fn memory_session(config: AppConfig) -> Session<CpuTrainBackend> {
    Session::new(config, Box::new(MemoryStore::new()), ExtractorGate::new(), NdArrayDevice::Cpu).unwrap()
}

fn red_tile() -> Arc<MemoryTileSource> {
    Arc::new(MemoryTileSource::new().with_tile(TILE, TileRaster::solid(256, 256, [255, 0, 0, 255])))
}

/// 隣り合う2枚のタイルにまたがる矩形
fn straddling_bbox() -> GeoBBox {
    let left = tile_bbox(TILE);
    let right = tile_bbox(TileCoord::new(TILE.x + 1, TILE.y, TILE.z));
    let lat_pad = (left.max_lat - left.min_lat) / 4.0;
    GeoBBox::new(
        (left.min_lon + left.max_lon) / 2.0,
        left.min_lat + lat_pad,
        (right.min_lon + right.max_lon) / 2.0,
        left.max_lat - lat_pad,
    )
}

#[tokio::test]
async fn test_whole_tile_annotation_produces_red_plane() {
    let mut session = memory_session(AppConfig::default());
    let bbox = tile_bbox(TILE);

    let report = session.annotate(bbox, Label::Airplane, red_tile()).await.unwrap();
    assert_eq!(report.added, 1);
    assert!(report.failed_tiles.is_empty());

    let examples = session.store().all();
    assert_eq!(examples.len(), 1);
    let example = &examples[0];
    assert_eq!(example.key, TrainingKey::new(bbox, TILE.x, TILE.y));
    assert_eq!(example.label, Label::Airplane);
    assert_eq!(example.features.len(), 3000);
    assert!(example.features[..1000].iter().all(|&v| v == 1.0));
    assert!(example.features[1000..].iter().all(|&v| v == 0.0));

    assert_eq!(session.persistence().get_all().unwrap().len(), 1);
    assert_eq!(session.remove_annotation(&bbox).unwrap(), 1);
    assert!(session.store().is_empty());
    assert!(session.persistence().get_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_keeps_other_annotations() {
    let mut session = memory_session(small_config());
    let whole = tile_bbox(TILE);
    let quarter = GeoBBox::new(
        whole.min_lon,
        (whole.min_lat + whole.max_lat) / 2.0,
        (whole.min_lon + whole.max_lon) / 2.0,
        whole.max_lat,
    );

    session.annotate(whole, Label::Airplane, red_tile()).await.unwrap();
    session.annotate(quarter, Label::NotAirplane, red_tile()).await.unwrap();
    assert_eq!(session.store().len(), 2);

    assert_eq!(session.remove_annotation(&quarter).unwrap(), 1);
    assert_eq!(session.store().len(), 1);
    assert_eq!(session.store().all()[0].key.bbox, whole);
    assert_eq!(session.persistence().get_all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_zero_width_bbox_is_skipped() {
    let mut session = memory_session(small_config());
    let tile = tile_bbox(TILE);
    let lon = (tile.min_lon + tile.max_lon) / 2.0;
    let lat_pad = (tile.max_lat - tile.min_lat) / 4.0;
    let bbox = GeoBBox::new(lon, tile.min_lat + lat_pad, lon, tile.max_lat - lat_pad);

    let report = session.annotate(bbox, Label::Airplane, red_tile()).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.skipped_degenerate, report.tiles);
    assert!(session.store().is_empty());
}

#[tokio::test]
async fn test_missing_tile_is_skipped() {
    let mut session = memory_session(small_config());

    let report = session.annotate(straddling_bbox(), Label::NotAirplane, red_tile()).await.unwrap();
    assert_eq!(report.tiles, 2);
    assert_eq!(report.added, 1);
    assert_eq!(report.failed_tiles, vec![TileCoord::new(TILE.x + 1, TILE.y, TILE.z)]);
    assert_eq!(session.store().len(), 1);
    assert_eq!(session.store().all()[0].key.x, TILE.x);
}

#[tokio::test]
async fn test_training_run_is_capped() {
    let mut session = memory_session(small_config());
    session.annotate(tile_bbox(TILE), Label::Airplane, red_tile()).await.unwrap();
    session.annotate(straddling_bbox(), Label::NotAirplane, red_tile()).await.unwrap();

    let mut ticker = ManualTicker::new();
    let report = session.train(&mut ticker, &AtomicBool::new(false)).await.unwrap();
    assert_eq!(report.ticks, 10);
    assert_eq!(report.steps, 50);
    assert_eq!(report.loss_samples.len(), 10);
    assert!(report.final_loss.is_some_and(f64::is_finite));
    assert!(!session.trainer().is_running());

    // 2回目の学習も同じ上限で走る
    let report = session.train(&mut ticker, &AtomicBool::new(false)).await.unwrap();
    assert_eq!(report.steps, 50);
    assert_eq!(session.trainer().lifetime_steps(), 100);
}

#[tokio::test]
async fn test_saved_classifier_scores_like_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classifier.tar.gz");

    let mut session = memory_session(small_config());
    session.annotate(tile_bbox(TILE), Label::Airplane, red_tile()).await.unwrap();
    session.train(&mut ManualTicker::new(), &AtomicBool::new(false)).await.unwrap();
    session.save_model(&path).unwrap();

    let metadata = load_metadata(&path).unwrap();
    assert_eq!(metadata.kind, ModelKind::Classifier);
    assert_eq!(metadata.input_size, 30);
    assert_eq!(metadata.zoom, 17);
    assert_eq!(metadata.num_examples, 1);
    assert_eq!(metadata.steps, 50);

    let engine = InferenceEngine::<CpuBackend>::load(&path, NdArrayDevice::Cpu).unwrap();
    let features = &session.store().all()[0].features;
    let expected = session.predict(features).unwrap();
    let actual = engine.predict(features).unwrap();
    assert!((expected - actual).abs() < 1e-5, "{} != {}", expected, actual);

    let raster = TileRaster::solid(256, 256, [255, 0, 0, 255]);
    let from_session = session.scan_tile(&raster, TILE).unwrap();
    assert_eq!(from_session.len(), 16);
}

#[tokio::test]
async fn test_restore_reextracts_label_only_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("training.json");
    let mut config = small_config();
    config.storage.persist_features = false;

    let original = {
        let store = JsonFileStore::open(&store_path, 17).unwrap();
        let mut session =
            Session::<CpuTrainBackend>::new(config.clone(), Box::new(store), ExtractorGate::new(), NdArrayDevice::Cpu)
                .unwrap();
        session.annotate(tile_bbox(TILE), Label::Airplane, red_tile()).await.unwrap();
        let persisted = session.persistence().get_all().unwrap();
        assert!(persisted[0].1.features.is_none());
        session.store().all()[0].clone()
    };

    let store = JsonFileStore::open(&store_path, 17).unwrap();
    let mut session =
        Session::<CpuTrainBackend>::new(config, Box::new(store), ExtractorGate::new(), NdArrayDevice::Cpu).unwrap();
    let report = session.restore(red_tile().as_ref()).await.unwrap();
    assert_eq!(report.reextracted, 1);
    assert_eq!(report.loaded, 0);
    assert_eq!(session.store().all(), std::slice::from_ref(&original));

    // タイルが取得できなければスキップする
    let store = JsonFileStore::open(&store_path, 17).unwrap();
    let mut session =
        Session::<CpuTrainBackend>::new(small_config(), Box::new(store), ExtractorGate::new(), NdArrayDevice::Cpu)
            .unwrap();
    let report = session.restore(&MemoryTileSource::new()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(session.store().is_empty());
}

#[tokio::test]
async fn test_store_rejects_other_zoom() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("training.json");
    {
        let mut session = Session::<CpuTrainBackend>::new(
            small_config(),
            Box::new(JsonFileStore::open(&store_path, 17).unwrap()),
            ExtractorGate::new(),
            NdArrayDevice::Cpu,
        )
        .unwrap();
        session.annotate(tile_bbox(TILE), Label::Airplane, red_tile()).await.unwrap();
    }
    assert!(matches!(
        JsonFileStore::open(&store_path, 16),
        Err(MlMapError::SchemaMismatch { .. })
    ));
}

#[tokio::test]
async fn test_pretrained_mode_waits_for_extractor() {
    let mut config = small_config();
    config.model.input_size = 6;
    config.model.hidden_sizes = [4, 4, 2];
    config.extraction.mode = ExtractionMode::Pretrained;
    // 読み込んだ抽出器は自身の入力サイズ (20) で動く
    config.extraction.canonical_size = 24;

    let gate = ExtractorGate::new();
    gate.spawn_load(async {
        let extractor = CnnFeatureExtractor::<CpuBackend>::new(10, 20, NdArrayDevice::Cpu)?;
        Ok::<_, MlMapError>(Arc::new(extractor) as Arc<dyn PretrainedExtractor>)
    });

    let mut session =
        Session::<CpuTrainBackend>::new(config, Box::new(MemoryStore::new()), gate, NdArrayDevice::Cpu).unwrap();
    let report = session.annotate(tile_bbox(TILE), Label::Airplane, red_tile()).await.unwrap();
    assert_eq!(report.added, 1);
    assert!(session.gate().is_ready());

    let features = &session.store().all()[0].features;
    assert_eq!(features.len(), 6);
    assert!(features.windows(2).all(|w| w[0] >= w[1]));
    assert!(features.iter().all(|&p| (0.0..=1.0).contains(&p)));

    let raster = TileRaster::solid(256, 256, [255, 0, 0, 255]);
    let candidates = session.scan_tile(&raster, TILE).unwrap();
    assert_eq!(candidates.len(), 16);
}
