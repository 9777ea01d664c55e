//! 学習済み分類器による特徴抽出と準備完了ゲート
//!
//! 学習済み分類器の重みは起動時に非同期で読み込まれます。
//! 読み込み完了前の抽出は `get()` で即座に失敗させるか、`wait_ready()` で完了まで待機します。

use std::future::Future;
use std::sync::Arc;

use image::RgbImage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{MlMapError, Result};

/// 凍結済みの学習済み分類器
pub trait PretrainedExtractor: Send + Sync {
    /// 正方形画像を分類し、クラスごとの確率を返す
    fn infer(&self, image: &RgbImage) -> Result<Vec<f32>>;

    /// 出力クラス数
    fn num_classes(&self) -> usize;

    /// 入力画像の一辺
    fn canonical_size(&self) -> u32;
}

#[derive(Clone)]
enum GateState {
    Loading,
    Ready(Arc<dyn PretrainedExtractor>),
    Failed(String),
}

/// 特徴抽出器の準備完了ゲート
#[derive(Clone)]
pub struct ExtractorGate {
    state: Arc<watch::Sender<GateState>>,
}

impl std::fmt::Debug for ExtractorGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.borrow() {
            GateState::Loading => "loading".to_string(),
            GateState::Ready(_) => "ready".to_string(),
            GateState::Failed(e) => format!("failed: {}", e),
        };
        f.debug_struct("ExtractorGate").field("state", &state).finish()
    }
}

impl Default for ExtractorGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorGate {
    /// 読み込み待ちのゲート
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Loading);
        Self { state: Arc::new(tx) }
    }

    /// すでに読み込み済みの抽出器でゲートを作る
    pub fn ready(extractor: Arc<dyn PretrainedExtractor>) -> Self {
        let gate = Self::new();
        gate.state.send_replace(GateState::Ready(extractor));
        gate
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.borrow(), GateState::Ready(_))
    }

    /// 読み込みをバックグラウンドで開始する
    ///
    /// 読み込み完了後にダミー画像で1回推論してから準備完了にする。
    pub fn spawn_load<F>(&self, load: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<Arc<dyn PretrainedExtractor>>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let next = match load.await {
                Ok(extractor) => match warm_up(Arc::clone(&extractor)).await {
                    Ok(()) => {
                        info!("特徴抽出器の準備が完了しました ({}クラス)", extractor.num_classes());
                        GateState::Ready(extractor)
                    }
                    Err(e) => {
                        warn!("特徴抽出器のウォームアップに失敗しました: {}", e);
                        GateState::Failed(e.to_string())
                    }
                },
                Err(e) => {
                    warn!("特徴抽出器の読み込みに失敗しました: {}", e);
                    GateState::Failed(e.to_string())
                }
            };
            state.send_replace(next);
        })
    }

    /// 準備済みなら抽出器を返し、そうでなければ即座に失敗する
    pub fn get(&self) -> Result<Arc<dyn PretrainedExtractor>> {
        Self::resolve(&self.state.borrow())
    }

    /// 準備完了まで待機する
    pub async fn wait_ready(&self) -> Result<Arc<dyn PretrainedExtractor>> {
        let mut rx = self.state.subscribe();
        let guard = rx
            .wait_for(|s| !matches!(s, GateState::Loading))
            .await
            .map_err(|e| MlMapError::ExtractorLoad(e.to_string()))?;
        Self::resolve(&guard)
    }

    fn resolve(state: &GateState) -> Result<Arc<dyn PretrainedExtractor>> {
        match state {
            GateState::Loading => Err(MlMapError::ExtractorNotReady),
            GateState::Ready(extractor) => Ok(Arc::clone(extractor)),
            GateState::Failed(message) => Err(MlMapError::ExtractorLoad(message.clone())),
        }
    }
}

async fn warm_up(extractor: Arc<dyn PretrainedExtractor>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let size = extractor.canonical_size();
        extractor.infer(&RgbImage::new(size, size)).map(|_| ())
    })
    .await
    .map_err(|e| MlMapError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ConstExtractor;

    impl PretrainedExtractor for ConstExtractor {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<f32>> {
            Ok(vec![0.7, 0.2, 0.1])
        }

        fn num_classes(&self) -> usize {
            3
        }

        fn canonical_size(&self) -> u32 {
            4
        }
    }

    #[tokio::test]
    async fn test_get_fails_fast_before_load() {
        let gate = ExtractorGate::new();
        assert!(matches!(gate.get(), Err(MlMapError::ExtractorNotReady)));
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_queues_until_loaded() {
        let gate = ExtractorGate::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = gate.spawn_load(async move {
            let _ = rx.await;
            Ok(Arc::new(ConstExtractor) as Arc<dyn PretrainedExtractor>)
        });

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await.map(|e| e.num_classes()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(gate.get(), Err(MlMapError::ExtractorNotReady)));

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
        assert!(gate.get().is_ok());
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let gate = ExtractorGate::new();
        gate.spawn_load(async { Err(MlMapError::ExtractorLoad("weights missing".to_string())) })
            .await
            .unwrap();
        assert!(matches!(gate.get(), Err(MlMapError::ExtractorLoad(_))));
        assert!(matches!(gate.wait_ready().await, Err(MlMapError::ExtractorLoad(_))));
    }
}
