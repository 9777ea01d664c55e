//! 増分学習
//!
//! 1回の学習は最大 `max_steps` ステップのミニバッチSGDで、
//! フレームごとに `steps_per_tick` ステップずつ進めます。
//! 損失の読み出しは各tickの最後のステップだけで行います。

use std::path::Path;

use anyhow::Context;
use burn::{
    module::{AutodiffModule, Module},
    nn::loss::{MseLoss, Reduction},
    optim::{adaptor::OptimizerAdaptor, GradientsParams, Optimizer, Sgd, SgdConfig},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::dataset::{ExampleStore, ShuffledProvider};
use crate::error::{MlMapError, Result};
use crate::ml::lr_schedule::StepDecaySchedule;
use crate::ml::ml_model::{ClassifierConfig, TileClassifier};
use crate::model::config::{ExtractionMode, ModelSettings, TrainingSettings};
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::types::TrainingState;

/// 1tick分の結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// このtickで実行したステップ数
    pub steps_run: usize,
    /// 現在の学習での累計ステップ数
    pub step: usize,
    /// 最後のステップの損失（ステップを実行しなかった場合はNone）
    pub loss: Option<f64>,
    /// この学習が終了したか
    pub finished: bool,
}

/// 分類器とオプティマイザの状態を保持し、学習を進める
pub struct Trainer<B: AutodiffBackend> {
    model: TileClassifier<B>,
    optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, TileClassifier<B>, B>,
    model_settings: ModelSettings,
    settings: TrainingSettings,
    schedule: StepDecaySchedule,
    device: B::Device,
    state: TrainingState,
    step: usize,
    lifetime_steps: usize,
    batch_size: usize,
    provider: Option<ShuffledProvider>,
    last_loss: Option<f64>,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// 初期化済みの重みで作成（学習前でも推論できる）
    pub fn new(model_settings: ModelSettings, settings: TrainingSettings, device: B::Device) -> Self {
        let model = ClassifierConfig::new(model_settings.input_size, model_settings.hidden_sizes).init::<B>(&device);
        let optimizer = SgdConfig::new().init::<B, TileClassifier<B>>();
        let schedule = StepDecaySchedule::from_settings(&settings);

        Self {
            model,
            optimizer,
            model_settings,
            settings,
            schedule,
            device,
            state: TrainingState::Idle,
            step: 0,
            lifetime_steps: 0,
            batch_size: 0,
            provider: None,
            last_loss: None,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TrainingState::Running
    }

    /// 現在の学習での累計ステップ数
    pub fn step(&self) -> usize {
        self.step
    }

    /// これまでの全学習での累計ステップ数
    pub fn lifetime_steps(&self) -> usize {
        self.lifetime_steps
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    pub fn input_size(&self) -> usize {
        self.model_settings.input_size
    }

    pub fn model(&self) -> &TileClassifier<B> {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// 学習を開始する
    ///
    /// 学習データのシャッフルはここで1回だけ行う。学習中に呼ぶと最初からやり直す。
    pub fn begin<R: Rng + ?Sized>(&mut self, store: &ExampleStore, rng: &mut R) -> Result<()> {
        if store.is_empty() {
            return Err(MlMapError::EmptyTrainingSet);
        }
        if store.input_size() != self.input_size() {
            return Err(MlMapError::FeatureLength {
                expected: self.input_size(),
                actual: store.input_size(),
            });
        }

        let n = store.len();
        self.batch_size = self.settings.batch_size.map_or(n, |cap| cap.min(n));
        self.provider = Some(store.shuffled(rng));
        self.step = 0;
        self.state = TrainingState::Running;

        let (negatives, positives) = store.label_counts();
        info!(
            "学習を開始します: {}件 (airplane {} / not airplane {}), バッチサイズ {}, {}ステップ",
            n, positives, negatives, self.batch_size, self.settings.max_steps
        );
        Ok(())
    }

    /// 1フレーム分のステップを実行する
    pub fn tick(&mut self) -> Result<TickReport> {
        if !self.is_running() {
            return Ok(TickReport {
                steps_run: 0,
                step: self.step,
                loss: None,
                finished: true,
            });
        }

        let remaining = self.settings.max_steps.saturating_sub(self.step);
        let steps = self.settings.steps_per_tick.min(remaining);
        let mut loss = None;

        for i in 0..steps {
            let lr = self.schedule.lr_at(self.step);
            let read_back = i + 1 == steps;
            loss = self.train_step(lr, read_back)?.or(loss);
        }

        if loss.is_some() {
            self.last_loss = loss;
        }

        let finished = self.step >= self.settings.max_steps;
        if finished {
            self.finish();
        }

        Ok(TickReport {
            steps_run: steps,
            step: self.step,
            loss,
            finished,
        })
    }

    /// ミニバッチ1回分の更新
    fn train_step(&mut self, lr: f64, read_back: bool) -> Result<Option<f64>> {
        let provider = self
            .provider
            .as_mut()
            .ok_or(MlMapError::EmptyTrainingSet)?;
        let (inputs, targets) = provider.next_batch(self.batch_size);
        let batch_size = targets.len();
        let input_size = self.input_size();

        let x = Tensor::<B, 1>::from_floats(inputs.as_slice(), &self.device).reshape([batch_size, input_size]);
        let y = Tensor::<B, 1>::from_floats(targets.as_slice(), &self.device).reshape([batch_size, 1]);

        let output = self.model.forward(x);
        let loss = MseLoss::new().forward(output, y, Reduction::Mean);

        let sampled = if read_back {
            let value: f64 = loss.clone().into_scalar().elem();
            if let Err(e) = ensure_finite(self.step, value) {
                warn!("{}", e);
                self.abort();
                return Err(e);
            }
            debug!("step {}: lr = {:.5}, loss = {:.6}", self.step, lr, value);
            Some(value)
        } else {
            None
        };

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);

        self.step += 1;
        self.lifetime_steps += 1;
        Ok(sampled)
    }

    fn finish(&mut self) {
        info!(
            "学習が完了しました: {}ステップ, 最終損失 {}",
            self.step,
            self.last_loss.map_or("-".to_string(), |l| format!("{:.6}", l))
        );
        self.state = TrainingState::Idle;
        self.provider = None;
    }

    fn abort(&mut self) {
        self.state = TrainingState::Idle;
        self.provider = None;
    }

    /// 学習を途中で止める（ここまでの更新は残る）
    pub fn stop(&mut self) {
        if self.is_running() {
            info!("学習を中断しました: {}ステップ", self.step);
        }
        self.abort();
    }

    /// 現在の重みで採点する
    pub fn predict(&self, features: &[f32]) -> Result<f32> {
        if features.len() != self.input_size() {
            return Err(MlMapError::FeatureLength {
                expected: self.input_size(),
                actual: features.len(),
            });
        }
        let model = self.model.valid();
        let scores = model.score(features, self.input_size(), &self.device)?;
        scores
            .first()
            .copied()
            .ok_or_else(|| MlMapError::Tensor("推論結果が空です".to_string()))
    }

    /// 重みをバイト列に書き出す
    pub fn model_binary(&self) -> anyhow::Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        Recorder::<B::InnerBackend>::record(&recorder, self.model.valid().into_record(), ())
            .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
    }

    /// 重みとメタデータをtar.gzで保存する
    pub fn save(
        &self,
        path: &Path,
        extraction_mode: ExtractionMode,
        zoom: u32,
        num_examples: usize,
    ) -> anyhow::Result<()> {
        let metadata = ModelMetadata::classifier(
            self.input_size(),
            &self.model_settings.hidden_sizes,
            extraction_mode,
            zoom,
            num_examples,
            self.lifetime_steps,
        );
        let binary = self.model_binary()?;
        save_model_with_metadata(path, &metadata, &binary)
            .with_context(|| format!("分類器の保存に失敗しました: {}", path.display()))?;
        info!("分類器を保存しました: {}", path.display());
        Ok(())
    }
}

/// 損失がNaN/無限大なら学習を続けられない
fn ensure_finite(step: usize, loss: f64) -> Result<f64> {
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(MlMapError::NonFiniteLoss { step, loss })
    }
}
