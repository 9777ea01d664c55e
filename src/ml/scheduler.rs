//! フレーム単位の学習ループ
//!
//! 画面更新を止めないように、1フレームにつき1回 `Trainer::tick` を呼びます。
//! キャンセルフラグはtickの間で確認します。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burn::tensor::backend::AutodiffBackend;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::Result;
use crate::ml::training::Trainer;
use crate::model::config::TrainingSettings;

/// 学習中断フラグ
pub type CancelFlag = Arc<AtomicBool>;

/// 新しい中断フラグ
pub fn cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// 次のフレームまで待つ
pub trait Ticker: Send {
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

/// 一定間隔でフレームを刻む
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// tokioランタイム内で作成すること
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        // 処理が遅れたフレームはまとめて取り戻さない
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self::new(Duration::from_millis(settings.frame_interval_ms))
    }
}

impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// 待たずに進むフレーム（テストやバッチ実行用）
#[derive(Debug, Default)]
pub struct ManualTicker {
    frames: usize,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        self.frames += 1;
        tokio::task::yield_now().await;
    }
}

/// 学習ループの結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// 実行したtick数
    pub ticks: usize,
    /// 実行したステップ数
    pub steps: usize,
    /// tickごとに読み出した損失
    pub loss_samples: Vec<f64>,
    pub final_loss: Option<f64>,
    /// 途中で中断されたか
    pub cancelled: bool,
}

/// 学習が終わるまでフレームごとにtickを進める
///
/// 事前に `Trainer::begin` で学習を開始しておくこと。
pub async fn run_training<B, T>(trainer: &mut Trainer<B>, ticker: &mut T, cancel: &AtomicBool) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    T: Ticker,
{
    let mut report = TrainingReport::default();

    while trainer.is_running() {
        ticker.tick().await;

        if cancel.load(Ordering::SeqCst) {
            trainer.stop();
            report.cancelled = true;
            break;
        }

        let tick = trainer.tick()?;
        report.ticks += 1;
        report.steps += tick.steps_run;
        if let Some(loss) = tick.loss {
            report.loss_samples.push(loss);
            report.final_loss = Some(loss);
        }
        debug!("tick {}: step {}, loss {:?}", report.ticks, tick.step, tick.loss);
    }

    info!(
        "学習ループ終了: {} tick, {} ステップ{}",
        report.ticks,
        report.steps,
        if report.cancelled { " (中断)" } else { "" }
    );
    Ok(report)
}
