//! 学習率スケジュール

use crate::model::config::TrainingSettings;

/// ステップ減衰: `lr = initial * gamma^floor(step / step_size)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecaySchedule {
    pub initial: f64,
    pub gamma: f64,
    pub step_size: usize,
}

impl StepDecaySchedule {
    pub fn new(initial: f64, gamma: f64, step_size: usize) -> Self {
        Self {
            initial,
            gamma,
            step_size: step_size.max(1),
        }
    }

    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self::new(
            settings.initial_learning_rate,
            settings.decay_rate,
            settings.decay_steps,
        )
    }

    /// 指定ステップでの学習率
    pub fn lr_at(&self, step: usize) -> f64 {
        let exponent = (step / self.step_size) as i32;
        self.initial * self.gamma.powi(exponent)
    }
}
