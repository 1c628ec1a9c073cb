//! # Learning-Rate Schedulers
//!
//! Epoch-level schedules resolved from `engine.lr_scheduler`. The engine
//! steps the scheduler once after every validation pass and hands the
//! returned rate to the optimizer.

use seqtag_core::assembler::Registry;
use seqtag_core::config::{ComponentConfig, Params};
use seqtag_core::{ConfigError, Result};
use tracing::{debug, warn};

/// Adjusts the learning rate between epochs.
pub trait LrScheduler {
    /// Rate for the next epoch. `lr` is the rate used so far and
    /// `tracked` the validation value of the epoch that just ended.
    fn step(&mut self, lr: f64, tracked: Option<f64>) -> f64;

    /// Continue after `epochs` completed epochs.
    fn restore(&mut self, epochs: usize);

    fn name(&self) -> &'static str;
}

/// Multiply the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
    epochs: usize,
}

impl StepLr {
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        let step_size: usize = params.required("step_size")?;
        let gamma: f64 = params.or("gamma", 0.1)?;
        if step_size == 0 {
            return Err(ConfigError::invalid(
                params.field("step_size"),
                "must be greater than 0",
            ));
        }
        if !(gamma > 0.0 && gamma <= 1.0) {
            return Err(ConfigError::invalid(params.field("gamma"), "must lie in (0, 1]"));
        }
        Ok(Self {
            step_size,
            gamma,
            epochs: 0,
        })
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, lr: f64, _tracked: Option<f64>) -> f64 {
        self.epochs += 1;
        if self.epochs % self.step_size == 0 {
            lr * self.gamma
        } else {
            lr
        }
    }

    fn restore(&mut self, epochs: usize) {
        self.epochs = epochs;
    }

    fn name(&self) -> &'static str {
        "StepLR"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    Min,
    Max,
}

/// Shrink the rate by `factor` once the tracked value has not improved by
/// a relative `threshold` for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    cooldown: usize,
    best: Option<f64>,
    bad_epochs: usize,
    cooldown_left: usize,
}

impl ReduceLrOnPlateau {
    /// `lower_is_better` gives the mode when `mode` is not set explicitly.
    pub fn from_params(
        params: &Params<'_>,
        lower_is_better: bool,
    ) -> std::result::Result<Self, ConfigError> {
        let tracking = if lower_is_better {
            PlateauMode::Min
        } else {
            PlateauMode::Max
        };
        let mode = match params.optional::<String>("mode")?.as_deref() {
            None => tracking,
            Some("min") => PlateauMode::Min,
            Some("max") => PlateauMode::Max,
            Some(other) => {
                return Err(ConfigError::invalid(
                    params.field("mode"),
                    format!("expected `min` or `max`, found `{other}`"),
                ));
            }
        };
        if mode != tracking {
            warn!(
                ?mode,
                "plateau scheduler mode disagrees with the direction of track_for_best"
            );
        }

        let factor: f64 = params.or("factor", 0.1)?;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(ConfigError::invalid(params.field("factor"), "must lie in (0, 1)"));
        }
        let threshold: f64 = params.or("threshold", 1e-4)?;
        if threshold < 0.0 {
            return Err(ConfigError::invalid(
                params.field("threshold"),
                "must not be negative",
            ));
        }
        let min_lr: f64 = params.or("min_lr", 0.0)?;
        if min_lr < 0.0 {
            return Err(ConfigError::invalid(params.field("min_lr"), "must not be negative"));
        }

        Ok(Self {
            mode,
            factor,
            patience: params.or("patience", 10)?,
            threshold,
            min_lr,
            cooldown: params.or("cooldown", 0)?,
            best: None,
            bad_epochs: 0,
            cooldown_left: 0,
        })
    }

    fn improves(&self, value: f64) -> bool {
        match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), PlateauMode::Min) => value < best - best.abs() * self.threshold,
            (Some(best), PlateauMode::Max) => value > best + best.abs() * self.threshold,
        }
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn step(&mut self, lr: f64, tracked: Option<f64>) -> f64 {
        let Some(value) = tracked.filter(|v| v.is_finite()) else {
            return lr;
        };
        if self.improves(value) {
            self.best = Some(value);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            self.cooldown_left = self.cooldown;
            return (lr * self.factor).max(self.min_lr);
        }
        lr
    }

    fn restore(&mut self, _epochs: usize) {
        self.best = None;
        self.bad_epochs = 0;
        self.cooldown_left = 0;
    }

    fn name(&self) -> &'static str {
        "ReduceLROnPlateau"
    }
}

pub type SchedulerFactory = fn(&Params<'_>, bool) -> Result<Box<dyn LrScheduler>>;

/// The scheduler classes known to `engine.lr_scheduler`.
pub fn scheduler_registry() -> Registry<SchedulerFactory> {
    let mut registry = Registry::<SchedulerFactory>::new("lr_scheduler");
    registry
        .register("StepLR", |params, _| Ok(Box::new(StepLr::from_params(params)?)))
        .register("ReduceLROnPlateau", |params, lower_is_better| {
            Ok(Box::new(ReduceLrOnPlateau::from_params(params, lower_is_better)?))
        });
    registry
}

/// Build the scheduler declared by an `engine.lr_scheduler` node.
pub fn build_scheduler(
    node: &ComponentConfig,
    lower_is_better: bool,
) -> Result<Box<dyn LrScheduler>> {
    let factory = scheduler_registry().resolve(&node.class)?;
    let scheduler = factory(&node.at("engine.lr_scheduler"), lower_is_better)?;
    debug!(class = scheduler.name(), "learning-rate scheduler ready");
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqtag_core::SeqTagError;

    #[test]
    fn test_step_lr_decays_every_step_size_epochs() {
        let node = ComponentConfig::new("StepLR").with("step_size", 2).with("gamma", 0.5);
        let mut scheduler = build_scheduler(&node, true).unwrap();
        let mut lr = 1.0;
        let mut seen = Vec::new();
        for _ in 0..4 {
            lr = scheduler.step(lr, None);
            seen.push(lr);
        }
        assert_eq!(seen, vec![1.0, 0.5, 0.5, 0.25]);

        scheduler.restore(1);
        assert_eq!(scheduler.step(1.0, None), 0.5);
    }

    #[test]
    fn test_plateau_decays_after_patience_runs_out() {
        let node = ComponentConfig::new("ReduceLROnPlateau")
            .with("patience", 1)
            .with("factor", 0.5);
        let mut scheduler = build_scheduler(&node, true).unwrap();

        let mut lr = 0.1;
        for loss in [1.0, 0.8, 0.8] {
            lr = scheduler.step(lr, Some(loss));
            assert_eq!(lr, 0.1);
        }
        // Second epoch without improvement exceeds patience.
        lr = scheduler.step(lr, Some(0.9));
        assert!((lr - 0.05).abs() < 1e-12);
        // Counter resets after a reduction.
        lr = scheduler.step(lr, Some(0.85));
        assert!((lr - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_max_mode_and_floor() {
        let node = ComponentConfig::new("ReduceLROnPlateau")
            .with("patience", 0)
            .with("min_lr", 0.04);
        let mut scheduler = build_scheduler(&node, false).unwrap();
        assert_eq!(scheduler.step(0.1, Some(0.5)), 0.1);
        assert_eq!(scheduler.step(0.1, Some(0.7)), 0.1);
        assert_eq!(scheduler.step(0.1, Some(0.6)), 0.04);
        assert_eq!(scheduler.step(0.04, None), 0.04);
    }

    #[test]
    fn test_invalid_scheduler_parameters() {
        let err = build_scheduler(&ComponentConfig::new("StepLR"), true).err().unwrap();
        assert!(err.to_string().contains("engine.lr_scheduler.step_size"));

        let node = ComponentConfig::new("ReduceLROnPlateau").with("mode", "sideways");
        assert!(build_scheduler(&node, true).is_err());

        let err = build_scheduler(&ComponentConfig::new("CosineAnnealing"), true).err().unwrap();
        assert!(matches!(
            err,
            SeqTagError::Config(ConfigError::UnknownComponent { role: "lr_scheduler", .. })
        ));
    }
}
