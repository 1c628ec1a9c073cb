//! # Optimizers
//!
//! First-order optimizers over the model's named variables, resolved from
//! `engine.optimizer` through a [`Registry`]. Moment tensors are keyed by
//! variable name so they survive a checkpoint round trip.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use seqtag_core::assembler::Registry;
use seqtag_core::config::{ComponentConfig, Params};
use seqtag_core::{ConfigError, Result, SeqTagError};
use tracing::debug;

const FIRST_MOMENT: &str = "exp_avg";
const SECOND_MOMENT: &str = "exp_avg_sq";

/// A parameter update rule.
pub trait Optimizer {
    /// Apply one update from `grads`, consuming the gradients it uses.
    /// Variables without a gradient are left untouched.
    fn step(&mut self, grads: &mut GradStore) -> Result<()>;

    /// The variables this optimizer updates.
    fn parameters(&self) -> &[Var];

    fn learning_rate(&self) -> f64;

    /// Used by learning-rate schedulers between epochs.
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far.
    fn steps(&self) -> usize;

    /// Internal state as named tensors (empty for stateless rules).
    fn state(&self) -> HashMap<String, Tensor>;

    /// Restore state written by [`Optimizer::state`] and the update count.
    fn load_state(&mut self, state: HashMap<String, Tensor>, steps: usize) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Hyper-parameters shared by every optimizer class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    pub fn from_params(params: &Params<'_>) -> std::result::Result<Self, ConfigError> {
        let config = Self {
            lr: params.required("lr")?,
            beta1: params.or("beta1", 0.9)?,
            beta2: params.or("beta2", 0.999)?,
            eps: params.or("eps", 1e-8)?,
            weight_decay: params.or("weight_decay", 0.0)?,
        };
        if !(config.lr > 0.0) {
            return Err(ConfigError::invalid(params.field("lr"), "must be greater than 0"));
        }
        for (key, beta) in [("beta1", config.beta1), ("beta2", config.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::invalid(params.field(key), "must lie in [0, 1)"));
            }
        }
        if config.weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                params.field("weight_decay"),
                "must not be negative",
            ));
        }
        Ok(config)
    }
}

/// Named variables from `varmap`, sorted by name, skipping every name that
/// starts with one of `frozen`.
pub fn trainable_vars(varmap: &VarMap, frozen: &[String]) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| !frozen.iter().any(|prefix| name.starts_with(prefix.as_str())))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn split_names(named: Vec<(String, Var)>) -> Result<(Vec<String>, Vec<Var>)> {
    if named.is_empty() {
        return Err(SeqTagError::shape("optimizer requires at least one trainable parameter"));
    }
    Ok(named.into_iter().unzip())
}

/// Stochastic gradient descent with L2 weight decay.
#[derive(Debug)]
pub struct Sgd {
    config: OptimizerConfig,
    vars: Vec<Var>,
    steps: usize,
}

impl Sgd {
    pub fn new(named: Vec<(String, Var)>, config: OptimizerConfig) -> Result<Self> {
        let (_, vars) = split_names(named)?;
        Ok(Self {
            config,
            vars,
            steps: 0,
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        let lr = self.config.lr;
        for var in &self.vars {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let grad = if self.config.weight_decay != 0.0 {
                (grad + var.as_tensor().affine(self.config.weight_decay, 0.0)?)?
            } else {
                grad
            };
            var.set(&var.as_tensor().sub(&grad.affine(lr, 0.0)?)?)?;
        }
        self.steps += 1;
        Ok(())
    }

    fn parameters(&self) -> &[Var] {
        &self.vars
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn steps(&self) -> usize {
        self.steps
    }

    fn state(&self) -> HashMap<String, Tensor> {
        HashMap::new()
    }

    fn load_state(&mut self, _state: HashMap<String, Tensor>, steps: usize) -> Result<()> {
        self.steps = steps;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SGD"
    }
}

#[derive(Debug)]
struct MomentSlot {
    name: String,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Adam with bias correction. With `decoupled_weight_decay` the decay is
/// applied to the weights directly (AdamW), otherwise it is folded into the
/// gradient (L2).
#[derive(Debug)]
pub struct Adam {
    config: OptimizerConfig,
    decoupled_weight_decay: bool,
    vars: Vec<Var>,
    slots: Vec<MomentSlot>,
    steps: usize,
}

impl Adam {
    pub fn new(
        named: Vec<(String, Var)>,
        config: OptimizerConfig,
        decoupled_weight_decay: bool,
    ) -> Result<Self> {
        let (names, vars) = split_names(named)?;
        let slots = names
            .into_iter()
            .zip(&vars)
            .map(|(name, var)| {
                Ok(MomentSlot {
                    name,
                    first_moment: var.as_tensor().zeros_like()?,
                    second_moment: var.as_tensor().zeros_like()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            decoupled_weight_decay,
            vars,
            slots,
            steps: 0,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        let OptimizerConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        self.steps += 1;
        let t = self.steps as i32;
        let scale_m = 1.0 / (1.0 - beta1.powi(t));
        let scale_v = 1.0 / (1.0 - beta2.powi(t));

        for (var, slot) in self.vars.iter().zip(self.slots.iter_mut()) {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let base = var.as_tensor();
            let grad = if weight_decay != 0.0 && !self.decoupled_weight_decay {
                (grad + base.affine(weight_decay, 0.0)?)?
            } else {
                grad
            };

            let m = (slot.first_moment.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
            let v = (slot.second_moment.affine(beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let denom = v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = m.affine(scale_m, 0.0)?.div(&denom)?.affine(lr, 0.0)?;

            let decayed = if weight_decay != 0.0 && self.decoupled_weight_decay {
                base.affine(1.0 - lr * weight_decay, 0.0)?
            } else {
                base.clone()
            };
            var.set(&decayed.sub(&update)?)?;

            slot.first_moment = m;
            slot.second_moment = v;
        }
        Ok(())
    }

    fn parameters(&self) -> &[Var] {
        &self.vars
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn steps(&self) -> usize {
        self.steps
    }

    fn state(&self) -> HashMap<String, Tensor> {
        self.slots
            .iter()
            .flat_map(|slot| {
                [
                    (format!("{}.{FIRST_MOMENT}", slot.name), slot.first_moment.clone()),
                    (format!("{}.{SECOND_MOMENT}", slot.name), slot.second_moment.clone()),
                ]
            })
            .collect()
    }

    fn load_state(&mut self, mut state: HashMap<String, Tensor>, steps: usize) -> Result<()> {
        for (var, slot) in self.vars.iter().zip(self.slots.iter_mut()) {
            slot.first_moment = take_moment(&mut state, &slot.name, FIRST_MOMENT, var)?;
            slot.second_moment = take_moment(&mut state, &slot.name, SECOND_MOMENT, var)?;
        }
        if !state.is_empty() {
            let mut extra: Vec<String> = state.into_keys().collect();
            extra.sort();
            return Err(SeqTagError::shape(format!(
                "optimizer state has entries for unknown parameters: {}",
                extra.join(", ")
            )));
        }
        self.steps = steps;
        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.decoupled_weight_decay { "AdamW" } else { "Adam" }
    }
}

fn take_moment(
    state: &mut HashMap<String, Tensor>,
    name: &str,
    suffix: &str,
    var: &Var,
) -> Result<Tensor> {
    let key = format!("{name}.{suffix}");
    let tensor = state
        .remove(&key)
        .ok_or_else(|| SeqTagError::shape(format!("optimizer state missing `{key}`")))?;
    if tensor.dims() != var.as_tensor().dims() {
        return Err(SeqTagError::shape(format!(
            "optimizer state `{key}` has shape {:?}, parameter has {:?}",
            tensor.dims(),
            var.as_tensor().dims()
        )));
    }
    Ok(tensor.to_device(var.as_tensor().device())?)
}

pub type OptimizerFactory = fn(&Params<'_>, Vec<(String, Var)>) -> Result<Box<dyn Optimizer>>;

/// The optimizer classes known to `engine.optimizer`.
pub fn optimizer_registry() -> Registry<OptimizerFactory> {
    let mut registry = Registry::<OptimizerFactory>::new("optimizer");
    registry
        .register("Adam", |params, vars| {
            Ok(Box::new(Adam::new(vars, OptimizerConfig::from_params(params)?, false)?))
        })
        .register("AdamW", |params, vars| {
            Ok(Box::new(Adam::new(vars, OptimizerConfig::from_params(params)?, true)?))
        })
        .register("SGD", |params, vars| {
            Ok(Box::new(Sgd::new(vars, OptimizerConfig::from_params(params)?)?))
        });
    registry
}

/// Build the optimizer declared by an `engine.optimizer` node over `vars`.
pub fn build_optimizer(
    node: &ComponentConfig,
    vars: Vec<(String, Var)>,
) -> Result<Box<dyn Optimizer>> {
    let factory = optimizer_registry().resolve(&node.class)?;
    let optimizer = factory(&node.at("engine.optimizer"), vars)?;
    debug!(
        class = optimizer.name(),
        lr = optimizer.learning_rate(),
        parameters = optimizer.parameters().len(),
        "optimizer ready"
    );
    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn quadratic_loss(var: &Var) -> Tensor {
        // (w - 3)^2 summed; minimum at w = 3.
        var.as_tensor().affine(1.0, -3.0).unwrap().sqr().unwrap().sum_all().unwrap()
    }

    fn scalar_var(name: &str, value: f32) -> (String, Var) {
        let var = Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap();
        (name.to_string(), var)
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_sgd_step_matches_formula() {
        let (name, var) = scalar_var("w", 0.0);
        let node = ComponentConfig::new("SGD").with("lr", 0.1);
        let mut opt = build_optimizer(&node, vec![(name, var.clone())]).unwrap();

        let mut grads = quadratic_loss(&var).backward().unwrap();
        opt.step(&mut grads).unwrap();
        // grad at 0 is -6, so w = 0 + 0.1 * 6
        assert!((value(&var) - 0.6).abs() < 1e-6);
        assert_eq!(opt.steps(), 1);
        assert!(grads.get(var.as_tensor()).is_none());
    }

    #[test]
    fn test_adam_first_step_has_unit_magnitude() {
        let (name, var) = scalar_var("w", 0.0);
        let node = ComponentConfig::new("Adam").with("lr", 0.01);
        let mut opt = build_optimizer(&node, vec![(name, var.clone())]).unwrap();
        let mut grads = quadratic_loss(&var).backward().unwrap();
        opt.step(&mut grads).unwrap();
        // Bias-corrected first Adam step moves by lr in the descent direction.
        assert!((value(&var) - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_adam_converges() {
        let (name, var) = scalar_var("w", 0.0);
        let node = ComponentConfig::new("AdamW").with("lr", 0.1);
        let mut opt = build_optimizer(&node, vec![(name, var.clone())]).unwrap();
        assert_eq!(opt.name(), "AdamW");
        for _ in 0..300 {
            let mut grads = quadratic_loss(&var).backward().unwrap();
            opt.step(&mut grads).unwrap();
        }
        assert!((value(&var) - 3.0).abs() < 0.05);
    }

    #[test]
    fn test_state_roundtrip_and_mismatch() {
        let (name, var) = scalar_var("w", 0.0);
        let node = ComponentConfig::new("Adam").with("lr", 0.01);
        let mut opt = build_optimizer(&node, vec![(name.clone(), var.clone())]).unwrap();
        let mut grads = quadratic_loss(&var).backward().unwrap();
        opt.step(&mut grads).unwrap();
        let state = opt.state();
        assert_eq!(state.len(), 2);
        assert!(state.contains_key("w.exp_avg"));

        let mut restored = build_optimizer(&node, vec![(name, var.clone())]).unwrap();
        restored.load_state(state.clone(), opt.steps()).unwrap();
        assert_eq!(restored.steps(), 1);
        let m: Vec<f32> = restored.state()["w.exp_avg"].to_vec1().unwrap();
        assert_eq!(m, state["w.exp_avg"].to_vec1::<f32>().unwrap());

        let (other, other_var) = scalar_var("u", 0.0);
        let mut wrong = build_optimizer(&node, vec![(other, other_var)]).unwrap();
        assert!(wrong.load_state(state, 1).is_err());
    }

    #[test]
    fn test_trainable_vars_skip_frozen_prefix() {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("encoder.embedder_0")
            .get_with_hints(4, "embeddings", Init::Const(0.0))
            .unwrap();
        vb.pp("crf").get_with_hints(4, "transitions", Init::Const(0.0)).unwrap();

        let all = trainable_vars(&varmap, &[]).unwrap();
        assert_eq!(all.len(), 2);
        let kept = trainable_vars(&varmap, &["encoder.embedder_0.".to_string()]).unwrap();
        let names: Vec<&str> = kept.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["crf.transitions"]);
    }

    #[test]
    fn test_invalid_hyper_parameters() {
        let (name, var) = scalar_var("w", 0.0);
        let node = ComponentConfig::new("Adam").with("lr", 0.0);
        let err = build_optimizer(&node, vec![(name.clone(), var.clone())]).err().unwrap();
        assert!(err.to_string().contains("engine.optimizer.lr"));

        let node = ComponentConfig::new("Adagrad").with("lr", 0.1);
        let err = build_optimizer(&node, vec![(name, var)]).err().unwrap();
        assert!(matches!(
            err,
            SeqTagError::Config(ConfigError::UnknownComponent { role: "optimizer", .. })
        ));
    }
}
