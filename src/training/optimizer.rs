/// Gradient-update rules over named candle variables
///
/// Both optimizers are written out in full rather than borrowed from
/// candle-nn because checkpoint resume needs their per-parameter buffers
/// exported and restored, keyed by parameter name.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use std::collections::HashMap;
use std::str::FromStr;

/// The supported gradient-update rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = crate::TrainError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adamw" => Ok(Self::AdamW),
            _ => Err(crate::TrainError::Config(format!(
                "unknown optimizer '{}', expected one of: sgd, adamw",
                s
            ))),
        }
    }
}

/// Optimizer hyperparameters
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    /// Learning rate (initial; schedules overwrite it per step)
    pub lr: f64,
    /// Numerical-stability epsilon; `None` uses the rule's default
    pub eps: Option<f64>,
    /// Momentum coefficient (SGD only)
    pub momentum: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

/// SGD with momentum
///
/// Weight decay is folded into the gradient (L2 regularization semantics).
pub struct Sgd {
    vars: Vec<(String, Var)>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(vars: Vec<(String, Var)>, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            vars,
            lr,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                // parameters outside the graph (e.g. batch-norm running
                // statistics) receive no gradient and are skipped
                continue;
            };

            let grad = if self.weight_decay > 0.0 {
                (grad + (var.as_tensor() * self.weight_decay)?)?
            } else {
                grad.clone()
            };

            let velocity = match self.velocity.get(name) {
                Some(prev) if self.momentum > 0.0 => ((prev * self.momentum)? + &grad)?,
                _ => grad,
            };

            var.set(&(var.as_tensor() - (&velocity * self.lr)?)?)?;
            self.velocity.insert(name.clone(), velocity);
        }
        Ok(())
    }

    fn state(&self) -> HashMap<String, Tensor> {
        self.velocity
            .iter()
            .map(|(name, tensor)| (format!("velocity.{}", name), tensor.clone()))
            .collect()
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) {
        for (key, tensor) in state {
            if let Some(name) = key.strip_prefix("velocity.") {
                self.velocity.insert(name.to_string(), tensor.clone());
            }
        }
    }
}

/// AdamW: Adam with decoupled weight decay
pub struct AdamW {
    vars: Vec<(String, Var)>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step_count: usize,
    exp_avg: HashMap<String, Tensor>,
    exp_avg_sq: HashMap<String, Tensor>,
}

impl AdamW {
    pub fn new(vars: Vec<(String, Var)>, lr: f64, eps: f64, weight_decay: f64) -> Self {
        Self {
            vars,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps,
            weight_decay,
            step_count: 0,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step_count as i32);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };

            let m = match self.exp_avg.get(name) {
                Some(prev) => ((prev * self.beta1)? + (grad * (1.0 - self.beta1))?)?,
                None => (grad * (1.0 - self.beta1))?,
            };
            let v = match self.exp_avg_sq.get(name) {
                Some(prev) => ((prev * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?,
                None => (grad.sqr()? * (1.0 - self.beta2))?,
            };

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = ((m_hat / (v_hat.sqrt()? + self.eps)?)? * self.lr)?;

            let decayed = if self.weight_decay > 0.0 {
                (var.as_tensor() * (1.0 - self.lr * self.weight_decay))?
            } else {
                var.as_tensor().clone()
            };
            var.set(&(decayed - update)?)?;

            self.exp_avg.insert(name.clone(), m);
            self.exp_avg_sq.insert(name.clone(), v);
        }
        Ok(())
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, tensor) in &self.exp_avg {
            state.insert(format!("exp_avg.{}", name), tensor.clone());
        }
        for (name, tensor) in &self.exp_avg_sq {
            state.insert(format!("exp_avg_sq.{}", name), tensor.clone());
        }
        let device = state
            .values()
            .next()
            .map(|t| t.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        state.insert(
            "step".to_string(),
            Tensor::new(&[self.step_count as f64], &device)?,
        );
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (key, tensor) in state {
            if let Some(name) = key.strip_prefix("exp_avg_sq.") {
                self.exp_avg_sq.insert(name.to_string(), tensor.clone());
            } else if let Some(name) = key.strip_prefix("exp_avg.") {
                self.exp_avg.insert(name.to_string(), tensor.clone());
            }
        }
        if let Some(step) = state.get("step") {
            self.step_count = step.to_vec1::<f64>()?[0] as usize;
        }
        Ok(())
    }
}

/// A configured gradient-update rule
pub enum TrainOptimizer {
    Sgd(Sgd),
    AdamW(AdamW),
}

impl TrainOptimizer {
    /// Apply one update from accumulated gradients
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Sgd(opt) => opt.step(grads),
            Self::AdamW(opt) => opt.step(grads),
        }
    }

    /// Backward pass + parameter update in one call
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(opt) => opt.lr,
            Self::AdamW(opt) => opt.lr,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Sgd(opt) => opt.lr = lr,
            Self::AdamW(opt) => opt.lr = lr,
        }
    }

    /// Export auxiliary state for checkpointing
    pub fn state(&self) -> Result<HashMap<String, Tensor>> {
        match self {
            Self::Sgd(opt) => Ok(opt.state()),
            Self::AdamW(opt) => opt.state(),
        }
    }

    /// Restore auxiliary state from a checkpoint
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        match self {
            Self::Sgd(opt) => {
                opt.load_state(state);
                Ok(())
            }
            Self::AdamW(opt) => opt.load_state(state),
        }
    }
}

/// Construct the optimizer named by `config` over the given parameters
pub fn create_optimizer(
    vars: Vec<(String, Var)>,
    config: &OptimizerConfig,
) -> crate::Result<TrainOptimizer> {
    let optimizer = match config.kind {
        OptimizerKind::Sgd => TrainOptimizer::Sgd(Sgd::new(
            vars,
            config.lr,
            config.momentum,
            config.weight_decay,
        )),
        OptimizerKind::AdamW => TrainOptimizer::AdamW(AdamW::new(
            vars,
            config.lr,
            config.eps.unwrap_or(1e-8),
            config.weight_decay,
        )),
    };
    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scalar_var(value: f32) -> (String, Var) {
        let tensor = Tensor::new(&[value], &Device::Cpu).unwrap();
        ("w".to_string(), Var::from_tensor(&tensor).unwrap())
    }

    fn grads_for(var: &Var, factor: f64) -> GradStore {
        // loss = factor * sum(w)  =>  dloss/dw = factor
        let loss = (var.as_tensor() * factor).unwrap().sum_all().unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn test_sgd_plain_step() -> Result<()> {
        let (name, var) = scalar_var(1.0);
        let mut opt = Sgd::new(vec![(name, var.clone())], 0.1, 0.0, 0.0);

        let grads = grads_for(&var, 2.0);
        opt.step(&grads)?;

        // w <- 1.0 - 0.1 * 2.0
        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((w - 0.8).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_sgd_momentum_accumulates() -> Result<()> {
        let (name, var) = scalar_var(1.0);
        let mut opt = Sgd::new(vec![(name, var.clone())], 0.1, 0.9, 0.0);

        let grads = grads_for(&var, 1.0);
        opt.step(&grads)?; // v = 1,   w = 1 - 0.1 = 0.9
        let grads = grads_for(&var, 1.0);
        opt.step(&grads)?; // v = 1.9, w = 0.9 - 0.19 = 0.71

        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((w - 0.71).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_sgd_weight_decay_folds_into_gradient() -> Result<()> {
        let (name, var) = scalar_var(1.0);
        let mut opt = Sgd::new(vec![(name, var.clone())], 0.1, 0.0, 0.5);

        let grads = grads_for(&var, 1.0);
        opt.step(&grads)?; // g = 1 + 0.5*1 = 1.5, w = 1 - 0.15

        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((w - 0.85).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_adamw_first_step_moves_against_gradient() -> Result<()> {
        let (name, var) = scalar_var(1.0);
        let mut opt = AdamW::new(vec![(name, var.clone())], 0.01, 1e-8, 0.0);

        let grads = grads_for(&var, 3.0);
        opt.step(&grads)?;

        // first step of Adam moves by ~lr regardless of gradient scale
        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!(w < 1.0);
        assert!((w - 0.99).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_adamw_decoupled_weight_decay() -> Result<()> {
        let (name, var) = scalar_var(2.0);
        let mut opt = AdamW::new(vec![(name, var.clone())], 0.1, 1e-8, 0.5);

        let grads = grads_for(&var, 1.0);
        opt.step(&grads)?;

        // decay alone contributes w * (1 - 0.1*0.5) = 1.9, then ~lr from the
        // adam update
        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((w - (1.9 - 0.1)).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_state_round_trip_preserves_trajectory() -> Result<()> {
        let (name, var_a) = scalar_var(1.0);
        let mut continued = Sgd::new(vec![(name.clone(), var_a.clone())], 0.1, 0.9, 0.0);
        let grads = grads_for(&var_a, 1.0);
        continued.step(&grads)?;
        let state = TrainOptimizer::Sgd(continued).state()?;

        // fresh optimizer over an identically-positioned parameter, with the
        // saved velocity restored
        let snapshot = var_a.as_tensor().to_vec1::<f32>()?[0];
        let tensor = Tensor::new(&[snapshot], &Device::Cpu)?;
        let var_b = Var::from_tensor(&tensor)?;
        let mut restored =
            TrainOptimizer::Sgd(Sgd::new(vec![(name, var_b.clone())], 0.1, 0.9, 0.0));
        restored.load_state(&state)?;

        let grads_a = grads_for(&var_a, 1.0);
        let mut original = TrainOptimizer::Sgd(Sgd::new(
            vec![("w".to_string(), var_a.clone())],
            0.1,
            0.9,
            0.0,
        ));
        // keep the original's velocity too, so both take the same second step
        original.load_state(&state)?;
        original.step(&grads_a)?;

        let grads_b = grads_for(&var_b, 1.0);
        restored.step(&grads_b)?;

        let a = var_a.as_tensor().to_vec1::<f32>()?[0];
        let b = var_b.as_tensor().to_vec1::<f32>()?[0];
        assert!((a - b).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_adamw_state_round_trip() -> Result<()> {
        let (name, var) = scalar_var(1.0);
        let mut opt = TrainOptimizer::AdamW(AdamW::new(vec![(name.clone(), var.clone())], 0.01, 1e-8, 0.0));
        let grads = grads_for(&var, 1.0);
        opt.step(&grads)?;

        let state = opt.state()?;
        assert!(state.contains_key("exp_avg.w"));
        assert!(state.contains_key("exp_avg_sq.w"));

        let mut fresh = TrainOptimizer::AdamW(AdamW::new(vec![(name, var)], 0.01, 1e-8, 0.0));
        fresh.load_state(&state)?;
        if let TrainOptimizer::AdamW(inner) = &fresh {
            assert_eq!(inner.step_count, 1);
        } else {
            unreachable!();
        }
        Ok(())
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_unvisited_params_are_skipped() -> Result<()> {
        // a var that never enters the loss gets no gradient and must not move
        let tensor = Tensor::new(&[5.0f32], &Device::Cpu)?;
        let detached = Var::from_tensor(&tensor)?;
        let (name, active) = scalar_var(1.0);

        let mut opt = Sgd::new(
            vec![(name, active.clone()), ("frozen".to_string(), detached.clone())],
            0.1,
            0.0,
            0.0,
        );
        let grads = grads_for(&active, 1.0);
        opt.step(&grads)?;

        assert_eq!(detached.as_tensor().to_vec1::<f32>()?[0], 5.0);
        Ok(())
    }

    #[test]
    fn test_set_learning_rate() {
        let (name, var) = scalar_var(1.0);
        let mut opt = TrainOptimizer::Sgd(Sgd::new(vec![(name, var)], 0.01, 0.9, 0.0));
        assert_eq!(opt.learning_rate(), 0.01);
        opt.set_learning_rate(0.005);
        assert_eq!(opt.learning_rate(), 0.005);
    }
}
