/// 2-d batch normalization
///
/// Written out rather than taken from candle-nn because checkpoints must
/// snapshot and restore the running statistics, and candle-nn's layer keeps
/// them in private variables with no way back in.
use candle_core::{Result, Tensor, Var};
use candle_nn::{Init, VarBuilder};

const DEFAULT_EPS: f64 = 1e-5;
const DEFAULT_MOMENTUM: f64 = 0.1;

/// Batch normalization over the channel dimension of [N, C, H, W] input
///
/// The affine weight/bias are ordinary trainable parameters registered with
/// the VarBuilder; the running mean/variance live in the layer and update
/// only during training forwards.
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    eps: f64,
    momentum: f64,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.0))?;

        let device = vb.device().clone();
        let dtype = vb.dtype();
        let running_mean = Var::zeros(num_features, dtype, &device)?;
        let running_var = Var::ones(num_features, dtype, &device)?;

        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            eps: DEFAULT_EPS,
            momentum: DEFAULT_MOMENTUM,
        })
    }

    /// Forward pass
    ///
    /// Training mode normalizes with the batch statistics and folds them into
    /// the running averages; evaluation mode is a pure read of the running
    /// statistics.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, channels, height, width) = xs.dims4()?;

        let (mean, var) = if train {
            let mean = xs.mean_keepdim((0, 2, 3))?; // [1, C, 1, 1]
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim((0, 2, 3))?;

            self.update_running(&mean, &var, batch * height * width)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, channels, 1, 1))?,
                self.running_var.as_tensor().reshape((1, channels, 1, 1))?,
            )
        };

        let normed = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;

        let weight = self.weight.reshape((1, channels, 1, 1))?;
        let bias = self.bias.reshape((1, channels, 1, 1))?;
        normed.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, samples: usize) -> Result<()> {
        // detached: the running averages are bookkeeping, not graph nodes
        let batch_mean = mean.flatten_all()?.detach();
        let batch_var = var.flatten_all()?.detach();

        // the running variance uses the unbiased estimate
        let batch_var = if samples > 1 {
            (batch_var * (samples as f64 / (samples - 1) as f64))?
        } else {
            batch_var
        };

        let new_mean = ((self.running_mean.as_tensor() * (1.0 - self.momentum))?
            + (batch_mean * self.momentum)?)?;
        let new_var = ((self.running_var.as_tensor() * (1.0 - self.momentum))?
            + (batch_var * self.momentum)?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)?;
        Ok(())
    }

    /// The running statistics, named relative to this layer
    pub fn state(&self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("running_mean", self.running_mean.as_tensor().clone()),
            ("running_var", self.running_var.as_tensor().clone()),
        ]
    }

    /// Restore running statistics from named tensors
    pub fn load_state(&self, mean: &Tensor, var: &Tensor) -> Result<()> {
        self.running_mean.set(mean)?;
        self.running_var.set(var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(device: &Device) -> BatchNorm2d {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        BatchNorm2d::new(3, vb).unwrap()
    }

    #[test]
    fn test_train_forward_normalizes_batch() -> Result<()> {
        let device = Device::Cpu;
        let norm = layer(&device);

        let xs = Tensor::randn(2f32, 5.0, (4, 3, 8, 8), &device)?;
        let out = norm.forward_t(&xs, true)?;

        // per-channel output statistics are ~N(0, 1)
        let mean = out.mean_keepdim((0, 2, 3))?.flatten_all()?.to_vec1::<f32>()?;
        let var = out
            .broadcast_sub(&out.mean_keepdim((0, 2, 3))?)?
            .sqr()?
            .mean_keepdim((0, 2, 3))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for c in 0..3 {
            assert!(mean[c].abs() < 1e-4, "channel {} mean {}", c, mean[c]);
            assert!((var[c] - 1.0).abs() < 1e-2, "channel {} var {}", c, var[c]);
        }
        Ok(())
    }

    #[test]
    fn test_eval_forward_does_not_touch_running_stats() -> Result<()> {
        let device = Device::Cpu;
        let norm = layer(&device);

        let before: Vec<f32> = norm.running_mean.as_tensor().to_vec1()?;
        let xs = Tensor::randn(1f32, 2.0, (2, 3, 4, 4), &device)?;
        norm.forward_t(&xs, false)?;
        let after: Vec<f32> = norm.running_mean.as_tensor().to_vec1()?;

        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_train_forward_moves_running_stats() -> Result<()> {
        let device = Device::Cpu;
        let norm = layer(&device);

        let xs = ((Tensor::randn(0f32, 1.0, (2, 3, 4, 4), &device)? * 0.1)? + 10.0)?;
        norm.forward_t(&xs, true)?;

        let mean: Vec<f32> = norm.running_mean.as_tensor().to_vec1()?;
        // one update with momentum 0.1 from zero toward ~10
        for value in mean {
            assert!((value - 1.0).abs() < 0.1, "running mean {}", value);
        }
        Ok(())
    }

    #[test]
    fn test_state_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let norm = layer(&device);

        let xs = Tensor::randn(3f32, 2.0, (2, 3, 4, 4), &device)?;
        norm.forward_t(&xs, true)?;

        let state = norm.state();
        let fresh = layer(&device);
        fresh.load_state(&state[0].1, &state[1].1)?;

        let eval_a = norm.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
        let eval_b = fresh.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(eval_a, eval_b);
        Ok(())
    }
}
