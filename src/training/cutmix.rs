/// CutMix regularization
///
/// Pastes a random rectangle from a permuted partner image onto each image in
/// the batch; the caller blends the two cross-entropy losses by the returned
/// area-corrected mixing factor.
use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// CutMix parameters
#[derive(Debug, Clone, Copy)]
pub struct CutMixConfig {
    /// Beta-distribution shape for the mixing draw; 0 disables CutMix
    pub beta: f64,
    /// Per-batch trigger probability
    pub prob: f64,
}

impl Default for CutMixConfig {
    fn default() -> Self {
        Self { beta: 0.0, prob: 0.0 }
    }
}

impl CutMixConfig {
    pub fn enabled(&self) -> bool {
        self.beta > 0.0 && self.prob > 0.0
    }
}

/// A batch after the (possibly skipped) mixing step
///
/// When mixing did not trigger, `targets_b` is `None` and `lam` is 1, so the
/// blended loss reduces to the plain one.
pub struct MixedBatch {
    pub inputs: Tensor,
    pub targets_a: Tensor,
    pub targets_b: Option<Tensor>,
    pub lam: f64,
}

/// Apply CutMix to a batch with probability `config.prob`
///
/// On trigger: draws lambda ~ Beta(beta, beta), cuts a random rectangle whose
/// sides scale with sqrt(1 - lambda), pastes the rectangle from a random
/// batch permutation, and recomputes lambda as `1 - area / total` so it
/// matches the actual pixel ratio after clipping. A clipped-to-zero-area
/// rectangle is valid and degenerates to a pass-through with lambda 1.
pub fn apply<R: Rng>(
    config: &CutMixConfig,
    inputs: &Tensor,
    targets: &Tensor,
    rng: &mut R,
) -> crate::Result<MixedBatch> {
    if !(config.beta > 0.0) || rng.gen::<f64>() >= config.prob {
        return Ok(MixedBatch {
            inputs: inputs.clone(),
            targets_a: targets.clone(),
            targets_b: None,
            lam: 1.0,
        });
    }

    let (batch, channels, width, height) = inputs.dims4()?;

    let beta = Beta::new(config.beta, config.beta).map_err(|e| {
        crate::TrainError::Config(format!("invalid CutMix beta {}: {}", config.beta, e))
    })?;
    let lam = beta.sample(rng);

    let mut perm: Vec<u32> = (0..batch as u32).collect();
    perm.shuffle(rng);
    let index = Tensor::from_vec(perm, batch, inputs.device())?;
    let shuffled = inputs.index_select(&index, 0)?;
    let targets_b = targets.index_select(&index, 0)?;

    let (bbx1, bby1, bbx2, bby2) = rand_bbox(width, height, lam, rng);
    let area = (bbx2 - bbx1) * (bby2 - bby1);

    let mixed = if area > 0 {
        let patch = shuffled
            .narrow(2, bbx1, bbx2 - bbx1)?
            .narrow(3, bby1, bby2 - bby1)?;
        inputs.slice_assign(&[0..batch, 0..channels, bbx1..bbx2, bby1..bby2], &patch)?
    } else {
        inputs.clone()
    };

    // adjust lambda to exactly match pixel ratio
    let lam = 1.0 - area as f64 / (width * height) as f64;

    Ok(MixedBatch {
        inputs: mixed,
        targets_a: targets.clone(),
        targets_b: Some(targets_b),
        lam,
    })
}

/// Random rectangle whose sides scale with sqrt(1 - lam), clipped to bounds
fn rand_bbox<R: Rng>(
    width: usize,
    height: usize,
    lam: f64,
    rng: &mut R,
) -> (usize, usize, usize, usize) {
    let cut_rat = (1.0 - lam).sqrt();
    let cut_w = (width as f64 * cut_rat) as i64;
    let cut_h = (height as f64 * cut_rat) as i64;

    let cx = rng.gen_range(0..width) as i64;
    let cy = rng.gen_range(0..height) as i64;

    let bbx1 = (cx - cut_w / 2).clamp(0, width as i64) as usize;
    let bby1 = (cy - cut_h / 2).clamp(0, height as i64) as usize;
    let bbx2 = (cx + cut_w / 2).clamp(0, width as i64) as usize;
    let bby2 = (cy + cut_h / 2).clamp(0, height as i64) as usize;

    (bbx1, bby1, bbx2, bby2)
}
