/// Held-out evaluation pass
use candle_core::Device;
use candle_nn::loss;

use super::trainer::{accuracy, EpochStats};
use crate::data::BatchLoader;
use crate::models::ConvMixer;

/// Run one full pass over a held-out stream in evaluation mode
///
/// Uses eval-mode forwards (batch-norm reads running statistics and nothing
/// updates them) and never invokes backpropagation, so the model is a pure
/// read: calling this twice on the same model and data returns identical
/// results. The next training epoch re-enters training mode through its own
/// forwards.
///
/// Returns (mean loss, mean accuracy).
pub fn validate(
    model: &ConvMixer,
    loader: &mut dyn BatchLoader,
    device: &Device,
) -> crate::Result<(f64, f64)> {
    loader.reset();

    let mut stats = EpochStats::default();
    while let Some((inputs, targets)) = loader.next_batch(device)? {
        let logits = model.forward_t(&inputs, false)?;
        let loss = loss::cross_entropy(&logits, &targets)?;
        stats.record(loss.to_scalar::<f32>()? as f64, accuracy(&logits, &targets)?);
    }

    Ok((stats.mean_loss(), stats.mean_accuracy()))
}
