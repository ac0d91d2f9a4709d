//! Loss computation for teacher-forced rewrite training.
//!
//! The LM loss scores only target-span positions (labels ≥ 0) and, under
//! multi-task training, only examples flagged `needs_rewrite` contribute —
//! positive queries that need no rewriting are learned by the classification
//! head alone.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;

/// Per-token cross entropy with the ignore sentinel, optionally weighted per
/// example.
///
/// * `logits` — `(batch, seq_len, vocab)` raw scores.
/// * `labels` — `(batch, seq_len)` i64; negative entries are excluded.
/// * `weights` — one factor per example (the 0/1 needs-rewrite flag), applied
///   to every scored position of that example. `None` weights all examples 1.
///
/// The sum of weighted token losses is normalised by the weighted count of
/// scored positions, floored at 1 so a batch with no contributing positions
/// yields a defined zero-ish loss instead of a NaN.
pub fn masked_lm_loss(
    logits: &Tensor,
    labels: &Tensor,
    weights: Option<&[f32]>,
) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let logits = logits.reshape((b * t, v))?;
    let labels = labels.reshape((b * t,))?;

    let mask = labels.ge(0i64)?;
    let mask_f = mask.to_dtype(DType::F32)?;
    // Masked positions index class 0; their contribution is zeroed below.
    let safe_labels = (&labels * &mask.to_dtype(DType::I64)?)?.to_dtype(DType::U32)?;

    let log_probs = ops::log_softmax(&logits, 1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let nll = picked.neg()?; // (b*t)

    let weight = match weights {
        Some(w) => {
            debug_assert_eq!(w.len(), b);
            let mut expanded = Vec::with_capacity(b * t);
            for &factor in w {
                expanded.extend(std::iter::repeat(factor).take(t));
            }
            let w = Tensor::from_vec(expanded, (b * t,), logits.device())?;
            (&mask_f * &w)?
        }
        None => mask_f,
    };

    let total = (&nll * &weight)?.sum_all()?;
    let denom = f64::from(weight.sum_all()?.to_scalar::<f32>()?);
    let denom = if denom > 0.0 { denom } else { 1.0 };
    total.affine(1.0 / denom, 0.0)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use cqr_common::IGNORE_INDEX;

    fn uniform_logits(b: usize, t: usize, v: usize) -> Tensor {
        Tensor::zeros((b, t, v), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn ignored_positions_do_not_contribute() {
        // Uniform logits over 4 classes: every scored position costs ln(4).
        let logits = uniform_logits(1, 3, 4);
        let labels = Tensor::new(&[[IGNORE_INDEX, 2i64, IGNORE_INDEX]], &Device::Cpu).unwrap();
        let loss = masked_lm_loss(&logits, &labels, None).unwrap();
        let expected = (4f32).ln();
        assert!((loss.to_scalar::<f32>().unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn fully_masked_batch_yields_zero_not_nan() {
        let logits = uniform_logits(2, 3, 4);
        let labels =
            Tensor::new(&[[IGNORE_INDEX; 3], [IGNORE_INDEX; 3]], &Device::Cpu).unwrap();
        let loss = masked_lm_loss(&logits, &labels, None).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert_eq!(value, 0.0);
    }

    #[test]
    fn zero_weight_examples_are_excluded() {
        let logits = uniform_logits(2, 2, 4);
        let labels = Tensor::new(&[[1i64, 1], [1, 1]], &Device::Cpu).unwrap();
        let weighted = masked_lm_loss(&logits, &labels, Some(&[1.0, 0.0])).unwrap();
        let unweighted = masked_lm_loss(&logits, &labels, None).unwrap();
        // Uniform logits: the mean per scored position is ln(4) either way.
        let expected = (4f32).ln();
        assert!((weighted.to_scalar::<f32>().unwrap() - expected).abs() < 1e-5);
        assert!((unweighted.to_scalar::<f32>().unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn all_zero_weights_normalise_by_one() {
        let logits = uniform_logits(1, 2, 4);
        let labels = Tensor::new(&[[1i64, 2]], &Device::Cpu).unwrap();
        let loss = masked_lm_loss(&logits, &labels, Some(&[0.0])).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert_eq!(value, 0.0);
    }

    #[test]
    fn confident_correct_prediction_has_low_loss() {
        // Put nearly all mass on class 2 at the single scored position.
        let mut raw = vec![0.0f32; 4];
        raw[2] = 20.0;
        let logits = Tensor::from_vec(raw, (1, 1, 4), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[2i64]], &Device::Cpu).unwrap();
        let loss = masked_lm_loss(&logits, &labels, None).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() < 1e-3);
    }
}
