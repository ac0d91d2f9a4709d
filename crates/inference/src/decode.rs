//! Bounded autoregressive decode loop.
//!
//! Strictly sequential: every step re-scores the full running prefix through
//! the scoring capability, samples one token, and stops on the end marker or
//! when the step budget runs out. Both terminal states are successes.

use anyhow::Result;
use rand::Rng;

use cqr_common::{Codec, EOS_TOKEN};

use crate::sampler::NucleusSampler;

/// Scoring capability: next-position logits for a token-id prefix.
///
/// Implemented by [`crate::ModelScorer`] over the trained model and by fixed
/// logit tables in tests.
pub trait NextTokenScorer {
    fn score(&self, prefix: &[u32]) -> Result<Vec<f32>>;
}

/// Decode-loop knobs.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Step budget; the loop always terminates within this many tokens.
    pub max_new_tokens: usize,
    /// 0 = greedy; positive values scale logits before sampling.
    pub temperature: f64,
    /// Nucleus mass; ≤ 0 disables top-p filtering.
    pub top_p: f64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            temperature: 0.0,
            top_p: 0.9,
        }
    }
}

/// How a decode session ended. Both are success outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The end marker was produced (and not appended).
    Completed,
    /// The step budget ran out before the end marker appeared.
    LengthExhausted,
}

/// Tokens produced after the prompt, plus the terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub ids: Vec<u32>,
    pub outcome: DecodeOutcome,
}

/// Generate a continuation of `prompt_ids`.
///
/// Each call is a fresh session. The end-marker check is textual: the sampled
/// token is detokenized, trimmed, and compared against the end literal, which
/// catches detokenizers that surface the marker inside surrounding whitespace.
pub fn generate(
    scorer: &impl NextTokenScorer,
    codec: &impl Codec,
    prompt_ids: &[u32],
    options: &DecodeOptions,
    rng: &mut impl Rng,
) -> Result<Decoded> {
    let sampler = NucleusSampler::new(options.temperature, options.top_p);
    let mut ids = prompt_ids.to_vec();
    let prompt_len = ids.len();

    let mut outcome = DecodeOutcome::LengthExhausted;
    for _ in 0..options.max_new_tokens {
        let logits = scorer.score(&ids)?;
        let next = sampler.sample(logits, rng);
        if codec.decode(&[next])?.trim() == EOS_TOKEN {
            outcome = DecodeOutcome::Completed;
            break;
        }
        ids.push(next);
    }

    Ok(Decoded {
        ids: ids.split_off(prompt_len),
        outcome,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
