//! # cqr-infer — Decoding Runtime
//!
//! * **[`NucleusSampler`]** — temperature + top-p (nucleus) next-token choice.
//! * **[`generate`]** — bounded autoregressive decode loop over a
//!   [`NextTokenScorer`] capability.
//! * **[`Rewriter`]** — load a trained model directory and rewrite queries.

pub mod decode;
pub mod runtime;
pub mod sampler;

pub use decode::{generate, DecodeOptions, DecodeOutcome, Decoded, NextTokenScorer};
pub use runtime::{
    build_prompt, clamp_prompt, predict_with_model, strip_special_literals, ModelScorer, Rewriter,
};
pub use sampler::{top_p_filter, NucleusSampler};
