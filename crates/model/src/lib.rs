//! # cqr-model — Rewrite Language Model
//!
//! A small decoder-only transformer (GPT-style, learned position embeddings,
//! weight-tied LM head) for conversational query rewriting:
//!
//! * **[`RewriteLm`]** — token/position embeddings, causal decoder blocks,
//!   LM logits, and an optional needs-rewrite classification head pooled at
//!   the classification-marker position.

pub mod attention;
pub mod model;

pub use attention::CausalSelfAttention;
pub use model::RewriteLm;
