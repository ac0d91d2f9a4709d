//! # cqr-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`SpecialTokens`]** / **[`Codec`]** / **[`RewriteTokenizer`]** — the
//!   tokenizer seam: special-token ids resolved and validated once at startup.
//! * **[`DialogRecord`]** / **[`EncodedExample`]** — one dialog turn and its
//!   fixed-length encoded form (ids + loss-masked labels).
//! * **[`RewriteDataset`]** — JSONL loading, shuffling, batching.
//! * **[`collate`]** — raw examples → Candle tensors.
//! * **[`convert_canard`]** — CANARD JSON → dialog-rewrite JSONL records.

pub mod config;
pub mod convert;
pub mod data;
pub mod tokens;

pub use config::ModelConfig;
pub use convert::{convert_canard, CanardTurn, TaskDirection};
pub use data::{
    collate, encode_record, CollatedBatch, DialogRecord, EncodedExample, RewriteDataset,
    IGNORE_INDEX,
};
pub use tokens::{
    Codec, RewriteTokenizer, SpecialTokens, BOS_TOKEN, CLS_TOKEN, EOS_TOKEN, PAD_TOKEN, SEP_TOKEN,
};
