//! CANARD → dialog-rewrite JSONL conversion.
//!
//! CANARD ships as one JSON array of annotated QuAC turns. Conversion groups
//! consecutive turns of a dialog under one `topic_number` and picks the task
//! direction: learn to *rewrite* (context-dependent question → self-contained
//! rewrite) or to *simplify* (rewrite → original question). The direction is
//! fixed at conversion time; training never flips it.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::data::DialogRecord;

/// One annotated turn from the CANARD release.
#[derive(Debug, Clone, Deserialize)]
pub struct CanardTurn {
    #[serde(rename = "QuAC_dialog_id")]
    pub dialog_id: String,
    #[serde(rename = "Question_no")]
    pub question_no: i64,
    #[serde(rename = "History")]
    pub history: Vec<String>,
    #[serde(rename = "Question")]
    pub question: String,
    #[serde(rename = "Rewrite")]
    pub rewrite: String,
}

/// Which way the model is trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDirection {
    /// Input = history + original question; target = self-contained rewrite.
    Rewrite,
    /// Input = history + rewrite; target = original (context-dependent) question.
    Simplify,
}

impl TaskDirection {
    pub fn from_str(s: &str) -> Self {
        match s {
            "simplify" => Self::Simplify,
            _ => Self::Rewrite,
        }
    }
}

/// Parse the CANARD JSON array.
pub fn parse_canard(json: &str) -> Result<Vec<CanardTurn>> {
    serde_json::from_str(json).context("parse CANARD JSON array")
}

/// Convert CANARD turns to dialog records.
///
/// Topic numbers are assigned per run of equal `QuAC_dialog_id`; query numbers
/// are the 1-based `Question_no + 1` from the source. With `with_needs_rewrite`
/// each record carries a 0/1 flag: 1 iff the target differs from the source
/// utterance after whitespace/case normalisation.
pub fn convert_canard(
    turns: &[CanardTurn],
    direction: TaskDirection,
    with_needs_rewrite: bool,
) -> Vec<DialogRecord> {
    let mut records = Vec::with_capacity(turns.len());
    let mut current_id: Option<&str> = None;
    let mut topic_number = 0i64;

    for turn in turns {
        if current_id != Some(turn.dialog_id.as_str()) {
            topic_number += 1;
            current_id = Some(turn.dialog_id.as_str());
        }

        let (source, target) = match direction {
            TaskDirection::Rewrite => (&turn.question, &turn.rewrite),
            TaskDirection::Simplify => (&turn.rewrite, &turn.question),
        };
        let mut input = turn.history.clone();
        input.push(source.clone());

        let needs_rewrite = with_needs_rewrite
            .then(|| u8::from(normalize(source) != normalize(target)));

        records.push(DialogRecord {
            topic_number,
            query_number: turn.question_no + 1,
            input,
            target: target.clone(),
            needs_rewrite,
        });
    }
    records
}

/// Case-fold and collapse whitespace for the needs-rewrite comparison.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ───────────────────────────────────────────────────────────────────
