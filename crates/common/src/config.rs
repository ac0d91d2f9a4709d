//! Model configuration for the rewrite LM.
//!
//! Serialised as JSON next to the checkpoint so a model directory is
//! self-describing. Missing fields fall back to `#[serde(default)]` values.

use serde::{Deserialize, Serialize};

/// Configuration for the decoder-only rewrite model.
///
/// `vocab_size` must match the tokenizer *after* the special rewrite tokens
/// have been added; the CLI sets it from the loaded tokenizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size, including the added special tokens.
    pub vocab_size: usize,
    /// Hidden size (model dimension).
    pub hidden_size: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// FFN intermediate dimension (typically 4 × hidden).
    pub intermediate_size: usize,
    /// Fixed training block length; every encoded example is exactly this long.
    pub block_size: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Attach the needs-rewrite classification head (multi-task training).
    #[serde(default)]
    pub multitask: bool,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50262, // GPT-2 BPE + 5 rewrite special tokens
            hidden_size: 256,
            num_heads: 8,
            num_layers: 6,
            intermediate_size: 1024,
            block_size: 200,
            layer_norm_eps: 1e-5,
            multitask: false,
        }
    }
}

impl ModelConfig {
    /// Head dimension (`hidden_size / num_heads`). Panics if not divisible.
    pub fn head_dim(&self) -> usize {
        assert!(
            self.hidden_size % self.num_heads == 0,
            "hidden_size ({}) must be divisible by num_heads ({})",
            self.hidden_size,
            self.num_heads,
        );
        self.hidden_size / self.num_heads
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
