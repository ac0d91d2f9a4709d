//! Decoder-only transformer with an optional needs-rewrite head.
//!
//! GPT-style: learned token + position embeddings, pre-norm blocks, GELU FFN,
//! weight tying between the token embedding and the output projection. When
//! `multitask` is set the model carries a second head that classifies whether
//! the current query needs rewriting, pooled at the classification-marker
//! position of each sequence.

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use cqr_common::ModelConfig;

use crate::attention::CausalSelfAttention;

/// Number of classes for the needs-rewrite head (no / yes).
const NUM_MC_CLASSES: usize = 2;

// ── FFN ─────────────────────────────────────────────────────────────────────

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c_fc = linear(config.hidden_size, config.intermediate_size, vb.pp("c_fc"))?;
        let c_proj = linear(config.intermediate_size, config.hidden_size, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?;
        let x = x.gelu()?;
        self.c_proj.forward(&x)
    }
}

// ── Decoder Block ───────────────────────────────────────────────────────────

/// Pre-norm decoder block: norm → attention → residual, norm → FFN → residual.
struct DecoderBlock {
    ln1: LayerNorm,
    attn: CausalSelfAttention,
    ln2: LayerNorm,
    mlp: Mlp,
}

impl DecoderBlock {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let ln1 = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln1"))?;
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let ln2 = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        Ok(Self {
            ln1,
            attn,
            ln2,
            mlp,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = (residual + self.attn.forward(&self.ln1.forward(x)?)?)?;
        let residual = &x;
        residual + self.mlp.forward(&self.ln2.forward(&x)?)?
    }
}

// ── RewriteLm ───────────────────────────────────────────────────────────────

/// Decoder-only rewrite model.
///
/// Weight tying: the token embedding `wte` and the output projection share the
/// same matrix; no separate lm_head is stored.
pub struct RewriteLm {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<DecoderBlock>,
    ln_f: LayerNorm,
    mc_head: Option<Linear>,
    config: ModelConfig,
}

impl RewriteLm {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let wpe = embedding(config.block_size, config.hidden_size, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(DecoderBlock::new(config, vb.pp(format!("h.{i}")))?);
        }
        let ln_f = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln_f"))?;

        let mc_head = if config.multitask {
            Some(linear(config.hidden_size, NUM_MC_CLASSES, vb.pp("mc_head"))?)
        } else {
            None
        };

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            mc_head,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Final hidden states, shape `(batch, seq_len, hidden)`.
    pub fn hidden_states(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, t as u32, input_ids.device())?;
        let mut x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.ln_f.forward(&x)
    }

    /// Project hidden states to vocabulary logits via the tied embedding.
    pub fn lm_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let wte_weight = self.wte.embeddings();
        let (b, t, h) = hidden.dims3()?;
        let flat = hidden.reshape((b * t, h))?;
        let logits = flat.matmul(&wte_weight.t()?)?;
        logits.reshape((b, t, self.config.vocab_size))
    }

    /// Full LM forward pass: `(batch, seq_len)` ids → `(batch, seq_len, vocab)` logits.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden_states(input_ids)?;
        self.lm_logits(&hidden)
    }

    /// Needs-rewrite logits pooled at the given marker position per row.
    ///
    /// `positions[i]` is the index of the classification marker in row `i`
    /// (its last occurrence; the Example Builder guarantees one exists inside
    /// the block). Output shape `(batch, 2)`.
    pub fn mc_logits(&self, hidden: &Tensor, positions: &[usize]) -> Result<Tensor> {
        let mc_head = self.mc_head.as_ref().ok_or_else(|| {
            candle_core::Error::Msg("model was built without the needs-rewrite head".to_string())
        })?;
        let (b, t, _h) = hidden.dims3()?;
        if positions.len() != b {
            return Err(candle_core::Error::Msg(format!(
                "mc_logits: {} positions for batch of {b}",
                positions.len()
            )));
        }
        let mut pooled = Vec::with_capacity(b);
        for (i, &pos) in positions.iter().enumerate() {
            if pos >= t {
                return Err(candle_core::Error::Msg(format!(
                    "mc_logits: marker position {pos} out of range for seq_len {t}"
                )));
            }
            pooled.push(hidden.i((i, pos))?);
        }
        let pooled = Tensor::stack(&pooled, 0)?; // (b, hidden)
        mc_head.forward(&pooled)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_config(multitask: bool) -> ModelConfig {
        ModelConfig {
            vocab_size: 64,
            hidden_size: 16,
            num_heads: 4,
            num_layers: 2,
            intermediate_size: 32,
            block_size: 12,
            multitask,
            ..Default::default()
        }
    }

    fn build(config: &ModelConfig) -> RewriteLm {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        RewriteLm::new(vb, config).unwrap()
    }

    #[test]
    fn forward_logit_shape() {
        let model = build(&tiny_config(false));
        let ids = Tensor::zeros((3, 12), DType::U32, &Device::Cpu).unwrap();
        let logits = model.forward(&ids).unwrap();
        assert_eq!(logits.dims(), &[3, 12, 64]);
    }

    #[test]
    fn mc_logits_shape_and_gating() {
        let model = build(&tiny_config(true));
        let ids = Tensor::zeros((2, 12), DType::U32, &Device::Cpu).unwrap();
        let hidden = model.hidden_states(&ids).unwrap();
        let mc = model.mc_logits(&hidden, &[3, 7]).unwrap();
        assert_eq!(mc.dims(), &[2, 2]);

        let plain = build(&tiny_config(false));
        let hidden = plain.hidden_states(&ids).unwrap();
        assert!(plain.mc_logits(&hidden, &[0, 0]).is_err());
    }

    #[test]
    fn mc_position_out_of_range_is_rejected() {
        let model = build(&tiny_config(true));
        let ids = Tensor::zeros((1, 12), DType::U32, &Device::Cpu).unwrap();
        let hidden = model.hidden_states(&ids).unwrap();
        assert!(model.mc_logits(&hidden, &[12]).is_err());
    }
}
