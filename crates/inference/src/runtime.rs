//! Rewrite runtime: load a trained model directory, build prompts, decode.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use cqr_common::{Codec, ModelConfig, RewriteTokenizer, SpecialTokens};
use cqr_model::RewriteLm;

use crate::decode::{generate, DecodeOptions, Decoded, NextTokenScorer};

/// Build the decode prompt for a turn history.
///
/// Classification marker first when multi-task, then separator-joined turns,
/// then the begin-of-target token the model continues from.
pub fn build_prompt(
    input_sents: &[String],
    codec: &impl Codec,
    special: &SpecialTokens,
    multitask: bool,
) -> Result<Vec<u32>> {
    if input_sents.is_empty() {
        anyhow::bail!("cannot build a prompt from an empty turn history");
    }
    let mut ids = Vec::new();
    if multitask {
        let cls = special
            .cls
            .ok_or_else(|| anyhow!("multitask prompt requires a classification-marker id"))?;
        ids.push(cls);
    }
    for sent in input_sents {
        ids.extend(codec.encode(sent)?);
        ids.push(special.sep);
    }
    ids.pop();
    ids.push(special.bos);
    Ok(ids)
}

/// Fit a prompt into the model's block, leaving room for at least one
/// generated token.
///
/// The position table has exactly `block_size` entries, so a prefix that grows
/// past it cannot be scored. Long histories are tail-truncated (the newest
/// turns carry the referents being resolved); under multi-task the leading
/// classification marker is kept in front of the retained tail.
pub fn clamp_prompt(ids: Vec<u32>, block_size: usize, multitask: bool) -> Vec<u32> {
    let keep = block_size.saturating_sub(1).max(1);
    if ids.len() <= keep {
        return ids;
    }
    if multitask && keep >= 2 {
        let marker = ids[0];
        let mut out = Vec::with_capacity(keep);
        out.push(marker);
        out.extend_from_slice(&ids[ids.len() - (keep - 1)..]);
        out
    } else {
        ids[ids.len() - keep..].to_vec()
    }
}

/// Steps available before the running prefix would outgrow the block.
fn decode_budget(block_size: usize, prompt_len: usize, requested: usize) -> usize {
    requested.min(block_size.saturating_sub(prompt_len))
}

/// Remove every special-token literal that leaked through detokenization.
pub fn strip_special_literals(text: &str, literals: &[&str]) -> String {
    let mut out = text.to_string();
    for literal in literals {
        out = out.replace(literal, "");
    }
    out.trim().to_string()
}

// ── Model-backed scorer ─────────────────────────────────────────────────────

/// [`NextTokenScorer`] over a trained [`RewriteLm`].
///
/// Re-runs the full prefix each call; correctness over speed, and the
/// qualitative-eval decode budget is small.
pub struct ModelScorer<'a> {
    model: &'a RewriteLm,
    device: &'a Device,
}

impl<'a> ModelScorer<'a> {
    pub fn new(model: &'a RewriteLm, device: &'a Device) -> Self {
        Self { model, device }
    }
}

impl NextTokenScorer for ModelScorer<'_> {
    fn score(&self, prefix: &[u32]) -> Result<Vec<f32>> {
        let input = Tensor::new(prefix, self.device)?.unsqueeze(0)?; // (1, t)
        let logits = self.model.forward(&input)?;
        let (_, t, _) = logits.dims3()?;
        let last = logits.i((0, t - 1))?;
        Ok(last.to_vec1::<f32>()?)
    }
}

// ── Rewriter ────────────────────────────────────────────────────────────────

/// High-level rewrite runtime: owns the model, tokenizer, and RNG.
pub struct Rewriter {
    model: RewriteLm,
    #[allow(dead_code)]
    varmap: VarMap,
    tokenizer: RewriteTokenizer,
    options: DecodeOptions,
    multitask: bool,
    block_size: usize,
    device: Device,
    rng: StdRng,
}

impl Rewriter {
    /// Load `config.json`, `model.safetensors`, and `tokenizer.json` from a
    /// model directory.
    pub fn load(
        model_dir: &Path,
        options: DecodeOptions,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        let config = ModelConfig::load(&model_dir.join("config.json"))
            .context("load model config")?;
        let tokenizer = RewriteTokenizer::from_file(&model_dir.join("tokenizer.json"), config.multitask)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = RewriteLm::new(vb, &config)?;
        varmap
            .load(&model_dir.join("model.safetensors"))
            .context("load model weights")?;

        Ok(Self {
            model,
            varmap,
            tokenizer,
            options,
            multitask: config.multitask,
            block_size: config.block_size,
            device,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn tokenizer(&self) -> &RewriteTokenizer {
        &self.tokenizer
    }

    /// Rewrite one turn history into plain text.
    pub fn predict(&mut self, input_sents: &[String]) -> Result<String> {
        let special = *self.tokenizer.special();
        let prompt = build_prompt(input_sents, &self.tokenizer, &special, self.multitask)?;
        let prompt = clamp_prompt(prompt, self.block_size, self.multitask);
        let mut options = self.options;
        options.max_new_tokens =
            decode_budget(self.block_size, prompt.len(), options.max_new_tokens);
        let scorer = ModelScorer::new(&self.model, &self.device);
        let Decoded { ids, .. } =
            generate(&scorer, &self.tokenizer, &prompt, &options, &mut self.rng)?;
        let text = self.tokenizer.decode(&ids)?;
        Ok(strip_special_literals(&text, &special.literals()))
    }
}

/// One-off prediction against a borrowed model (used for the periodic
/// qualitative decode during training, where the trainer owns the model).
pub fn predict_with_model(
    model: &RewriteLm,
    tokenizer: &RewriteTokenizer,
    input_sents: &[String],
    options: &DecodeOptions,
    multitask: bool,
    device: &Device,
    rng: &mut StdRng,
) -> Result<String> {
    let special = *tokenizer.special();
    let block_size = model.config().block_size;
    let prompt = build_prompt(input_sents, tokenizer, &special, multitask)?;
    let prompt = clamp_prompt(prompt, block_size, multitask);
    let mut options = *options;
    options.max_new_tokens = decode_budget(block_size, prompt.len(), options.max_new_tokens);
    let scorer = ModelScorer::new(model, device);
    let Decoded { ids, .. } = generate(&scorer, tokenizer, &prompt, &options, rng)?;
    let text = tokenizer.decode(&ids)?;
    Ok(strip_special_literals(&text, &special.literals()))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cqr_common::{BOS_TOKEN, CLS_TOKEN, EOS_TOKEN, PAD_TOKEN, SEP_TOKEN};

    struct FakeCodec;

    impl Codec for FakeCodec {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.split_whitespace().map(|w| 100 + w.len() as u32).collect())
        }
        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| format!("w{id}")).collect::<Vec<_>>().join(" "))
        }
    }

    const SPECIAL: SpecialTokens = SpecialTokens {
        sep: 0,
        pad: 1,
        bos: 2,
        eos: 3,
        cls: Some(4),
    };

    #[test]
    fn prompt_is_separator_joined_and_bos_terminated() {
        let sents = vec!["a b".to_string(), "c".to_string()];
        let prompt = build_prompt(&sents, &FakeCodec, &SPECIAL, false).unwrap();
        assert_eq!(prompt, vec![101, 101, SPECIAL.sep, 101, SPECIAL.bos]);
    }

    #[test]
    fn multitask_prompt_leads_with_the_marker() {
        let sents = vec!["a".to_string()];
        let prompt = build_prompt(&sents, &FakeCodec, &SPECIAL, true).unwrap();
        assert_eq!(prompt[0], SPECIAL.cls.unwrap());
        assert_eq!(*prompt.last().unwrap(), SPECIAL.bos);
    }

    #[test]
    fn empty_history_is_rejected() {
        assert!(build_prompt(&[], &FakeCodec, &SPECIAL, false).is_err());
    }

    #[test]
    fn short_prompt_passes_through_unclamped() {
        let ids: Vec<u32> = (0..50).collect();
        assert_eq!(clamp_prompt(ids.clone(), 200, false), ids);
    }

    #[test]
    fn long_prompt_is_tail_truncated_to_fit_the_block() {
        // 300-token history against a 200-position table: keep the newest
        // 199 tokens so at least one can still be generated.
        let ids: Vec<u32> = (0..300).collect();
        let clamped = clamp_prompt(ids.clone(), 200, false);
        assert_eq!(clamped.len(), 199);
        assert_eq!(clamped, ids[101..].to_vec());
        assert_eq!(*clamped.last().unwrap(), 299);
    }

    #[test]
    fn clamped_multitask_prompt_keeps_the_leading_marker() {
        let mut ids = vec![SPECIAL.cls.unwrap()];
        ids.extend(100..400u32);
        let clamped = clamp_prompt(ids.clone(), 16, true);
        assert_eq!(clamped.len(), 15);
        assert_eq!(clamped[0], SPECIAL.cls.unwrap());
        assert_eq!(clamped[1..], ids[ids.len() - 14..]);
    }

    #[test]
    fn decode_budget_shrinks_near_the_block_boundary() {
        assert_eq!(decode_budget(200, 150, 20), 20);
        assert_eq!(decode_budget(200, 190, 20), 10);
        assert_eq!(decode_budget(200, 199, 20), 1);
        assert_eq!(decode_budget(200, 250, 20), 0);
    }

    #[test]
    fn leaked_literals_are_stripped() {
        let text = format!("What did {EOS_TOKEN} Bowie {PAD_TOKEN}{PAD_TOKEN} record? {SEP_TOKEN}");
        let cleaned = strip_special_literals(
            &text,
            &[SEP_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN, CLS_TOKEN],
        );
        assert_eq!(cleaned, "What did  Bowie  record?");
    }
}
