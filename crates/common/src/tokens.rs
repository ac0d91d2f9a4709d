//! Special-token configuration and the tokenizer seam.
//!
//! The pipeline never touches raw token strings outside this module: the
//! Example Builder and the decoder work against [`Codec`] plus a resolved
//! [`SpecialTokens`] table, so tests can substitute a fixed fake vocabulary.

use anyhow::{anyhow, Context, Result};
use tokenizers::{AddedToken, Tokenizer};

/// Separator between dialog turns.
pub const SEP_TOKEN: &str = "<SEP>";
/// Right-padding up to the block length.
pub const PAD_TOKEN: &str = "<PAD>";
/// Begin-of-target: teacher forcing starts after this token.
pub const BOS_TOKEN: &str = "<BOS>";
/// End-of-target: decoding stops on this token.
pub const EOS_TOKEN: &str = "<EOS>";
/// Classification marker pooled by the needs-rewrite head (multi-task only).
pub const CLS_TOKEN: &str = "<CLS>";

/// Resolved special-token ids, validated against the tokenizer once at startup.
///
/// `cls` is present only when multi-task training is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sep: u32,
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
    pub cls: Option<u32>,
}

impl SpecialTokens {
    /// Look up every special-token literal in the tokenizer vocabulary.
    ///
    /// Fails if any literal is missing; call after the literals have been
    /// added to the tokenizer (see [`RewriteTokenizer::from_file`]).
    pub fn resolve(tokenizer: &Tokenizer, multitask: bool) -> Result<Self> {
        let lookup = |literal: &str| {
            tokenizer
                .token_to_id(literal)
                .ok_or_else(|| anyhow!("special token {literal} missing from tokenizer vocabulary"))
        };
        Ok(Self {
            sep: lookup(SEP_TOKEN)?,
            pad: lookup(PAD_TOKEN)?,
            bos: lookup(BOS_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
            cls: if multitask {
                Some(lookup(CLS_TOKEN)?)
            } else {
                None
            },
        })
    }

    /// The textual forms to scrub from decoded output.
    pub fn literals(&self) -> Vec<&'static str> {
        let mut out = vec![SEP_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN];
        if self.cls.is_some() {
            out.push(CLS_TOKEN);
        }
        out
    }
}

/// Tokenize capability: text ↔ token ids.
///
/// Implemented by [`RewriteTokenizer`] for real runs and by fixed-vocabulary
/// fakes in tests.
pub trait Codec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// A `tokenizers` BPE tokenizer with the rewrite special tokens attached.
pub struct RewriteTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
}

impl RewriteTokenizer {
    /// Load `tokenizer.json`, add the rewrite special tokens, and resolve ids.
    pub fn from_file(path: &std::path::Path, multitask: bool) -> Result<Self> {
        let mut inner = Tokenizer::from_file(path.as_os_str().to_string_lossy().to_string())
            .map_err(|e| anyhow!("load tokenizer: {e}"))?;
        let mut literals = vec![SEP_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN];
        if multitask {
            literals.push(CLS_TOKEN);
        }
        let added: Vec<AddedToken> = literals
            .iter()
            .map(|l| AddedToken::from(l.to_string(), true))
            .collect();
        inner.add_special_tokens(&added);
        let special = SpecialTokens::resolve(&inner, multitask)
            .context("resolve special tokens after adding them")?;
        Ok(Self { inner, special })
    }

    pub fn special(&self) -> &SpecialTokens {
        &self.special
    }

    /// Vocabulary size including added special tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Persist the tokenizer (with added specials) into a model directory.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        self.inner
            .save(&path.as_os_str().to_string_lossy().to_string(), false)
            .map_err(|e| anyhow!("save tokenizer: {e}"))
    }
}

impl Codec for RewriteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("tokenize: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        // Special tokens stay visible; the caller strips their literals so the
        // end-marker check can compare decoded text.
        self.inner
            .decode(ids, false)
            .map_err(|e| anyhow!("detokenize: {e}"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_include_cls_only_for_multitask() {
        let without = SpecialTokens {
            sep: 0,
            pad: 1,
            bos: 2,
            eos: 3,
            cls: None,
        };
        assert!(!without.literals().contains(&CLS_TOKEN));

        let with = SpecialTokens {
            cls: Some(4),
            ..without
        };
        assert!(with.literals().contains(&CLS_TOKEN));
        assert_eq!(with.literals().len(), 5);
    }
}
