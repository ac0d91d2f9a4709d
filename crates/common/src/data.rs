//! Data pipeline: dialog records, block encoding, batching.
//!
//! One JSONL line per training example (`topic_number`, `query_number`,
//! `input` turns, `target`, optional `needs_rewrite`). [`encode_record`] turns
//! a record into a fixed-length `(ids, labels, pred_begin_pos)` triple for
//! teacher-forced LM training; [`collate`] stacks a batch into Candle tensors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::tokens::{Codec, SpecialTokens};

/// Label value for positions excluded from the LM loss.
pub const IGNORE_INDEX: i64 = -1;

// ── Records ─────────────────────────────────────────────────────────────────

/// One dialog-rewrite example as stored in the converted JSONL dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogRecord {
    /// Groups consecutive turns of one conversation.
    pub topic_number: i64,
    /// 1-based position of this turn within its topic.
    pub query_number: i64,
    /// Prior turns followed by the utterance to transform.
    pub input: Vec<String>,
    /// Desired output utterance.
    pub target: String,
    /// 1 if the target meaningfully differs from the source utterance.
    /// Present only in multi-task datasets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_rewrite: Option<u8>,
}

/// A record encoded into a fixed-length training block.
///
/// Built once during dataset preparation and never mutated. `labels[i]` is
/// either the token id to score at position `i` or [`IGNORE_INDEX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub topic_number: i64,
    pub query_number: i64,
    pub ids: Vec<u32>,
    pub labels: Vec<i64>,
    /// Index where target-token generation begins (first position after the
    /// begin-of-target token).
    pub pred_begin_pos: usize,
    pub needs_rewrite: Option<u8>,
}

// ── Example Builder ─────────────────────────────────────────────────────────

/// Encode one dialog record into a fixed-length `(ids, labels)` block.
///
/// Layout: `turn₀ <SEP> turn₁ <SEP> … turnₙ [<CLS>] <BOS> target… <EOS>`,
/// truncated or right-padded to exactly `block_size`. Labels mirror `ids` over
/// the target span and are [`IGNORE_INDEX`] everywhere else. When `multitask`
/// truncation drops the classification marker, the final token is replaced
/// with it so downstream pooling can always locate the marker inside the
/// block.
pub fn encode_record(
    record: &DialogRecord,
    codec: &impl Codec,
    special: &SpecialTokens,
    block_size: usize,
    multitask: bool,
) -> AnyhowResult<EncodedExample> {
    if record.input.is_empty() {
        bail!(
            "record {}_{} has an empty input history",
            record.topic_number,
            record.query_number
        );
    }
    let cls = if multitask {
        match special.cls {
            Some(id) => Some(id),
            None => bail!("multitask encoding requires a classification-marker token id"),
        }
    } else {
        None
    };
    if multitask && record.needs_rewrite.is_none() {
        bail!(
            "record {}_{} is missing needs_rewrite, required for multitask training",
            record.topic_number,
            record.query_number
        );
    }

    let mut ids: Vec<u32> = Vec::new();
    for sent in &record.input {
        ids.extend(
            codec
                .encode(sent)
                .with_context(|| format!("tokenize input turn {sent:?}"))?,
        );
        ids.push(special.sep);
    }
    // Turns are separator-joined, not separator-terminated.
    ids.pop();
    if let Some(cls) = cls {
        ids.push(cls);
    }
    ids.push(special.bos);

    let pred_begin_pos = ids.len();
    let mut labels: Vec<i64> = vec![IGNORE_INDEX; pred_begin_pos];

    let target_ids = codec
        .encode(&record.target)
        .with_context(|| format!("tokenize target {:?}", record.target))?;
    ids.extend(&target_ids);
    labels.extend(target_ids.iter().map(|&t| i64::from(t)));
    ids.push(special.eos);
    labels.push(i64::from(special.eos));

    if ids.len() > block_size {
        ids.truncate(block_size);
        labels.truncate(block_size);
        if let Some(cls) = cls {
            // Pooling locates the marker inside the truncated block, so it
            // must survive truncation: force it into the final slot.
            if !ids.contains(&cls) {
                ids.pop();
                ids.push(cls);
            }
        }
    } else {
        let pad_num = block_size - ids.len();
        ids.extend(std::iter::repeat(special.pad).take(pad_num));
        labels.extend(std::iter::repeat(IGNORE_INDEX).take(pad_num));
    }

    if ids.len() != block_size || labels.len() != block_size {
        bail!(
            "encoded block for record {}_{} has lengths ids={} labels={}, expected {block_size}; \
             tokenizer/configuration mismatch",
            record.topic_number,
            record.query_number,
            ids.len(),
            labels.len(),
        );
    }

    Ok(EncodedExample {
        topic_number: record.topic_number,
        query_number: record.query_number,
        ids,
        labels,
        pred_begin_pos,
        needs_rewrite: record.needs_rewrite,
    })
}

// ── RewriteDataset ──────────────────────────────────────────────────────────

/// In-memory dataset of encoded examples loaded from JSONL files.
pub struct RewriteDataset {
    examples: Vec<EncodedExample>,
}

impl RewriteDataset {
    /// Load and encode every record from the given JSONL files.
    pub fn load(
        paths: &[impl AsRef<Path>],
        codec: &impl Codec,
        special: &SpecialTokens,
        block_size: usize,
        multitask: bool,
    ) -> AnyhowResult<Self> {
        let mut examples = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let reader =
                BufReader::new(File::open(path).with_context(|| {
                    format!("open dataset file {}", path.display())
                })?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: DialogRecord = serde_json::from_str(line).with_context(|| {
                    format!("parse {}:{}", path.display(), line_no + 1)
                })?;
                let example = encode_record(&record, codec, special, block_size, multitask)
                    .with_context(|| format!("encode {}:{}", path.display(), line_no + 1))?;
                examples.push(example);
            }
        }
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<EncodedExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[EncodedExample] {
        &self.examples
    }

    /// Shuffle example order in place (once per epoch, like a random sampler).
    pub fn shuffle(&mut self, rng: &mut impl rand::Rng) {
        self.examples.shuffle(rng);
    }

    /// Yield batches of at most `batch_size` examples; the last may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = &[EncodedExample]> + '_ {
        self.examples.chunks(batch_size.max(1))
    }
}

// ── Collation ───────────────────────────────────────────────────────────────

/// A batch of encoded examples stacked into tensors.
pub struct CollatedBatch {
    /// Token ids, shape `(batch, block_size)`, u32.
    pub input_ids: Tensor,
    /// Loss labels, shape `(batch, block_size)`, i64 with [`IGNORE_INDEX`].
    pub labels: Tensor,
    /// Per-example offset where target generation begins.
    pub pred_begin: Vec<usize>,
    /// Per-example needs-rewrite flags (multitask batches only).
    pub needs_rewrite: Option<Vec<u32>>,
    /// Index of the last classification-marker occurrence per row
    /// (multitask batches only).
    pub cls_positions: Option<Vec<usize>>,
}

impl CollatedBatch {
    pub fn batch_size(&self) -> usize {
        self.pred_begin.len()
    }
}

/// Stack a slice of examples into a [`CollatedBatch`].
///
/// `cls_id` must be provided for multitask batches so the marker position can
/// be located; it is the *last* occurrence in each row, matching the builder's
/// truncation guarantee.
pub fn collate(
    examples: &[EncodedExample],
    cls_id: Option<u32>,
    device: &Device,
) -> Result<CollatedBatch> {
    let b = examples.len();
    let t = examples.first().map(|e| e.ids.len()).unwrap_or(0);

    let mut ids = Vec::with_capacity(b * t);
    let mut labels = Vec::with_capacity(b * t);
    let mut pred_begin = Vec::with_capacity(b);
    for ex in examples {
        ids.extend_from_slice(&ex.ids);
        labels.extend_from_slice(&ex.labels);
        pred_begin.push(ex.pred_begin_pos);
    }
    let input_ids = Tensor::from_vec(ids, (b, t), device)?;
    let labels = Tensor::from_vec(labels, (b, t), device)?;

    let multitask = examples.iter().all(|e| e.needs_rewrite.is_some()) && b > 0;
    let (needs_rewrite, cls_positions) = if multitask {
        let flags = examples
            .iter()
            .map(|e| u32::from(e.needs_rewrite.unwrap_or(0)))
            .collect();
        let cls_id = cls_id.ok_or_else(|| {
            candle_core::Error::Msg("collate: multitask batch without a cls token id".to_string())
        })?;
        let mut positions = Vec::with_capacity(b);
        for ex in examples {
            let pos = ex.ids.iter().rposition(|&id| id == cls_id).ok_or_else(|| {
                candle_core::Error::Msg(format!(
                    "collate: no classification marker in example {}_{}",
                    ex.topic_number, ex.query_number
                ))
            })?;
            positions.push(pos);
        }
        (Some(flags), Some(positions))
    } else {
        (None, None)
    };

    Ok(CollatedBatch {
        input_ids,
        labels,
        pred_begin,
        needs_rewrite,
        cls_positions,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-level fake vocabulary: each whitespace token maps to a
    /// deterministic id past the special-token range.
    struct FakeCodec;

    impl FakeCodec {
        fn new() -> Self {
            Self
        }
    }

    impl Codec for FakeCodec {
        fn encode(&self, text: &str) -> AnyhowResult<Vec<u32>> {
            Ok(text
                .split_whitespace()
                .map(|w| 100 + w.bytes().map(u32::from).sum::<u32>() % 1000)
                .collect())
        }

        fn decode(&self, ids: &[u32]) -> AnyhowResult<String> {
            Ok(ids
                .iter()
                .map(|id| format!("w{id}"))
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    const SPECIAL: SpecialTokens = SpecialTokens {
        sep: 0,
        pad: 1,
        bos: 2,
        eos: 3,
        cls: Some(4),
    };

    fn record(input: &[&str], target: &str, needs_rewrite: Option<u8>) -> DialogRecord {
        DialogRecord {
            topic_number: 7,
            query_number: 2,
            input: input.iter().map(|s| s.to_string()).collect(),
            target: target.to_string(),
            needs_rewrite,
        }
    }

    #[test]
    fn encoded_lengths_match_block_size() {
        let codec = FakeCodec::new();
        let rec = record(
            &["Who wrote Hamlet?", "What else did he write?"],
            "What else did Shakespeare write?",
            None,
        );
        let ex = encode_record(&rec, &codec, &SPECIAL, 40, false).unwrap();
        assert_eq!(ex.ids.len(), 40);
        assert_eq!(ex.labels.len(), 40);
    }

    #[test]
    fn labels_are_masked_before_pred_begin_and_verbatim_after() {
        let codec = FakeCodec::new();
        let rec = record(&["a b", "c d"], "x y z", None);
        let ex = encode_record(&rec, &codec, &SPECIAL, 20, false).unwrap();

        // Input layout: a b <SEP> c d <BOS> → pred_begin_pos = 6.
        assert_eq!(ex.pred_begin_pos, 6);
        for i in 0..ex.pred_begin_pos {
            assert_eq!(ex.labels[i], IGNORE_INDEX, "position {i}");
        }
        let target_ids = codec.encode("x y z").unwrap();
        for (k, &tid) in target_ids.iter().enumerate() {
            let i = ex.pred_begin_pos + k;
            assert_eq!(ex.labels[i], i64::from(tid));
            assert_eq!(ex.ids[i], tid);
        }
        // End token is scored.
        let eos_pos = ex.pred_begin_pos + target_ids.len();
        assert_eq!(ex.ids[eos_pos], SPECIAL.eos);
        assert_eq!(ex.labels[eos_pos], i64::from(SPECIAL.eos));
        // Remainder is padding / ignore.
        for i in (eos_pos + 1)..20 {
            assert_eq!(ex.ids[i], SPECIAL.pad);
            assert_eq!(ex.labels[i], IGNORE_INDEX);
        }
    }

    #[test]
    fn two_turn_scenario_is_separator_joined() {
        let codec = FakeCodec::new();
        let rec = record(
            &["Who wrote Hamlet?", "What else did he write?"],
            "What else did Shakespeare write?",
            None,
        );
        let ex = encode_record(&rec, &codec, &SPECIAL, 20, false).unwrap();

        let turn0 = codec.encode("Who wrote Hamlet?").unwrap();
        let turn1 = codec.encode("What else did he write?").unwrap();
        let mut expected = turn0.clone();
        expected.push(SPECIAL.sep);
        expected.extend(&turn1);
        expected.push(SPECIAL.bos);
        assert_eq!(&ex.ids[..expected.len()], &expected[..]);
        assert_eq!(ex.pred_begin_pos, expected.len());
        // Exactly one separator: joined, not terminated.
        assert_eq!(ex.ids.iter().filter(|&&id| id == SPECIAL.sep).count(), 1);
    }

    #[test]
    fn truncation_without_multitask() {
        let codec = FakeCodec::new();
        let rec = record(
            &["Who wrote Hamlet?", "What else did he write?"],
            "What else did Shakespeare write?",
            None,
        );
        let ex = encode_record(&rec, &codec, &SPECIAL, 5, false).unwrap();
        assert_eq!(ex.ids.len(), 5);
        assert_eq!(ex.labels.len(), 5);
    }

    #[test]
    fn multitask_marker_sits_before_begin_token() {
        let codec = FakeCodec::new();
        let rec = record(&["a b c", "d e"], "tgt", Some(1));
        let ex = encode_record(&rec, &codec, &SPECIAL, 100, true).unwrap();
        assert_eq!(ex.ids[ex.pred_begin_pos - 1], SPECIAL.bos);
        assert_eq!(ex.ids[ex.pred_begin_pos - 2], SPECIAL.cls.unwrap());
        assert_eq!(
            ex.ids
                .iter()
                .filter(|&&id| id == SPECIAL.cls.unwrap())
                .count(),
            1
        );
    }

    #[test]
    fn multitask_truncation_restores_marker_at_final_position() {
        let codec = FakeCodec::new();
        let rec = record(
            &["a very long first turn with many words", "and another one"],
            "the target",
            Some(1),
        );
        // Block cuts inside the input turns, before the appended marker.
        let ex = encode_record(&rec, &codec, &SPECIAL, 5, true).unwrap();
        let cls = SPECIAL.cls.unwrap();
        assert_eq!(ex.ids.len(), 5);
        assert_eq!(*ex.ids.last().unwrap(), cls);
        assert_eq!(ex.ids.iter().filter(|&&id| id == cls).count(), 1);
    }

    #[test]
    fn empty_input_is_an_error() {
        let codec = FakeCodec::new();
        let rec = record(&[], "target", None);
        let err = encode_record(&rec, &codec, &SPECIAL, 20, false).unwrap_err();
        assert!(err.to_string().contains("empty input"));
    }

    #[test]
    fn multitask_requires_needs_rewrite_flag() {
        let codec = FakeCodec::new();
        let rec = record(&["a"], "b", None);
        assert!(encode_record(&rec, &codec, &SPECIAL, 20, true).is_err());
    }

    #[test]
    fn collate_shapes_and_marker_positions() {
        let codec = FakeCodec::new();
        let rec = record(&["a b", "c"], "x y", Some(1));
        let ex = encode_record(&rec, &codec, &SPECIAL, 16, true).unwrap();
        let batch = collate(
            &[ex.clone(), ex],
            SPECIAL.cls,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(batch.input_ids.dims(), &[2, 16]);
        assert_eq!(batch.labels.dims(), &[2, 16]);
        assert_eq!(batch.batch_size(), 2);
        let positions = batch.cls_positions.unwrap();
        // Marker sits right before <BOS>, one slot ahead of pred_begin.
        assert_eq!(positions, vec![batch.pred_begin[0] - 2; 2]);
        assert_eq!(batch.needs_rewrite.unwrap(), vec![1, 1]);
    }

    #[test]
    fn dataset_batches_and_shuffle() {
        use rand::SeedableRng;
        let codec = FakeCodec::new();
        let examples: Vec<_> = (0..5)
            .map(|i| {
                let rec = DialogRecord {
                    topic_number: i,
                    query_number: 1,
                    input: vec!["a".to_string()],
                    target: "b".to_string(),
                    needs_rewrite: None,
                };
                encode_record(&rec, &codec, &SPECIAL, 8, false).unwrap()
            })
            .collect();
        let mut ds = RewriteDataset::from_examples(examples);
        assert_eq!(ds.len(), 5);
        let sizes: Vec<usize> = ds.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        ds.shuffle(&mut rng);
        assert_eq!(ds.len(), 5);
    }
}
