//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (forward + combined multi-task loss) from the
//! optimisation step (backward, gradient clipping, AdamW, schedule advance).
//! A non-finite loss aborts the run with full diagnostic context rather than
//! continuing with corrupted gradients.

use std::path::PathBuf;

use anyhow::bail;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use cqr_common::{CollatedBatch, ModelConfig};
use cqr_model::RewriteLm;

use crate::loss::masked_lm_loss;
use crate::scheduler::LinearWarmupSchedule;

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    /// Micro-batches accumulated per optimiser step; effective batch =
    /// `batch_size * accumulation_steps`.
    pub accumulation_steps: usize,
    pub num_epochs: usize,
    /// 0 = bounded by epochs only.
    pub max_steps: usize,
    pub lr: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    /// Multiplier on the rewrite LM loss when combined with the
    /// classification loss (training only; evaluation weighs both equally).
    pub lm_loss_weight: f64,
    pub save_steps: usize,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            accumulation_steps: 1,
            num_epochs: 1,
            max_steps: 0,
            lr: 5e-5,
            warmup_steps: 0,
            weight_decay: 0.0,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            lm_loss_weight: 10.0,
            save_steps: 50,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lm_loss: f32,
    pub mc_loss: Option<f32>,
    pub lr: f64,
    /// Needs-rewrite classification hits in this batch (multitask only).
    pub mc_correct: usize,
    pub mc_total: usize,
}

/// Aggregate metrics over a validation pass.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    pub loss: f64,
    pub mc_accuracy: Option<f64>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and schedule.
pub struct Trainer {
    model: RewriteLm,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    schedule: LinearWarmupSchedule,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(
        model_config: ModelConfig,
        trainer_config: TrainerConfig,
        total_steps: usize,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = RewriteLm::new(vb, &model_config)?;
        let vars = varmap.all_vars();

        tracing::info!(
            vocab_size = model_config.vocab_size,
            hidden_size = model_config.hidden_size,
            num_layers = model_config.num_layers,
            block_size = model_config.block_size,
            multitask = model_config.multitask,
            "Built rewrite model"
        );

        let schedule =
            LinearWarmupSchedule::new(trainer_config.lr, trainer_config.warmup_steps, total_steps);
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: trainer_config.weight_decay,
                eps: trainer_config.adam_epsilon,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            schedule,
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    pub fn model(&self) -> &RewriteLm {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Combined loss for one batch.
    ///
    /// Returns `(loss tensor, lm value, mc value, mc hits)`. `lm_weight`
    /// multiplies the LM term (10 during training, 1 during evaluation,
    /// matching the multi-task recipe).
    fn batch_loss(
        &self,
        batch: &CollatedBatch,
        lm_weight: f64,
    ) -> anyhow::Result<(Tensor, f32, Option<f32>, usize)> {
        let hidden = self.model.hidden_states(&batch.input_ids)?;
        let logits = self.model.lm_logits(&hidden)?;

        let weights: Option<Vec<f32>> = batch
            .needs_rewrite
            .as_ref()
            .map(|flags| flags.iter().map(|&f| f as f32).collect());
        let lm = masked_lm_loss(&logits, &batch.labels, weights.as_deref())?;
        let lm_value = lm.to_scalar::<f32>()?;

        let (total, mc_value, mc_correct) = match (&batch.needs_rewrite, &batch.cls_positions) {
            (Some(flags), Some(positions)) => {
                let mc_logits = self.model.mc_logits(&hidden, positions)?;
                let mc_labels =
                    Tensor::from_vec(flags.clone(), (flags.len(),), &self.device)?;
                let mc = loss::cross_entropy(&mc_logits, &mc_labels)?;
                let mc_value = mc.to_scalar::<f32>()?;

                let predictions = mc_logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
                let correct = predictions
                    .iter()
                    .zip(flags.iter())
                    .filter(|(p, f)| p == f)
                    .count();

                let total = (mc + lm.affine(lm_weight, 0.0)?)?;
                (total, Some(mc_value), correct)
            }
            _ => (lm.affine(lm_weight, 0.0)?, None, 0),
        };

        Ok((total, lm_value, mc_value, mc_correct))
    }

    /// Execute one optimiser step over N accumulated micro-batches.
    ///
    /// Losses are scaled by `1/N` and summed into a single graph, so one
    /// backward pass carries the accumulated gradient.
    pub fn step(&mut self, batches: &[CollatedBatch]) -> anyhow::Result<StepMetrics> {
        let n = batches.len();
        if n == 0 {
            bail!("training step requires at least one micro-batch");
        }

        let mut total: Option<Tensor> = None;
        let mut loss_sum = 0.0f32;
        let mut lm_sum = 0.0f32;
        let mut mc_sum: Option<f32> = None;
        let mut mc_correct = 0usize;
        let mut mc_total = 0usize;

        for batch in batches {
            let (batch_loss, lm_value, mc_value, correct) =
                self.batch_loss(batch, self.config.lm_loss_weight)?;
            let loss_value = batch_loss.to_scalar::<f32>()?;
            if !loss_value.is_finite() {
                // Corrupted gradients are unrecoverable; stop with full context.
                bail!(
                    "non-finite training loss at step {}: total={loss_value} lm={lm_value} \
                     mc={mc_value:?} batch_size={} block_size={}; aborting before the update",
                    self.global_step,
                    batch.batch_size(),
                    self.model_config.block_size,
                );
            }
            loss_sum += loss_value;
            lm_sum += lm_value;
            if let Some(mc) = mc_value {
                mc_sum = Some(mc_sum.unwrap_or(0.0) + mc);
                mc_correct += correct;
                mc_total += batch.batch_size();
            }
            let scaled = batch_loss.affine(1.0 / n as f64, 0.0)?;
            total = Some(match total {
                None => scaled,
                Some(prev) => (prev + scaled)?,
            });
        }
        let total = total.unwrap();

        self.optimizer.set_learning_rate(self.schedule.current_lr());
        let mut grads = total.backward()?;
        if self.config.max_grad_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.max_grad_norm)?;
        }
        self.optimizer.step(&grads)?;

        let lr = self.schedule.current_lr();
        self.schedule.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_sum / n as f32,
            lm_loss: lm_sum / n as f32,
            mc_loss: mc_sum.map(|s| s / n as f32),
            lr,
            mc_correct,
            mc_total,
        })
    }

    /// Validation pass: average combined loss (LM weight 1) and needs-rewrite
    /// accuracy when the head is present.
    pub fn evaluate(&self, batches: &[CollatedBatch]) -> anyhow::Result<EvalMetrics> {
        let mut loss_sum = 0.0f64;
        let mut count = 0usize;
        let mut mc_correct = 0usize;
        let mut mc_total = 0usize;

        for batch in batches {
            let (total, _lm, mc_value, correct) = self.batch_loss(batch, 1.0)?;
            loss_sum += f64::from(total.to_scalar::<f32>()?);
            count += 1;
            if mc_value.is_some() {
                mc_correct += correct;
                mc_total += batch.batch_size();
            }
        }

        if count == 0 {
            bail!("evaluation requested with no validation batches");
        }
        Ok(EvalMetrics {
            loss: loss_sum / count as f64,
            mc_accuracy: (mc_total > 0).then(|| mc_correct as f64 / mc_total as f64),
        })
    }

    /// Save a step-tagged checkpoint.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self
            .config
            .output_dir
            .join(format!("checkpoint-{}.safetensors", self.global_step));
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Save the final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join("model.safetensors");
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Clip gradients so their global L2 norm ≤ `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<()> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += f64::from(g.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = total.sqrt().max(1e-12);
    let scale = if norm > max_norm { max_norm / norm } else { 1.0 };
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
