//! # cqr-train — Training Engine
//!
//! Training loop, losses, and scheduling for the rewrite model:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedule. One call to
//!   [`Trainer::step`] runs forward + combined multi-task loss over the
//!   accumulated micro-batches, then backward, gradient clipping, AdamW,
//!   and schedule advancement.
//! * **[`masked_lm_loss`]** — per-token cross entropy with the ignore
//!   sentinel and optional per-example needs-rewrite weighting.
//! * **[`LinearWarmupSchedule`]** — linear warmup, then linear decay to zero.

pub mod loss;
pub mod scheduler;
pub mod trainer;

pub use loss::masked_lm_loss;
pub use scheduler::LinearWarmupSchedule;
pub use trainer::{EvalMetrics, StepMetrics, Trainer, TrainerConfig};
