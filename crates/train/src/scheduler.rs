//! Learning-rate schedule: linear warmup, then linear decay to zero.

/// Linear warmup over `warmup_steps`, then linear decay so the rate reaches
/// zero at `total_steps`. `total_steps == 0` means no decay (constant after
/// warmup).
#[derive(Clone)]
pub struct LinearWarmupSchedule {
    step: usize,
    lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearWarmupSchedule {
    pub fn new(lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            step: 0,
            lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr, starting at 0.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * step as f64 / self.warmup_steps as f64;
        }

        if self.total_steps == 0 {
            return self.lr;
        }

        let step = step.min(self.total_steps);
        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let remaining = (self.total_steps - step) as f64 / decay_steps as f64;
        self.lr * remaining.clamp(0.0, 1.0)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
