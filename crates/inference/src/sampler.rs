//! Next-token selection: temperature scaling, nucleus (top-p) filtering,
//! greedy or multinomial choice.
//!
//! Temperature 0 means greedy (deterministic arg-max); any positive value
//! scales logits before filtering. Top-p ≤ 0 disables filtering entirely.

use rand::Rng;

/// Temperature + top-p sampling over a raw logit vector.
#[derive(Debug, Clone, Copy)]
pub struct NucleusSampler {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for NucleusSampler {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.9,
        }
    }
}

impl NucleusSampler {
    pub fn new(temperature: f64, top_p: f64) -> Self {
        Self { temperature, top_p }
    }

    /// Pick the next token id from unnormalised vocabulary scores.
    ///
    /// The `rng` is only consulted when `temperature > 0`; greedy decoding is
    /// fully deterministic.
    pub fn sample(&self, mut logits: Vec<f32>, rng: &mut impl Rng) -> u32 {
        if self.temperature > 0.0 {
            let temp = self.temperature as f32;
            for v in &mut logits {
                *v /= temp;
            }
        }

        top_p_filter(&mut logits, self.top_p);

        if self.temperature == 0.0 {
            return argmax(&logits);
        }

        // Softmax over the surviving logits, then one multinomial draw.
        let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 {
            for p in &mut probs {
                *p /= sum;
            }
        }
        weighted_sample(&probs, rng)
    }
}

/// Nucleus filter: keep the smallest descending-probability prefix whose
/// cumulative softmax mass reaches `top_p`; everything past it is masked to
/// negative infinity. The single highest-scoring entry always survives, so the
/// distribution can never become empty. No-op when `top_p <= 0`.
pub fn top_p_filter(logits: &mut [f32], top_p: f64) {
    if top_p <= 0.0 || logits.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let max_val = logits[order[0]];
    let exps: Vec<f32> = order.iter().map(|&i| (logits[i] - max_val).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let mut kept = order.len();
    let mut cumulative = 0.0f32;
    for (rank, &e) in exps.iter().enumerate() {
        cumulative += e / sum;
        if cumulative >= top_p as f32 {
            kept = rank + 1;
            break;
        }
    }
    for &i in &order[kept..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

fn argmax(v: &[f32]) -> u32 {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn weighted_sample(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= r {
            return i as u32;
        }
    }
    (probs.len().saturating_sub(1)) as u32
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn greedy_is_argmax() {
        let sampler = NucleusSampler::new(0.0, 0.9);
        let mut rng = StdRng::seed_from_u64(0);
        let token = sampler.sample(vec![0.1, 0.9, 0.3, 0.5], &mut rng);
        assert_eq!(token, 1);
    }

    #[test]
    fn greedy_is_deterministic_across_calls() {
        let sampler = NucleusSampler::new(0.0, 0.9);
        let logits = vec![-1.0, 2.5, 0.3, 2.4];
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(999);
        assert_eq!(
            sampler.sample(logits.clone(), &mut rng_a),
            sampler.sample(logits, &mut rng_b)
        );
    }

    #[test]
    fn filter_always_keeps_the_top_entry() {
        // Top entry alone carries ~all mass, far above any top_p.
        let mut logits = vec![50.0, 0.0, -5.0];
        top_p_filter(&mut logits, 0.01);
        assert!(logits[0].is_finite());
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);
    }

    #[test]
    fn filter_never_masks_everything() {
        for &top_p in &[0.001, 0.1, 0.5, 0.9, 1.0] {
            let mut logits = vec![1.0, 1.0, 1.0, 1.0];
            top_p_filter(&mut logits, top_p);
            assert!(
                logits.iter().any(|v| v.is_finite()),
                "top_p={top_p} masked every entry"
            );
        }
    }

    #[test]
    fn filter_disabled_at_zero_top_p() {
        let mut logits = vec![3.0, 2.0, 1.0];
        let original = logits.clone();
        top_p_filter(&mut logits, 0.0);
        assert_eq!(logits, original);
    }

    #[test]
    fn filter_keeps_exactly_the_nucleus() {
        // Probabilities ≈ [0.665, 0.245, 0.090]; top_p = 0.7 needs two entries.
        let mut logits = vec![2.0, 1.0, 0.0];
        top_p_filter(&mut logits, 0.7);
        assert!(logits[0].is_finite());
        assert!(logits[1].is_finite());
        assert_eq!(logits[2], f32::NEG_INFINITY);
    }

    #[test]
    fn sampling_stays_inside_the_nucleus() {
        let sampler = NucleusSampler::new(1.0, 0.5);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            // Entry 0 dominates; the nucleus at 0.5 is {0}.
            let token = sampler.sample(vec![10.0, 0.0, 0.0, 0.0], &mut rng);
            assert_eq!(token, 0);
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let sampler = NucleusSampler::new(1.0, 1.0);
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let seq_a: Vec<u32> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..20).map(|_| sampler.sample(logits.clone(), &mut rng)).collect()
        };
        let seq_b: Vec<u32> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..20).map(|_| sampler.sample(logits.clone(), &mut rng)).collect()
        };
        assert_eq!(seq_a, seq_b);
    }
}
