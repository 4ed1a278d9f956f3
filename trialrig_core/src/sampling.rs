//! Random draws used to parameterize trials.
//!
//! Every sampler takes the RNG by `&mut`, so a seeded `StdRng` reproduces a
//! whole session.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand_distr::Exp;

use crate::config::ProbabilityType;
use crate::error::{Result, RigError};

/// Upper bound on rejection-sampling attempts for [`TruncExp::sample`].
pub const MAX_REJECTION_DRAWS: u32 = 10_000;

/// Exponential distribution with mean `scale`, truncated to `[min, max]` by
/// rejection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncExp {
    pub scale: f64,
    pub min: f64,
    pub max: f64,
}

impl TruncExp {
    pub fn new(scale: f64, min: f64, max: f64) -> Result<Self> {
        let t = Self { scale, min, max };
        t.validate()?;
        Ok(t)
    }

    fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(RigError::Config(format!(
                "truncated exponential scale must be > 0, got {}",
                self.scale
            ))
            .into());
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.min <= self.max) {
            return Err(RigError::Config(format!(
                "truncated exponential bounds must satisfy min <= max, got [{}, {}]",
                self.min, self.max
            ))
            .into());
        }
        Ok(())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        self.validate()?;
        let exp = Exp::new(1.0 / self.scale)
            .map_err(|e| RigError::Config(format!("exponential distribution: {e}")))?;
        for _ in 0..MAX_REJECTION_DRAWS {
            let x = exp.sample(rng);
            if (self.min..=self.max).contains(&x) {
                return Ok(x);
            }
        }
        Err(RigError::Config(format!(
            "no draw of Exp(mean={}) fell within [{}, {}] after {} attempts",
            self.scale, self.min, self.max, MAX_REJECTION_DRAWS
        ))
        .into())
    }
}

/// Resolve a possibly negative index against a collection of length `n`.
pub fn resolve_index(n: usize, idx: isize) -> Result<usize> {
    let resolved = if idx < 0 {
        n.checked_sub(idx.unsigned_abs())
    } else {
        Some(idx.unsigned_abs()).filter(|&i| i < n)
    };
    resolved.ok_or_else(|| {
        RigError::Config(format!("index {idx} out of range for {n} contrasts")).into()
    })
}

/// Probabilities where every item weighs 1 except `idx`, which weighs `p_idx`,
/// normalized to sum to 1.
pub fn biased_probs(n: usize, idx: isize, p_idx: f64) -> Result<Vec<f64>> {
    if n == 0 {
        return Err(RigError::Config("cannot bias an empty contrast set".into()).into());
    }
    if !(p_idx.is_finite() && p_idx > 0.0) {
        return Err(RigError::Config(format!(
            "biased probability weight must be > 0, got {p_idx}"
        ))
        .into());
    }
    let i = resolve_index(n, idx)?;
    if n == 1 {
        return Ok(vec![1.0]);
    }
    let z = (n - 1) as f64 + p_idx;
    let mut p = vec![1.0 / z; n];
    p[i] *= p_idx;
    Ok(p)
}

pub fn weighted_choice<R: Rng + ?Sized, T: Copy>(
    rng: &mut R,
    items: &[T],
    weights: &[f64],
) -> Result<T> {
    if items.len() != weights.len() {
        return Err(RigError::Config(format!(
            "{} items but {} weights",
            items.len(),
            weights.len()
        ))
        .into());
    }
    let dist = WeightedIndex::new(weights)
        .map_err(|e| RigError::Config(format!("invalid weights {weights:?}: {e}")))?;
    Ok(items[dist.sample(rng)])
}

pub fn uniform_choice<R: Rng + ?Sized, T: Copy>(rng: &mut R, items: &[T]) -> Result<T> {
    items
        .choose(rng)
        .copied()
        .ok_or_else(|| RigError::Config("cannot draw from an empty set".into()).into())
}

pub fn draw_contrast<R: Rng + ?Sized>(
    rng: &mut R,
    contrasts: &[f64],
    probability_type: ProbabilityType,
    idx: isize,
    p_idx: f64,
) -> Result<f64> {
    match probability_type {
        ProbabilityType::Uniform => uniform_choice(rng, contrasts),
        ProbabilityType::Biased => {
            let p = biased_probs(contrasts.len(), idx, p_idx)?;
            weighted_choice(rng, contrasts, &p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    #[rstest]
    #[case(5, -1, 0.5, vec![1.0 / 4.5, 1.0 / 4.5, 1.0 / 4.5, 1.0 / 4.5, 0.5 / 4.5])]
    #[case(3, 0, 2.0, vec![2.0 / 4.0, 1.0 / 4.0, 1.0 / 4.0])]
    #[case(1, 0, 0.5, vec![1.0])]
    fn biased_probs_table(
        #[case] n: usize,
        #[case] idx: isize,
        #[case] p: f64,
        #[case] expected: Vec<f64>,
    ) {
        let got = biased_probs(n, idx, p).unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-12, "{got:?} vs {expected:?}");
        }
        assert!((got.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[rstest]
    #[case(5, 5, 0.5)]
    #[case(5, -6, 0.5)]
    #[case(5, 0, 0.0)]
    #[case(0, 0, 0.5)]
    fn biased_probs_rejects_bad_input(#[case] n: usize, #[case] idx: isize, #[case] p: f64) {
        let err = biased_probs(n, idx, p).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::Config(_))
        ));
    }

    #[test]
    fn trunc_exp_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = TruncExp::new(0.35, 0.2, 0.5).unwrap();
        for _ in 0..5_000 {
            let x = t.sample(&mut rng).unwrap();
            assert!((0.2..=0.5).contains(&x));
        }
    }

    #[test]
    fn trunc_exp_gives_up_on_unreachable_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let t = TruncExp::new(0.001, 50.0, 60.0).unwrap();
        let err = t.sample(&mut rng).unwrap_err();
        assert!(err.to_string().contains("after 10000 attempts"));
    }

    #[test]
    fn trunc_exp_rejects_inverted_bounds() {
        assert!(TruncExp::new(1.0, 2.0, 1.0).is_err());
        assert!(TruncExp::new(0.0, 0.0, 1.0).is_err());
    }

    // Pearson chi-square against expected counts.
    fn chi_square(counts: &[usize], probs: &[f64], n: usize) -> f64 {
        counts
            .iter()
            .zip(probs)
            .map(|(&c, &p)| {
                let e = p * n as f64;
                (c as f64 - e).powi(2) / e
            })
            .sum()
    }

    #[test]
    fn biased_draw_matches_designed_weights() {
        let set = [1.0, 0.25, 0.125, 0.0625, 0.0];
        let probs = biased_probs(set.len(), -1, 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let n = 50_000;
        let mut counts = [0usize; 5];
        for _ in 0..n {
            let c = draw_contrast(&mut rng, &set, ProbabilityType::Biased, -1, 0.5).unwrap();
            let i = set.iter().position(|&x| x == c).unwrap();
            counts[i] += 1;
        }
        // df = 4, p = 0.001
        assert!(chi_square(&counts, &probs, n) < 18.47, "{counts:?}");
    }

    #[test]
    fn uniform_draw_is_flat() {
        let set = [1.0, 0.25, 0.125, 0.0625, 0.0];
        let mut rng = StdRng::seed_from_u64(3);
        let n = 50_000;
        let mut counts = [0usize; 5];
        for _ in 0..n {
            let c = draw_contrast(&mut rng, &set, ProbabilityType::Uniform, -1, 0.5).unwrap();
            let i = set.iter().position(|&x| x == c).unwrap();
            counts[i] += 1;
        }
        assert!(chi_square(&counts, &[0.2; 5], n) < 18.47, "{counts:?}");
    }

    #[test]
    fn weighted_choice_rejects_mismatched_lengths() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(weighted_choice(&mut rng, &[1, 2], &[1.0]).is_err());
        assert!(uniform_choice::<_, i32>(&mut rng, &[]).is_err());
    }
}
