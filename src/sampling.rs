//! sampling.rs
//!
//! Next-token selection from raw logits.
//!
//! Filters are applied in this order: temperature scaling, top-k, nucleus (top-p).
//! At least one token always survives filtering.

use anyhow::Result;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::LyrgenError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingParams {
    /// Cumulative probability mass kept by nucleus filtering; 1.0 disables it
    pub top_p: f64,
    /// Most likely tokens kept before nucleus filtering; 0 disables it
    pub top_k: usize,
    /// Values below 1.0 sharpen the distribution; 0.0 means greedy
    pub temperature: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { top_p: 0.9, top_k: 50, temperature: 1.0 }
    }
}

/// Candidate tokens and their renormalised probabilities, most likely first.
pub fn candidates(logits: &[f32], params: &SamplingParams) -> Vec<(u32, f64)> {
    let mut ranked: Vec<(u32, f64)> = logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(i, &l)| (i as u32, l as f64))
        .collect();
    if ranked.is_empty() {
        return ranked;
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if params.temperature <= 0.0 {
        return vec![(ranked[0].0, 1.0)];
    }
    if params.top_k > 0 {
        ranked.truncate(params.top_k);
    }

    let max = ranked[0].1 / params.temperature;
    let mut probs: Vec<(u32, f64)> = ranked
        .into_iter()
        .map(|(id, l)| (id, (l / params.temperature - max).exp()))
        .collect();
    normalize(&mut probs);

    if params.top_p < 1.0 {
        let mut cum = 0.0;
        let mut keep = 0;
        for &(_, p) in &probs {
            keep += 1;
            cum += p;
            if cum >= params.top_p {
                break;
            }
        }
        probs.truncate(keep.max(1));
        normalize(&mut probs);
    }
    probs
}

fn normalize(probs: &mut [(u32, f64)]) {
    let total: f64 = probs.iter().map(|(_, p)| p).sum();
    if total > 0.0 {
        for (_, p) in probs.iter_mut() {
            *p /= total;
        }
    }
}

/// Draws token ids with a seedable RNG.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { params, rng }
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        let cands = candidates(logits, &self.params);
        match cands.as_slice() {
            [] => Err(LyrgenError::Sampling("no finite logits".into()).into()),
            [(only, _)] => Ok(*only),
            _ => {
                let dist = WeightedIndex::new(cands.iter().map(|(_, p)| *p))
                    .map_err(|e| LyrgenError::Sampling(e.to_string()))?;
                Ok(cands[dist.sample(&mut self.rng)].0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits_from(probs: &[f64]) -> Vec<f32> {
        probs.iter().map(|p| p.ln() as f32).collect()
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let params = SamplingParams { temperature: 0.0, ..SamplingParams::default() };
        let mut s = Sampler::new(params, None);
        for _ in 0..20 {
            assert_eq!(s.sample(&[0.1, 3.0, 2.9, -1.0]).unwrap(), 1);
        }
    }

    #[test]
    fn nucleus_keeps_the_smallest_covering_set() {
        let params = SamplingParams { top_p: 0.9, top_k: 0, temperature: 1.0 };
        let c = candidates(&logits_from(&[0.05, 0.5, 0.15, 0.3]), &params);
        let ids: Vec<u32> = c.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
        let total: f64 = c.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((c[0].1 - 0.5 / 0.95).abs() < 1e-6);
    }

    #[test]
    fn tiny_top_p_still_keeps_one_token() {
        let params = SamplingParams { top_p: 0.0, top_k: 0, temperature: 1.0 };
        let c = candidates(&logits_from(&[0.2, 0.7, 0.1]), &params);
        assert_eq!(c, vec![(1, 1.0)]);
    }

    #[test]
    fn top_k_truncates_before_nucleus() {
        let params = SamplingParams { top_p: 1.0, top_k: 2, temperature: 1.0 };
        let c = candidates(&logits_from(&[0.1, 0.2, 0.3, 0.4]), &params);
        let ids: Vec<u32> = c.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn low_temperature_sharpens() {
        let flat = SamplingParams { top_p: 1.0, top_k: 0, temperature: 1.0 };
        let sharp = SamplingParams { temperature: 0.5, ..flat };
        let logits = logits_from(&[0.6, 0.4]);
        assert!(candidates(&logits, &sharp)[0].1 > candidates(&logits, &flat)[0].1);
    }

    #[test]
    fn non_finite_logits_are_skipped_or_rejected() {
        let mut s = Sampler::new(SamplingParams::default(), Some(1));
        assert_eq!(s.sample(&[f32::NEG_INFINITY, 0.0, f32::NAN]).unwrap(), 1);
        assert!(s.sample(&[f32::NAN, f32::NEG_INFINITY]).is_err());
    }

    #[test]
    fn seeded_samplers_agree() {
        let logits = logits_from(&[0.25, 0.25, 0.25, 0.25]);
        let params = SamplingParams { top_p: 1.0, top_k: 0, temperature: 1.0 };
        let mut a = Sampler::new(params, Some(42));
        let mut b = Sampler::new(params, Some(42));
        let xs: Vec<u32> = (0..32).map(|_| a.sample(&logits).unwrap()).collect();
        let ys: Vec<u32> = (0..32).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().any(|&x| x != xs[0]));
    }
}
