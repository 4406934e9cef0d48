//! Token selection from masked logits.
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Log-softmax of `logits`. Masked (`-inf`) entries stay `-inf`.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let sum: f32 = logits.iter().map(|x| (x - max).exp()).sum();
    let log_sum = sum.ln() + max;
    logits.iter().map(|x| x - log_sum).collect()
}

/// The id with the highest score. Ties go to the lowest id; `None` if every entry is masked.
pub fn argmax(scores: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (id, &score) in scores.iter().enumerate() {
        if score == f32::NEG_INFINITY || score.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if b >= score => {}
            _ => best = Some((id, score)),
        }
    }
    best.map(|(id, _)| id as u32)
}

/// The `n` best ids with their scores, best first. Ties are ordered by id.
pub fn top_n(scores: &[f32], n: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| **s != f32::NEG_INFINITY && !s.is_nan())
        .map(|(id, s)| (id as u32, *s))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}

/// Samples an id from `logits` scaled by `temperature`, optionally restricted to the
/// `top_k` best ids. A temperature of zero samples greedily.
pub fn sample(
    logits: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    rng: &mut impl Rng,
) -> Option<u32> {
    if temperature <= 0.0 {
        return argmax(logits);
    }
    let mut candidates = top_n(logits, top_k.unwrap_or(logits.len()));
    if candidates.is_empty() {
        return None;
    }
    let max = candidates[0].1;
    for (_, score) in &mut candidates {
        *score = ((*score - max) / temperature).exp();
    }
    match WeightedIndex::new(candidates.iter().map(|(_, w)| *w)) {
        Ok(dist) => Some(candidates[dist.sample(rng)].0),
        Err(_) => Some(candidates[0].0),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn argmax_prefers_lowest_id_on_ties() {
        assert_eq!(argmax(&[0.5, 1.0, 1.0]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY; 3]), None);
    }

    #[test]
    fn log_softmax_keeps_masked_entries() {
        let lp = log_softmax(&[0.0, f32::NEG_INFINITY, 0.0]);
        assert_eq!(lp[1], f32::NEG_INFINITY);
        assert!((lp[0] - 0.5f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn sampling_never_picks_masked_ids() {
        let mut rng = StdRng::seed_from_u64(123);
        let logits = [f32::NEG_INFINITY, 0.3, f32::NEG_INFINITY, 0.1];
        for _ in 0..64 {
            let id = sample(&logits, 1.0, None, &mut rng);
            assert!(matches!(id, Some(1) | Some(3)));
        }
    }
}
