//! Decoding algorithms: how branches are expanded and pruned.
use std::fmt::Debug;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::sampling::{argmax, sample, top_n};
use crate::config::DecoderConfig;
use crate::query::{Decoder, DecoderKind};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A live branch offering its next-token log-probabilities.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub branch: usize,
    pub logprobs: &'a [f32],
}

/// A child branch: `parent` extended by `token`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expansion {
    pub parent: usize,
    pub token: u32,
    pub logprob: f32,
}

/// What pruning needs to know about a branch.
#[derive(Debug, Clone, Copy)]
pub struct BranchScore<'a> {
    pub score: f32,
    pub ids: &'a [u32],
    /// The branch the current hole was started from.
    pub group: usize,
    /// Whether the branch is generating a hole.
    pub live: bool,
}

/// A decoding algorithm.
pub trait HeadDriver: sealed::Sealed + Send + Debug {
    /// The number of branches a run starts with.
    fn width(&self) -> usize;

    /// Chooses the continuations of every candidate.
    fn expand(&mut self, candidates: &[Candidate]) -> Vec<Expansion>;

    /// The indices of the branches to keep, best first.
    fn prune(&self, branches: &[BranchScore], at_boundary: bool) -> Vec<usize>;

    /// Whether branches wait for each other at hole boundaries.
    fn syncs_at_boundaries(&self) -> bool {
        false
    }
}

fn rank(branches: &[BranchScore], indices: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut ranked: Vec<usize> = indices.collect();
    ranked.sort_by(|&a, &b| {
        branches[b]
            .score
            .total_cmp(&branches[a].score)
            .then_with(|| branches[a].ids.cmp(branches[b].ids))
    });
    ranked
}

/// Greedy decoding.
#[derive(Debug, Clone, Default)]
pub struct Argmax;

impl sealed::Sealed for Argmax {}

impl HeadDriver for Argmax {
    fn width(&self) -> usize {
        1
    }

    fn expand(&mut self, candidates: &[Candidate]) -> Vec<Expansion> {
        candidates
            .iter()
            .filter_map(|c| {
                argmax(c.logprobs).map(|token| Expansion {
                    parent: c.branch,
                    token,
                    logprob: c.logprobs[token as usize],
                })
            })
            .collect()
    }

    fn prune(&self, branches: &[BranchScore], _at_boundary: bool) -> Vec<usize> {
        (0..branches.len()).collect()
    }
}

/// Independent samples with a seeded RNG.
#[derive(Debug, Clone)]
pub struct Sample {
    pub n: usize,
    pub temperature: f32,
    pub top_k: Option<usize>,
    rng: StdRng,
}

impl Sample {
    pub fn new(n: usize, temperature: f32, top_k: Option<usize>, seed: u64) -> Self {
        Self {
            n: n.max(1),
            temperature,
            top_k,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl sealed::Sealed for Sample {}

impl HeadDriver for Sample {
    fn width(&self) -> usize {
        self.n
    }

    fn expand(&mut self, candidates: &[Candidate]) -> Vec<Expansion> {
        let mut expansions = Vec::with_capacity(candidates.len());
        for c in candidates {
            // the mask is already applied, so temperature scaling keeps masked ids at zero weight
            if let Some(token) = sample(c.logprobs, self.temperature, self.top_k, &mut self.rng) {
                expansions.push(Expansion {
                    parent: c.branch,
                    token,
                    logprob: c.logprobs[token as usize],
                });
            }
        }
        expansions
    }

    fn prune(&self, branches: &[BranchScore], _at_boundary: bool) -> Vec<usize> {
        (0..branches.len()).collect()
    }
}

fn expand_top_n(n: usize, candidates: &[Candidate]) -> Vec<Expansion> {
    candidates
        .iter()
        .flat_map(|c| {
            top_n(c.logprobs, n).into_iter().map(|(token, logprob)| Expansion {
                parent: c.branch,
                token,
                logprob,
            })
        })
        .collect()
}

/// Beam search with global pruning after every step.
#[derive(Debug, Clone)]
pub struct Beam {
    pub n: usize,
}

impl sealed::Sealed for Beam {}

impl HeadDriver for Beam {
    fn width(&self) -> usize {
        1
    }

    fn expand(&mut self, candidates: &[Candidate]) -> Vec<Expansion> {
        expand_top_n(self.n, candidates)
    }

    fn prune(&self, branches: &[BranchScore], _at_boundary: bool) -> Vec<usize> {
        let mut ranked = rank(branches, 0..branches.len());
        ranked.truncate(self.n);
        ranked
    }
}

/// Beam search that keeps `n` branches per origin inside a hole and prunes globally only
/// at hole boundaries.
#[derive(Debug, Clone)]
pub struct BeamVar {
    pub n: usize,
}

impl sealed::Sealed for BeamVar {}

impl HeadDriver for BeamVar {
    fn width(&self) -> usize {
        1
    }

    fn expand(&mut self, candidates: &[Candidate]) -> Vec<Expansion> {
        expand_top_n(self.n, candidates)
    }

    fn prune(&self, branches: &[BranchScore], at_boundary: bool) -> Vec<usize> {
        if at_boundary {
            let mut ranked = rank(branches, 0..branches.len());
            ranked.truncate(self.n);
            return ranked;
        }
        let mut groups: Vec<usize> = branches.iter().filter(|b| b.live).map(|b| b.group).collect();
        groups.sort_unstable();
        groups.dedup();
        let mut kept: Vec<usize> = (0..branches.len()).filter(|i| !branches[*i].live).collect();
        for group in groups {
            let members = (0..branches.len()).filter(|i| branches[*i].live && branches[*i].group == group);
            kept.extend(rank(branches, members).into_iter().take(self.n));
        }
        rank(branches, kept.into_iter())
    }

    fn syncs_at_boundaries(&self) -> bool {
        true
    }
}

/// Builds the driver of `decoder`, falling back to `config` for missing arguments.
pub fn driver_for(decoder: Option<&Decoder>, config: &DecoderConfig) -> Box<dyn HeadDriver> {
    let kind = decoder.map_or(config.decoder, |d| d.kind);
    let arg_usize = |key: &str| decoder.and_then(|d| d.args.usize(key));
    let n = arg_usize("n");
    match kind {
        DecoderKind::Argmax => Box::new(Argmax),
        DecoderKind::Sample => {
            let temperature = decoder
                .and_then(|d| d.args.get("temperature"))
                .and_then(|t| t.as_f64())
                .map_or(config.temperature, |t| t as f32);
            let seed = decoder
                .and_then(|d| d.args.get("seed"))
                .and_then(|s| s.as_u64())
                .unwrap_or(config.seed);
            Box::new(Sample::new(n.unwrap_or(1), temperature, arg_usize("top_k"), seed))
        }
        DecoderKind::Beam => Box::new(Beam {
            n: n.unwrap_or(config.n).max(1),
        }),
        DecoderKind::BeamVar => Box::new(BeamVar {
            n: n.unwrap_or(config.n).max(1),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(score: f32, ids: &[u32], group: usize, live: bool) -> BranchScore<'_> {
        BranchScore {
            score,
            ids,
            group,
            live,
        }
    }

    #[test]
    fn beam_ties_break_on_token_ids() {
        let beam = Beam { n: 2 };
        let branches = [
            score(-1.0, &[3], 0, true),
            score(-1.0, &[2], 0, true),
            score(-2.0, &[1], 0, true),
        ];
        assert_eq!(beam.prune(&branches, false), vec![1, 0]);
    }

    #[test]
    fn beam_var_prunes_per_group_inside_holes() {
        let beam = BeamVar { n: 1 };
        let branches = [
            score(-1.0, &[1], 0, true),
            score(-3.0, &[2], 0, true),
            score(-2.0, &[3], 1, true),
        ];
        assert_eq!(beam.prune(&branches, false), vec![0, 2]);
        assert_eq!(beam.prune(&branches, true), vec![0]);
    }

    #[test]
    fn argmax_expands_once_per_candidate() {
        let logprobs = [-2.0, -0.1, f32::NEG_INFINITY];
        let mut driver = Argmax;
        let expansions = driver.expand(&[Candidate {
            branch: 4,
            logprobs: &logprobs,
        }]);
        assert_eq!(
            expansions,
            vec![Expansion {
                parent: 4,
                token: 1,
                logprob: -0.1
            }]
        );
    }
}
