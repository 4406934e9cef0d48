//! Dead-end recovery inside a hole.
use std::collections::BTreeMap;

use crate::tokenset::TokenSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for backtracking.
pub enum BacktrackError {
    /// Every continuation of the hole, down to its first token, is a dead end.
    #[error("The constraint cannot be satisfied")]
    ConstraintUnsatisfiable,
    /// The rewind budget is exhausted.
    #[error("Generation is stuck after {0} rewinds")]
    GenerationStuck(usize),
}

/// Per-position blocklists of one head in one hole.
///
/// Positions are relative to the start of the hole.
#[derive(Debug, Clone, Default)]
pub struct Backtracker {
    blocked: BTreeMap<usize, Vec<u32>>,
    rewinds: usize,
    max_rewinds: usize,
}

impl Backtracker {
    pub fn new(max_rewinds: usize) -> Self {
        Self {
            blocked: BTreeMap::new(),
            rewinds: 0,
            max_rewinds,
        }
    }

    /// Forgets every blocklist, for a new hole.
    pub fn reset(&mut self) {
        self.blocked.clear();
        self.rewinds = 0;
    }

    /// The tokens that must not be chosen at `position`.
    pub fn blocked_at(&self, position: usize) -> TokenSet {
        match self.blocked.get(&position) {
            Some(ids) => TokenSet::from_ids(ids.iter().copied()),
            None => TokenSet::empty(),
        }
    }

    pub fn rewinds(&self) -> usize {
        self.rewinds
    }

    /// Records that the mask after `value_ids` is empty. Blocks the last token at its
    /// position and returns the length the value must be truncated to.
    ///
    /// # Errors
    ///
    /// Returns [`BacktrackError::ConstraintUnsatisfiable`] when the value is empty and
    /// [`BacktrackError::GenerationStuck`] when the rewind budget is exceeded.
    pub fn dead_end(&mut self, value_ids: &[u32]) -> Result<usize, BacktrackError> {
        let Some((&last, _)) = value_ids.split_last() else {
            return Err(BacktrackError::ConstraintUnsatisfiable);
        };
        self.rewinds += 1;
        if self.rewinds > self.max_rewinds {
            return Err(BacktrackError::GenerationStuck(self.max_rewinds));
        }
        let position = value_ids.len() - 1;
        self.blocked.entry(position).or_default().push(last);
        self.blocked.retain(|p, _| *p <= position);
        log::debug!(
            "Backtracking: token {} blocked at position {} (rewind {}).",
            last,
            position,
            self.rewinds
        );
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deeper_blocklists_are_cleared() {
        let mut backtracker = Backtracker::new(8);
        assert_eq!(backtracker.dead_end(&[1, 2, 3]), Ok(2));
        assert_eq!(backtracker.dead_end(&[1, 2]), Ok(1));
        assert!(backtracker.blocked_at(2).is_trivially_empty());
        assert_eq!(backtracker.blocked_at(1), TokenSet::from_ids([2]));
    }

    #[test]
    fn rewinding_past_the_hole_fails() {
        let mut backtracker = Backtracker::new(8);
        assert_eq!(
            backtracker.dead_end(&[]),
            Err(BacktrackError::ConstraintUnsatisfiable)
        );
    }

    #[test]
    fn rewind_budget_is_bounded() {
        let mut backtracker = Backtracker::new(1);
        assert!(backtracker.dead_end(&[1]).is_ok());
        assert_eq!(
            backtracker.dead_end(&[2]),
            Err(BacktrackError::GenerationStuck(1))
        );
    }
}
