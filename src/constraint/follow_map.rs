//! Piecewise functions from the next token to a follow value.
use std::fmt::Display;

use super::value::{FollowValue, Tagged};
use super::EvalError;
use crate::tokenset::{Materialiser, TokenSet};

/// A piecewise map from the next token to the value an op takes after that token.
///
/// Patterns are pairwise disjoint and cover the vocabulary: [`FollowMap::new`] assigns
/// every token to the first pattern that contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowMap {
    entries: Vec<(TokenSet, Tagged<FollowValue>)>,
}

impl FollowMap {
    /// Every token leads to `value`.
    pub fn constant(value: Tagged<FollowValue>) -> Self {
        Self {
            entries: vec![(TokenSet::Any, value)],
        }
    }

    /// The value after the next token is unknown.
    pub fn opaque() -> Self {
        Self::constant(Tagged::var(FollowValue::Opaque))
    }

    /// Builds a map from first-match entries. Tokens no entry matches lead to an opaque value.
    pub fn new(entries: Vec<(TokenSet, Tagged<FollowValue>)>) -> Self {
        let mut handled = TokenSet::Empty;
        let mut disjoint = Vec::with_capacity(entries.len() + 1);
        for (pattern, value) in entries {
            let cell = pattern.setminus(&handled);
            handled = handled.union(&pattern);
            if !cell.is_trivially_empty() {
                disjoint.push((cell, value));
            }
        }
        let rest = handled.complement();
        if !rest.is_trivially_empty() {
            disjoint.push((rest, Tagged::var(FollowValue::Opaque)));
        }
        Self { entries: disjoint }
    }

    pub fn entries(&self) -> &[(TokenSet, Tagged<FollowValue>)] {
        &self.entries
    }

    /// Whether the map does not depend on the next token.
    pub fn as_constant(&self) -> Option<&Tagged<FollowValue>> {
        match self.entries.as_slice() {
            [(_, value)] => Some(value),
            _ => None,
        }
    }

    /// Merges patterns leading to equal values.
    pub fn simplify(self) -> Self {
        let mut merged: Vec<(TokenSet, Tagged<FollowValue>)> = Vec::with_capacity(self.entries.len());
        for (pattern, value) in self.entries {
            match merged.iter_mut().find(|(_, v)| *v == value) {
                Some((p, _)) => *p = p.union(&pattern),
                None => merged.push((pattern, value)),
            }
        }
        if let [(_, value)] = merged.as_slice() {
            return Self::constant(value.clone());
        }
        Self { entries: merged }
    }

    /// Combines the maps of an op's operands.
    ///
    /// `f` is called once per cell of the product of the operands' partitions with the
    /// operand values of that cell. Its result is restricted to the cell.
    pub fn product(
        maps: &[&FollowMap],
        mut f: impl FnMut(&[&Tagged<FollowValue>]) -> Result<FollowMap, EvalError>,
    ) -> Result<FollowMap, EvalError> {
        let mut cells: Vec<(TokenSet, Vec<&Tagged<FollowValue>>)> = vec![(TokenSet::Any, vec![])];
        for map in maps {
            let mut next = Vec::with_capacity(cells.len() * map.entries.len());
            for (cell, values) in &cells {
                for (pattern, value) in &map.entries {
                    let joint = cell.intersect(pattern);
                    if joint.is_trivially_empty() {
                        continue;
                    }
                    let mut values = values.clone();
                    values.push(value);
                    next.push((joint, values));
                }
            }
            cells = next;
        }
        let mut entries = Vec::new();
        for (cell, values) in cells {
            let result = f(&values)?;
            for (pattern, value) in result.entries {
                let joint = cell.intersect(&pattern);
                if !joint.is_trivially_empty() {
                    entries.push((joint, value));
                }
            }
        }
        Ok(Self { entries }.simplify())
    }

    /// The value after appending token `id`.
    pub fn apply(&self, id: u32, materialiser: &Materialiser) -> Option<&Tagged<FollowValue>> {
        self.entries
            .iter()
            .find(|(pattern, _)| {
                pattern
                    .materialise(materialiser)
                    .contains(id as usize)
            })
            .map(|(_, value)| value)
    }
}

impl Display for FollowMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (pattern, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{} -> {}", pattern, value)?;
        }
        Ok(())
    }
}
