//! Logit masks derived from follow maps.
use fixedbitset_stack::FixedBitSet;

use super::follow_map::FollowMap;
use super::value::{FollowValue, Tagged, Value};
use crate::tokenset::{Materialiser, TokenSet};

/// An additive `{0, -inf}` logit bias, stored as the set of allowed ids.
#[derive(Debug, Clone)]
pub enum LogitBias {
    /// A bitset of allowed ids over the whole vocabulary.
    Dense(FixedBitSet),
    /// A sorted list of allowed ids, used when few tokens are allowed.
    Sparse(Vec<u32>),
}

impl LogitBias {
    /// Builds the more compact representation of `allowed`.
    pub fn from_allowed(allowed: FixedBitSet) -> Self {
        let count = allowed.count_ones(..);
        if count * 32 < allowed.len() {
            LogitBias::Sparse(allowed.ones().map(|x| x as u32).collect())
        } else {
            LogitBias::Dense(allowed)
        }
    }

    /// Allows exactly one token.
    pub fn only(id: u32) -> Self {
        LogitBias::Sparse(vec![id])
    }

    pub fn contains(&self, id: u32) -> bool {
        match self {
            LogitBias::Dense(bits) => bits.contains(id as usize),
            LogitBias::Sparse(ids) => ids.binary_search(&id).is_ok(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            LogitBias::Dense(bits) => bits.count_ones(..),
            LogitBias::Sparse(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn allowed_ids(&self) -> Vec<u32> {
        match self {
            LogitBias::Dense(bits) => bits.ones().map(|x| x as u32).collect(),
            LogitBias::Sparse(ids) => ids.clone(),
        }
    }

    /// Sets every disallowed logit to negative infinity.
    pub fn apply(&self, logits: &mut [f32]) {
        match self {
            LogitBias::Dense(bits) => {
                for (id, logit) in logits.iter_mut().enumerate() {
                    if !bits.contains(id) {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }
            LogitBias::Sparse(ids) => {
                let mut allowed = ids.iter().peekable();
                for (id, logit) in logits.iter_mut().enumerate() {
                    if allowed.peek().map(|x| **x as usize) == Some(id) {
                        allowed.next();
                    } else {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }
        }
    }
}

fn is_final_false(value: &Tagged<FollowValue>) -> bool {
    match &value.value {
        FollowValue::Known(v @ Value::Bool(false)) => {
            Tagged::new(v.clone(), value.mono).is_final_false()
        }
        _ => false,
    }
}

/// The tokens after which the constraint is final-false.
pub fn disallowed_tokens(follow: &FollowMap) -> TokenSet {
    TokenSet::union_all(
        follow
            .entries()
            .iter()
            .filter(|(_, value)| is_final_false(value))
            .map(|(pattern, _)| pattern.clone())
            .collect(),
    )
}

/// Builds the mask of a hole position.
///
/// Tokens are allowed unless they make the root constraint final-false, are one of the
/// `reserved` tag ids or belong to the `blocked` set of the backtracker.
pub fn build_mask(
    follow: &FollowMap,
    materialiser: &Materialiser,
    reserved: &[u32],
    blocked: &TokenSet,
) -> LogitBias {
    let allowed = TokenSet::Any
        .setminus(&disallowed_tokens(follow))
        .setminus(&TokenSet::from_ids(reserved.iter().copied()))
        .setminus(blocked);
    let bits = allowed.materialise(materialiser);
    let bias = LogitBias::from_allowed(bits);
    log::debug!(
        "Mask allows {} of {} tokens.",
        bias.count(),
        materialiser.size()
    );
    bias
}
