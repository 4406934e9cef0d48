//! Constraint evaluation with monotonic three-valued semantics.
//!
//! A where-clause is compiled into an [`OpGraph`]. The [digest](digest::digest) of a graph
//! evaluates it over the current program state and, for the variable being generated,
//! derives a [`FollowMap`] describing the constraint value after every possible next
//! token. The [mask](mask::build_mask) then suppresses every token that would make the
//! constraint final-false.
use crate::regex::RegexParseError;
use crate::tokenset::TokenSetCache;

pub mod digest;
pub mod expr_parser;
pub mod follow_map;
pub mod graph;
pub mod mask;
pub mod ops;
pub mod value;

pub use digest::{digest, evaluate, Digest};
pub use expr_parser::{parse_expr, Expr, ExprParseError};
pub use follow_map::FollowMap;
pub use graph::{NodeId, OpGraph, StopCondition};
pub use mask::{build_mask, disallowed_tokens, LogitBias};
pub use ops::Op;
pub use value::{FollowValue, Mono, Tagged, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for constraint compilation and evaluation.
pub enum EvalError {
    /// An operator was applied to values of the wrong type.
    #[error("TypeError: {op} is not defined for {detail}")]
    TypeError {
        /// The operator.
        op: String,
        /// The offending operand types.
        detail: String,
    },
    /// Integer arithmetic left the range of `i64`.
    #[error("OverflowError: {op} overflowed")]
    Overflow {
        /// The operator.
        op: String,
    },
    /// A variable is read that is neither a hole, a parameter nor assigned.
    #[error("NameError: name {0:?} is not defined")]
    NameError(String),
    /// A call of a function that is not built in.
    #[error("Unknown function {0:?}")]
    UnknownFunction(String),
    /// A built-in called with the wrong number of arguments.
    #[error("{op} expects {expected} arguments, got {got}")]
    Arity {
        /// The built-in.
        op: String,
        /// The accepted argument count.
        expected: String,
        /// The actual argument count.
        got: usize,
    },
    #[error(transparent)]
    /// A `REGEX` pattern is invalid.
    Regex(#[from] RegexParseError),
    #[error(transparent)]
    /// An expression could not be parsed.
    Parse(#[from] ExprParseError),
}

impl EvalError {
    pub(crate) fn type_error(op: &Op, args: &[&Value]) -> Self {
        EvalError::TypeError {
            op: op.name().to_string(),
            detail: args
                .iter()
                .map(|x| x.type_name())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// The view of one variable the constraint engine needs.
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    pub value: &'a Value,
    /// Token texts of a generated variable, empty otherwise.
    pub tokens: &'a [String],
    /// Whether the variable is being generated right now.
    pub growing: bool,
}

/// Resolves variable names during evaluation.
pub trait Scope {
    fn binding(&self, name: &str) -> Option<Binding<'_>>;
}

impl Scope for ahash::AHashMap<String, Value> {
    fn binding(&self, name: &str) -> Option<Binding<'_>> {
        self.get(name).map(|value| Binding {
            value,
            tokens: &[],
            growing: false,
        })
    }
}

/// Everything an op needs besides its operands.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    pub scope: &'a dyn Scope,
    /// The variable being generated, if any.
    pub active: Option<&'a str>,
    pub cache: &'a TokenSetCache,
    pub eos_token_id: u32,
}
