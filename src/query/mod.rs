//! Queries: parsed programs, their templates and the resumable interpreter running them.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constraint::{EvalError, Expr, ExprParseError};

pub mod decorators;
pub mod interpreter;
pub mod parser;
pub mod program_state;
pub mod template;

pub use decorators::{Decorator, DecoratorContext, DecoratorRegistry, PreOutcome};
pub use interpreter::{HoleCompletion, HoleRequest, Interpreter, Segment, Yield};
pub use parser::parse_program;
pub use program_state::{HoleScope, ProgramState, VarState};
pub use template::{Annotation, Chunk, DecoratorCall, Hole, Template};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for query parsing.
pub enum ParseQueryError {
    /// A line does not follow the query syntax.
    #[error("Syntax error at line {line}: {message}")]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// What was expected.
        message: String,
    },
    /// A prompt string is not a valid template.
    #[error("Invalid template {template:?} at byte {offset}: {message}")]
    Template {
        /// The template source.
        template: String,
        /// The byte offset of the error.
        offset: usize,
        /// What was expected.
        message: String,
    },
    #[error(transparent)]
    /// An expression could not be parsed.
    Expr(#[from] ExprParseError),
    #[error(transparent)]
    /// The where clause could not be compiled.
    Eval(#[from] EvalError),
    /// The source does not contain any query.
    #[error("The source does not contain a query")]
    Empty,
}

/// The value of a decoder, model or hole keyword argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(i) => Some(*i as f64),
            ArgValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ArgValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered `key=value` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordArgs(pub Vec<(String, ArgValue)>);

impl KeywordArgs {
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(ArgValue::as_u64).map(|x| x as usize)
    }
}

/// The decoding algorithm of a query.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    Argmax,
    Sample,
    Beam,
    BeamVar,
}

/// A decoder clause such as `beam(n=2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decoder {
    pub kind: DecoderKind,
    pub args: KeywordArgs,
}

/// What a `for` loop iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iterable {
    /// `range(n)`.
    Range(Expr),
    /// A list valued expression.
    List(Expr),
}

/// A statement of a query body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Prompt(Arc<Template>),
    Assign {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Arc<[Stmt]>,
        otherwise: Arc<[Stmt]>,
    },
    For {
        var: String,
        iter: Iterable,
        body: Arc<[Stmt]>,
    },
    Return(Expr),
}

/// A parsed query.
#[derive(Debug, Clone)]
pub struct Query {
    pub name: String,
    pub params: Vec<String>,
    pub decoder: Option<Decoder>,
    pub body: Arc<[Stmt]>,
    /// The model specification of the `from` clause.
    pub model: Option<String>,
    /// The where clause conjoined with the constraints implied by hole annotations.
    pub constraint: Option<Expr>,
}

/// Every query of a source file.
#[derive(Debug, Clone)]
pub struct Program {
    pub queries: Vec<Arc<Query>>,
}

impl Program {
    pub fn query(&self, name: &str) -> Option<&Arc<Query>> {
        self.queries.iter().find(|q| q.name == name)
    }

    /// The query run by default, the first one of the file.
    pub fn main(&self) -> Option<&Arc<Query>> {
        self.queries.first()
    }
}
