//! Values flowing through the constraint op graph and their monotonicity tags.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::tokenset::{Measure, SentenceCounter};

/// A runtime value of the query language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Python-like truthiness, used by `if` statements.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::List(_) => "list",
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        Value::Str(s) => write!(f, "{:?}", s)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

/// How a value may still change as its variables grow.
///
/// The tags form the lattice `fin < {inc, dec} < var`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Mono {
    /// Final, the value will not change.
    Fin,
    /// The value can only grow.
    Inc,
    /// The value can only shrink.
    Dec,
    /// The value can change arbitrarily.
    Var,
}

impl Mono {
    /// Least upper bound in the lattice.
    pub fn join(self, other: Mono) -> Mono {
        match (self, other) {
            (Mono::Fin, x) | (x, Mono::Fin) => x,
            (x, y) if x == y => x,
            _ => Mono::Var,
        }
    }

    /// Whether `self <= other` in the lattice.
    pub fn below(self, other: Mono) -> bool {
        self.join(other) == other
    }

    pub fn inverted(self) -> Mono {
        match self {
            Mono::Inc => Mono::Dec,
            Mono::Dec => Mono::Inc,
            x => x,
        }
    }
}

/// A value together with its monotonicity tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tagged<T> {
    pub value: T,
    pub mono: Mono,
}

impl<T> Tagged<T> {
    pub fn new(value: T, mono: Mono) -> Self {
        Self { value, mono }
    }

    pub fn fin(value: T) -> Self {
        Self::new(value, Mono::Fin)
    }

    pub fn var(value: T) -> Self {
        Self::new(value, Mono::Var)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tagged<U> {
        Tagged {
            value: f(self.value),
            mono: self.mono,
        }
    }
}

impl Tagged<Value> {
    /// The boolean will stay false however the variables grow.
    pub fn is_final_false(&self) -> bool {
        self.value == Value::Bool(false) && matches!(self.mono, Mono::Fin | Mono::Dec)
    }

    /// The boolean will stay true however the variables grow.
    pub fn is_final_true(&self) -> bool {
        self.value == Value::Bool(true) && matches!(self.mono, Mono::Fin | Mono::Inc)
    }
}

impl<T: Display> Display for Tagged<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.mono, self.value)
    }
}

/// The value of an op under the assumption that one more token is appended to the
/// active variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FollowValue {
    /// The value does not depend on the next token.
    Known(Value),
    /// `prefix` followed by the next token; `tokens` tokens were generated so far.
    Text { prefix: String, tokens: usize },
    /// `base + measure(next token)`.
    Measured { base: i64, measure: Measure },
    /// A list of `count` token texts, the last being the next token.
    TokenList { count: usize },
    /// The sentences of the text in the given counter state followed by the next token.
    Sentences(SentenceCounter),
    /// The value cannot be expressed symbolically.
    Opaque,
}

impl FollowValue {
    pub fn known(&self) -> Option<&Value> {
        match self {
            FollowValue::Known(v) => Some(v),
            _ => None,
        }
    }
}

impl Display for FollowValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FollowValue::Known(Value::Str(s)) => write!(f, "{:?}", s),
            FollowValue::Known(v) => write!(f, "{}", v),
            FollowValue::Text { prefix, .. } => write!(f, "{:?} + NEXT", prefix),
            FollowValue::Measured {
                base,
                measure: Measure::Bytes,
            } => write!(f, "{} + len(NEXT)", base),
            FollowValue::Measured {
                base,
                measure: Measure::Sentences(c),
            } => write!(f, "{} + sentences({} + NEXT)", base, c.count()),
            FollowValue::TokenList { count } => write!(f, "tokens[{}]", count),
            FollowValue::Sentences(c) => write!(f, "sentences[{} + NEXT]", c.count()),
            FollowValue::Opaque => f.write_str("?"),
        }
    }
}

impl From<Tagged<Value>> for Tagged<FollowValue> {
    fn from(value: Tagged<Value>) -> Self {
        value.map(FollowValue::Known)
    }
}
