//! Variable bindings of a running query.
use std::sync::Arc;

use ahash::AHashMap;
use serde::Serialize;

use crate::constraint::{Binding, Scope, Value};

/// The state of one variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VarState {
    pub value: Value,
    /// Texts of the generated tokens, empty for assigned variables.
    pub tokens: Vec<String>,
    pub token_ids: Vec<u32>,
    /// Log-probability of every generated token.
    pub logprobs: Vec<f32>,
}

impl VarState {
    pub fn assigned(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }
}

/// Copy-on-write variable bindings and the prompt of one query frame.
///
/// Cloning is cheap, so that beam branches can share the state until one of them writes.
#[derive(Debug, Clone, Default)]
pub struct ProgramState {
    vars: Arc<AHashMap<String, VarState>>,
    /// Variable names in order of first assignment.
    order: Arc<Vec<String>>,
    prompt: Arc<String>,
}

impl ProgramState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VarState> {
        self.vars.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).map(|v| &v.value)
    }

    pub fn set(&mut self, name: &str, state: VarState) {
        if !self.vars.contains_key(name) {
            Arc::make_mut(&mut self.order).push(name.to_string());
        }
        Arc::make_mut(&mut self.vars).insert(name.to_string(), state);
    }

    pub fn set_value(&mut self, name: &str, value: Value) {
        self.set(name, VarState::assigned(value));
    }

    /// Variables in order of first assignment.
    pub fn variables(&self) -> impl Iterator<Item = (&str, &VarState)> {
        self.order
            .iter()
            .filter_map(|name| self.vars.get(name).map(|v| (name.as_str(), v)))
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn push_prompt(&mut self, text: &str) {
        Arc::make_mut(&mut self.prompt).push_str(text);
    }

    /// Whether two states share their bindings without a copy.
    pub fn shares_bindings_with(&self, other: &ProgramState) -> bool {
        Arc::ptr_eq(&self.vars, &other.vars)
    }
}

impl Scope for ProgramState {
    fn binding(&self, name: &str) -> Option<Binding<'_>> {
        self.vars.get(name).map(|v| Binding {
            value: &v.value,
            tokens: &v.tokens,
            growing: false,
        })
    }
}

/// A program state seen from inside a hole: the hole variable is growing and shadows
/// any earlier value.
#[derive(Debug)]
pub struct HoleScope<'a> {
    pub base: &'a ProgramState,
    pub variable: &'a str,
    pub value: Value,
    pub tokens: &'a [String],
}

impl<'a> HoleScope<'a> {
    pub fn new(base: &'a ProgramState, variable: &'a str, text: &str, tokens: &'a [String]) -> Self {
        Self {
            base,
            variable,
            value: Value::Str(text.to_string()),
            tokens,
        }
    }
}

impl Scope for HoleScope<'_> {
    fn binding(&self, name: &str) -> Option<Binding<'_>> {
        if name == self.variable {
            return Some(Binding {
                value: &self.value,
                tokens: self.tokens,
                growing: true,
            });
        }
        self.base.binding(name)
    }
}
