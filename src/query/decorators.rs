//! Hole decorators and their registry.
use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;
use displaydoc::Display;

use crate::constraint::Value;

/// What a `pre` decorator decides about a hole.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum PreOutcome {
    /// generate the hole
    Continue,
    /// fill the hole with {0:?} without generating
    Fixed(String),
}

/// The call site of a decorator.
#[derive(Debug, Clone, Copy)]
pub struct DecoratorContext<'a> {
    pub variable: &'a str,
    pub args: &'a [Value],
}

/// A hook around the generation of a hole.
///
/// `pre` hooks run in declaration order, `stream` and `post` hooks in reverse order.
pub trait Decorator: Send + Sync + Debug {
    fn pre(&self, _ctx: &DecoratorContext) -> PreOutcome {
        PreOutcome::Continue
    }

    /// Called with every new prefix of the value.
    fn stream(&self, _value: &str, _ctx: &DecoratorContext) {}

    /// Returns the final value and the text kept in the prompt.
    fn post(&self, value: String, prompt_text: String, _ctx: &DecoratorContext) -> (String, String) {
        (value, prompt_text)
    }
}

#[derive(Debug)]
struct Strip;

impl Decorator for Strip {
    fn post(&self, value: String, prompt_text: String, _ctx: &DecoratorContext) -> (String, String) {
        (value.trim().to_string(), prompt_text)
    }
}

#[derive(Debug)]
struct Upper;

impl Decorator for Upper {
    fn post(&self, value: String, prompt_text: String, _ctx: &DecoratorContext) -> (String, String) {
        (value.to_uppercase(), prompt_text.to_uppercase())
    }
}

#[derive(Debug)]
struct Fixed;

impl Decorator for Fixed {
    fn pre(&self, ctx: &DecoratorContext) -> PreOutcome {
        match ctx.args.first() {
            Some(Value::Str(s)) => PreOutcome::Fixed(s.clone()),
            Some(other) => PreOutcome::Fixed(other.to_string()),
            None => PreOutcome::Continue,
        }
    }
}

#[derive(Debug)]
struct Echo;

impl Decorator for Echo {
    fn stream(&self, value: &str, ctx: &DecoratorContext) {
        log::info!("{}: {:?}", ctx.variable, value);
    }
}

/// Decorators by name. `strip`, `upper`, `fixed` and `echo` are built in.
#[derive(Debug, Clone)]
pub struct DecoratorRegistry {
    decorators: AHashMap<String, Arc<dyn Decorator>>,
}

impl Default for DecoratorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            decorators: AHashMap::default(),
        };
        registry.register("strip", Arc::new(Strip));
        registry.register("upper", Arc::new(Upper));
        registry.register("fixed", Arc::new(Fixed));
        registry.register("echo", Arc::new(Echo));
        registry
    }
}

impl DecoratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decorator, replacing any decorator of the same name.
    pub fn register(&mut self, name: &str, decorator: Arc<dyn Decorator>) {
        if self
            .decorators
            .insert(name.to_string(), decorator)
            .is_some()
        {
            log::debug!("Decorator @{} is replaced.", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Decorator>> {
        self.decorators.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_rewrites_prompt() {
        let registry = DecoratorRegistry::new();
        let ctx = DecoratorContext {
            variable: "X",
            args: &[],
        };
        let upper = registry.get("upper").map(|d| d.post("ab".into(), "ab".into(), &ctx));
        assert_eq!(upper, Some(("AB".to_string(), "AB".to_string())));
    }

    #[test]
    fn fixed_short_circuits() {
        let registry = DecoratorRegistry::new();
        let args = [Value::Str("yes".into())];
        let ctx = DecoratorContext {
            variable: "X",
            args: &args,
        };
        assert_eq!(
            registry.get("fixed").map(|d| d.pre(&ctx)),
            Some(PreOutcome::Fixed("yes".into()))
        );
    }
}
