//! The model backend contract and the registry of backend constructors.
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::constraint::LogitBias;
use crate::query::parser::parse_call_spec;
use crate::query::KeywordArgs;
use crate::tokenizer::Tokenizer;
use crate::vocabulary::CreateVocabularyError;

pub mod limiter;
pub mod random;

pub use limiter::{with_retries, Limiter};
pub use random::RandomBackend;

#[derive(Debug, thiserror::Error)]
/// The error type for model backends.
pub enum BackendError {
    /// A request did not complete in time.
    #[error("The request timed out")]
    Timeout,
    /// The backend refused the request because of rate limits.
    #[error("The backend is rate limited")]
    RateLimit,
    /// The backend answered with something unexpected. Not retried.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// No constructor is registered for the model specification.
    #[error("Unknown model {0:?}")]
    UnknownModel(String),
    /// A model specification argument has an invalid value.
    #[error("Invalid argument {key:?} of model {model:?}: {message}")]
    InvalidArgument {
        model: String,
        key: String,
        message: String,
    },
    #[error(transparent)]
    /// The vocabulary of the model could not be loaded.
    Vocabulary(#[from] CreateVocabularyError),
}

impl BackendError {
    /// Whether the request may succeed when issued again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout | BackendError::RateLimit)
    }
}

/// Receives tokens as a backend generates them.
pub trait Streamer: Send + Sync {
    fn put(&self, row: usize, token: u32);
    fn end(&self) {}
}

/// One batched generation request. Rows are left padded.
#[derive(Clone)]
pub struct GenerateRequest {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
    pub temperature: f32,
    pub max_new_tokens: usize,
    /// The logit bias of the first generated token of each row.
    pub bias: Vec<Option<LogitBias>>,
    pub streamer: Option<Arc<dyn Streamer>>,
}

impl Debug for GenerateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateRequest")
            .field("rows", &self.input_ids.len())
            .field("temperature", &self.temperature)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("streaming", &self.streamer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    /// The generated ids of each row, prompt excluded.
    pub sequences: Vec<Vec<u32>>,
    /// The biased logits of every generated position of each row.
    pub scores: Vec<Vec<Vec<f32>>>,
}

/// How much work a backend accepts at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub max_concurrent: usize,
    /// Approximate number of tokens in flight across concurrent requests.
    pub token_budget: usize,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            token_budget: 1 << 16,
        }
    }
}

/// A language model the runtime can drive.
#[async_trait]
pub trait ModelBackend: Send + Sync + Debug {
    /// The model specification the backend was created from.
    fn identifier(&self) -> &str;

    fn tokenizer(&self) -> Arc<dyn Tokenizer>;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutput, BackendError>;

    /// The log-probability of every token of each row given the tokens before it. The first
    /// token of a row scores zero.
    async fn score(
        &self,
        input_ids: Vec<Vec<u32>>,
        attention_mask: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<f32>>, BackendError>;

    fn max_batch_size(&self) -> usize;

    fn capacity(&self) -> Capacity {
        Capacity::default()
    }
}

/// Creates a backend from the keyword arguments of a model specification.
pub type BackendConstructor =
    fn(&str, &KeywordArgs, &BackendConfig) -> Result<Arc<dyn ModelBackend>, BackendError>;

/// Backends by model specification prefix. `random` is built in.
///
/// Instances are created once per specification string and shared afterwards.
#[derive(Debug)]
pub struct BackendRegistry {
    constructors: Vec<(String, BackendConstructor)>,
    instances: Mutex<AHashMap<String, Arc<dyn ModelBackend>>>,
    config: BackendConfig,
}

impl BackendRegistry {
    pub fn new(config: BackendConfig) -> Self {
        let mut registry = Self {
            constructors: Vec::new(),
            instances: Mutex::new(AHashMap::default()),
            config,
        };
        registry.register("random", RandomBackend::construct);
        registry
    }

    /// Registers a constructor for specifications starting with `prefix`. The longest
    /// matching prefix wins.
    pub fn register(&mut self, prefix: &str, constructor: BackendConstructor) {
        self.constructors.retain(|(p, _)| p != prefix);
        self.constructors.push((prefix.to_string(), constructor));
        self.constructors.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Adds an already created backend under `spec`.
    pub fn insert(&self, spec: &str, backend: Arc<dyn ModelBackend>) {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(spec.to_string(), backend);
    }

    /// The backend of a model specification such as `random(seed=123)`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownModel`] if no prefix matches.
    pub fn resolve(&self, spec: &str) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let spec = spec.trim();
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(backend) = instances.get(spec) {
            return Ok(backend.clone());
        }
        let (name, args) =
            parse_call_spec(spec).unwrap_or_else(|| (spec.to_string(), KeywordArgs::default()));
        let constructor = self
            .constructors
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, c)| *c)
            .ok_or_else(|| BackendError::UnknownModel(spec.to_string()))?;
        let backend = constructor(spec, &args, &self.config)?;
        log::info!("Loaded model {}.", spec);
        instances.insert(spec.to_string(), backend.clone());
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_caches_instances() {
        let registry = BackendRegistry::new(BackendConfig::default());
        let a = registry.resolve("random(seed=1)").map(|b| b.identifier().to_string());
        assert_eq!(a.ok().as_deref(), Some("random(seed=1)"));
        let first = registry.resolve("random(seed=1)");
        let second = registry.resolve("random(seed=1)");
        assert!(matches!((first, second), (Ok(x), Ok(y)) if Arc::ptr_eq(&x, &y)));
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        let registry = BackendRegistry::new(BackendConfig::default());
        assert!(matches!(
            registry.resolve("openai/gpt-4"),
            Err(BackendError::UnknownModel(_))
        ));
    }
}
