//! The runtime: owns backends, decorators and caches, and runs queries.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashSet;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, BackendRegistry, Limiter, ModelBackend};
use crate::cache::{CacheError, DiskCache};
use crate::config::Config;
use crate::constraint::{EvalError, Value};
use crate::decoding::{Scheduler, SubqueryRunner};
use crate::output::{Postprocessor, QueryOutcome, StreamSink};
use crate::query::interpreter::InterpretError;
use crate::query::{parse_program, DecoratorRegistry, Interpreter, ParseQueryError, Program, Query};
use crate::tokenset::TokenSetCache;

#[derive(Debug, thiserror::Error)]
/// The error type of query runs.
pub enum RuntimeError {
    /// Every continuation of a hole violates the constraint.
    #[error("The constraint on {variable} cannot be satisfied (head {head}, prompt {prompt:?})")]
    ConstraintUnsatisfiable {
        head: usize,
        variable: String,
        prompt: String,
    },
    /// Backtracking did not find a continuation within the rewind budget.
    #[error("Generation of {variable} is stuck after {rewinds} rewinds (head {head}, prompt {prompt:?})")]
    GenerationStuck {
        head: usize,
        variable: String,
        rewinds: usize,
        prompt: String,
    },
    /// A backend request timed out on every retry.
    #[error("Model {model} timed out")]
    BackendTimeout { model: String },
    /// A backend request was rate limited on every retry.
    #[error("Model {model} is rate limited")]
    BackendRateLimit { model: String },
    /// A backend answered with something unexpected.
    #[error("Model {model} violated the backend protocol: {message}")]
    BackendProtocolError { model: String, message: String },
    /// Text does not survive tokenization, or a rewrite moved a stop phrase.
    #[error("Tokenization mismatch in {variable}: {detail}")]
    TokenizationMismatch { variable: String, detail: String },
    #[error(transparent)]
    /// A `TypeError` or `NameError` of an expression.
    Eval(#[from] EvalError),
    /// The run exceeded the generation deadline.
    #[error("The query did not finish within {deadline:?} (prompt {prompt:?})")]
    Timeout { deadline: Duration, prompt: String },
    #[error(transparent)]
    /// The query source is invalid.
    Parse(#[from] ParseQueryError),
    #[error("Query {0:?} is not defined")]
    UnknownQuery(String),
    #[error("Decorator @{0} is not registered")]
    UnknownDecorator(String),
    #[error("Query {query:?} expects {expected} arguments, got {got}")]
    Arity {
        query: String,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    /// A backend could not be created.
    Backend(BackendError),
    #[error(transparent)]
    /// The on-disk cache failed.
    Cache(#[from] CacheError),
    /// The interpreter was resumed out of order.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Attributes a backend error to `model`.
    pub fn from_backend(model: &str, error: BackendError) -> Self {
        let model = model.to_string();
        match error {
            BackendError::Timeout => RuntimeError::BackendTimeout { model },
            BackendError::RateLimit => RuntimeError::BackendRateLimit { model },
            BackendError::Protocol(message) => RuntimeError::BackendProtocolError { model, message },
            other => RuntimeError::Backend(other),
        }
    }
}

impl From<InterpretError> for RuntimeError {
    fn from(error: InterpretError) -> Self {
        match error {
            InterpretError::Eval(e) => RuntimeError::Eval(e),
            InterpretError::UnknownQuery(name) => RuntimeError::UnknownQuery(name),
            InterpretError::UnknownDecorator(name) => RuntimeError::UnknownDecorator(name),
            InterpretError::Arity {
                query,
                expected,
                got,
            } => RuntimeError::Arity {
                query,
                expected,
                got,
            },
            InterpretError::StopPhraseStraddlesRewrite { variable, phrase } => {
                RuntimeError::TokenizationMismatch {
                    variable,
                    detail: format!(
                        "stop phrase {:?} straddles the rewritten value and the following text",
                        phrase
                    ),
                }
            }
            e @ InterpretError::NoPendingHole => RuntimeError::Internal(e.to_string()),
        }
    }
}

/// Runs queries. Cheap to share behind an `Arc`.
pub struct Runtime {
    config: Config,
    backends: BackendRegistry,
    decorators: DecoratorRegistry,
    cache: Arc<TokenSetCache>,
    disk: Option<DiskCache>,
    /// Tokenizers whose on-disk entries were loaded.
    loaded: Mutex<AHashSet<String>>,
    cancel: CancellationToken,
    sink: Option<Arc<dyn StreamSink>>,
    postprocessors: Vec<Arc<dyn Postprocessor>>,
    /// Replaces the `from` clause of top-level queries.
    forced_model: Option<String>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("decorators", &self.decorators)
            .field("disk", &self.disk)
            .field("streaming", &self.sink.is_some())
            .field("postprocessors", &self.postprocessors.len())
            .field("forced_model", &self.forced_model)
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime. A cache directory that cannot be opened disables the on-disk
    /// cache with a warning.
    pub fn new(config: Config) -> Self {
        let disk = if config.cache.enabled {
            match DiskCache::open(config.cache.directory()) {
                Ok(disk) => Some(disk),
                Err(e) => {
                    log::warn!("The on-disk cache is disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            backends: BackendRegistry::new(config.backend.clone()),
            decorators: DecoratorRegistry::default(),
            cache: Arc::new(TokenSetCache::new()),
            disk,
            loaded: Mutex::new(AHashSet::default()),
            cancel: CancellationToken::new(),
            sink: None,
            postprocessors: Vec::new(),
            forced_model: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends_mut(&mut self) -> &mut BackendRegistry {
        &mut self.backends
    }

    pub fn decorators_mut(&mut self) -> &mut DecoratorRegistry {
        &mut self.decorators
    }

    pub fn token_set_cache(&self) -> &Arc<TokenSetCache> {
        &self.cache
    }

    /// Streams snapshots of every run to `sink`.
    pub fn set_sink(&mut self, sink: Arc<dyn StreamSink>) {
        self.sink = Some(sink);
    }

    pub fn add_postprocessor(&mut self, postprocessor: Arc<dyn Postprocessor>) {
        self.postprocessors.push(postprocessor);
    }

    /// Runs top-level queries on `model` even when they name another one.
    pub fn force_model(&mut self, model: impl Into<String>) {
        self.forced_model = Some(model.into());
    }

    /// The token that cancels every run of this runtime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Parses `source` and runs its first query with positional `args`.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] if parsing or the run fails.
    pub async fn run_source(&self, source: &str, args: Vec<Value>) -> Result<QueryOutcome, RuntimeError> {
        let program = Arc::new(parse_program(source)?);
        let name = program
            .main()
            .map(|q| q.name.clone())
            .ok_or(RuntimeError::Parse(ParseQueryError::Empty))?;
        self.run_query(&program, &name, args).await
    }

    /// Runs the query `name` of `program`.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] if the query is unknown or the run fails.
    pub async fn run_query(
        &self,
        program: &Arc<Program>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<QueryOutcome, RuntimeError> {
        let query = program
            .query(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownQuery(name.to_string()))?;
        let model = self
            .forced_model
            .clone()
            .or_else(|| query.model.clone())
            .unwrap_or_else(|| self.config.backend.model.clone());
        let result = self.run_on(program.clone(), query, args, &model).await;
        if let Some(sink) = &self.sink {
            match &result {
                Ok(_) => sink.done(),
                Err(e) => sink.error(&e.to_string()),
            }
        }
        let outcome = result?;
        Ok(match outcome {
            QueryOutcome::Completed(results) => QueryOutcome::Completed(
                self.postprocessors
                    .iter()
                    .fold(results, |results, p| p.process(results)),
            ),
            QueryOutcome::Cancelled => QueryOutcome::Cancelled,
        })
    }

    fn backend(&self, model: &str) -> Result<Arc<dyn ModelBackend>, RuntimeError> {
        let backend = self
            .backends
            .resolve(model)
            .map_err(|e| RuntimeError::from_backend(model, e))?;
        if let Some(disk) = &self.disk {
            let tokenizer = backend.tokenizer();
            let first_use = self
                .loaded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(tokenizer.identifier().to_string());
            if first_use {
                if disk.load_vocabulary(tokenizer.identifier())?.is_none() {
                    disk.store_vocabulary(tokenizer.identifier(), tokenizer.vocabulary())?;
                }
                let tries = disk.load_dead_prefixes(tokenizer.identifier())?;
                self.cache.with_derivatives(|d| d.import_dead_prefixes(tries));
            }
        }
        Ok(backend)
    }

    async fn run_on(
        &self,
        program: Arc<Program>,
        query: Arc<Query>,
        args: Vec<Value>,
        model: &str,
    ) -> Result<QueryOutcome, RuntimeError> {
        let backend = self.backend(model)?;
        let decoder = query.decoder.clone();
        let interpreter = Interpreter::new(program, query, args, model)?;
        let scheduler = Scheduler {
            limiter: Limiter::new(backend.capacity()),
            backend: backend.clone(),
            cache: &self.cache,
            decorators: &self.decorators,
            config: &self.config,
            cancel: self.cancel.clone(),
            sink: self.sink.as_deref(),
            subqueries: self,
        };
        let outcome = scheduler.run(interpreter, decoder.as_ref()).await;
        if let Some(disk) = &self.disk {
            let tries = self.cache.with_derivatives(|d| d.export_dead_prefixes());
            if !tries.is_empty() {
                disk.store_dead_prefixes(backend.tokenizer().identifier(), &tries)?;
            }
        }
        outcome
    }
}

#[async_trait]
impl SubqueryRunner for Runtime {
    async fn run_subquery(
        &self,
        program: Arc<Program>,
        query: Arc<Query>,
        args: Vec<Value>,
        model: &str,
    ) -> Result<(Value, String), RuntimeError> {
        log::debug!("Running nested query {} on {}.", query.name, model);
        match self.run_on(program, query, args, model).await? {
            QueryOutcome::Completed(results) => Ok(results
                .into_iter()
                .next()
                .map(|r| match r.return_value {
                    Value::None => (Value::Str(r.prompt.clone()), r.prompt),
                    value => (value, r.prompt),
                })
                .unwrap_or((Value::None, String::new()))),
            QueryOutcome::Cancelled => Ok((Value::None, String::new())),
        }
    }
}
