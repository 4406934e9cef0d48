//! # lmql-runtime
//!
//! A runtime for constrained generation. A *query* is a prompt program: literal text with
//! *holes* the model fills in, ordinary control flow around it, and a `where` clause of
//! logical constraints over the hole values. The runtime drives a language model through
//! the program token by token, and before every step it computes the set of tokens that
//! can still lead to a value satisfying the constraints. Tokens outside that set are
//! masked, so the model can only produce values the constraints accept.
//!
//! ## Queries
//!
//! ```text
//! argmax
//!     "Q: What is the capital of France? A:[ANSWER]"
//!     "\nDone."
//! from "random(seed=123)"
//! where
//!     stops_at(ANSWER, ".") and len(TOKENS(ANSWER)) < 20
//! ```
//!
//! The first line names the decoder (`argmax`, `sample(n=3, temperature=0.7)`,
//! `beam(n=2)` or `beam_var(n=2)`). Every line of the body is a template, an assignment,
//! an `if`, a `for` or a `return`. The `from` clause picks the model and `where` holds
//! the constraints. A file may also define several `query NAME(params):` blocks that call
//! each other as nested queries.
//!
//! ## Constraints
//!
//! Constraint expressions compile to an operator graph ([`constraint::OpGraph`]). Every
//! operator computes a value for the current partial program state and a *follow map*
//! that partitions the vocabulary by the value it would have one token later. The
//! follow map of the root, restricted to the tokens where it is not definitely `false`,
//! is the mask ([`constraint::LogitBias`]).
//!
//! Operators include comparisons, `len`, `in`, `int`, `stops_at`, `stops_before`,
//! `TOKENS`, `SENTENCES`, `REGEX` and `and`/`or`/`not`. Values are three valued:
//! *fixed* values can no longer change, while *var* values may still grow. Regular
//! expressions use a derivative automaton ([`regex::DerivativeCache`]) whose dead
//! prefixes are remembered and optionally persisted across runs.
//!
//! ## Decoding
//!
//! Decoders own a set of [`decoding::DecoderHead`]s. Each head carries the token ids of
//! its prompt, its cumulative log-probability and the interpreter state of its branch.
//! At every step the heads are batched, the backend is asked for next-token scores, the
//! mask is applied and the decoder expands and prunes the heads. When a constraint leaves
//! no token, the offending token is blocked and the branch backtracks.
//!
//! ## Backends
//!
//! Backends implement [`ModelBackend`]. They are looked up by model name in a
//! [`backend::BackendRegistry`] and share a per-model concurrency and token budget.
//! [`RandomBackend`] is a deterministic backend over a small byte-level vocabulary; it
//! is what the `random(seed=N)` model name resolves to.
//!
//! ## Example
//!
//! ```rust
//! use lmql_runtime::config::{CacheConfig, Config};
//! use lmql_runtime::Runtime;
//!
//! let config = Config {
//!     cache: CacheConfig {
//!         enabled: false,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! let runtime = Runtime::new(config);
//! let source = r#"
//! argmax
//!     "Greet someone:[GREETING]"
//! from "random(seed=123)"
//! where
//!     GREETING == " Hello you"
//! "#;
//! let outcome = tokio::runtime::Runtime::new()
//!     .unwrap()
//!     .block_on(runtime.run_source(source, vec![]))
//!     .unwrap();
//! let best = outcome.best().unwrap();
//! assert_eq!(best.text("GREETING"), Some(" Hello you"));
//! assert_eq!(best.prompt, "Greet someone: Hello you");
//! ```
//!
//! ## Configuration
//!
//! [`Config`] is a serde struct with sensible defaults. [`Config::from_env`] overlays the
//! `LMQL_*` environment variables. The `lmql` binary reads both and runs a query file.
#![warn(rustdoc::broken_intra_doc_links)]
pub mod backend;
pub mod cache;
pub mod config;
pub mod constraint;
pub mod decoding;
pub mod output;
pub mod query;
pub mod regex;
pub mod runtime;
pub mod tokenizer;
pub mod tokenset;
mod utils;
pub mod vocabulary;

pub use backend::{ModelBackend, RandomBackend};
pub use config::Config;
pub use constraint::{EvalError, Value};
pub use output::{JsonLinesSink, QueryOutcome, QueryResult, StreamSink};
pub use query::{parse_program, Program};
pub use runtime::{Runtime, RuntimeError};
pub use tokenizer::{Tokenizer, VocabTokenizer};
pub use tokenset::TokenSet;
pub use vocabulary::{Token, Vocabulary};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
