//! The configuration module of the runtime.
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::query::DecoderKind;

/// The configuration of a [`Runtime`](crate::runtime::Runtime). This should suffice most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Defaults of the decoders. Decoder clauses of queries override them.
    pub decoder: DecoderConfig,
    /// The configuration of the backtracker.
    pub backtrack: BacktrackConfig,
    /// The configuration of model backends.
    pub backend: BackendConfig,
    /// The configuration of the on-disk cache.
    pub cache: CacheConfig,
}

/// Decoder defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// The decoder of queries without a decoder clause.
    /// The default is [`DecoderKind::Argmax`].
    pub decoder: DecoderKind,
    /// The maximum length of a sequence in tokens, prompt included.
    /// The default is 2048.
    pub max_len: usize,
    /// The maximum number of tokens of a hole without a tighter bound.
    /// The default is 32.
    pub max_tokens_per_hole: usize,
    /// The default is 1.0.
    pub temperature: f32,
    /// The width of `beam` and `beam_var` and the number of samples of `sample`.
    /// The default is 2 for beams; `sample` draws 1 sample unless `n` is given.
    pub n: usize,
    /// The seed of the sampling RNG.
    /// The default is 0.
    pub seed: u64,
    /// The maximum number of heads sent to a backend in one request.
    /// `None` uses the backend's own limit.
    pub max_batch_size: Option<usize>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderKind::Argmax,
            max_len: 2048,
            max_tokens_per_hole: 32,
            temperature: 1.0,
            n: 2,
            seed: 0,
            max_batch_size: None,
        }
    }
}

/// The configuration of the backtracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct BacktrackConfig {
    /// The maximum number of rewinds of one head in one hole.
    /// The default is 64.
    pub max_rewinds: usize,
}

impl Default for BacktrackConfig {
    fn default() -> Self {
        Self { max_rewinds: 64 }
    }
}

/// The configuration of model backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// The model of queries without a `from` clause.
    /// The default is `random`.
    pub model: String,
    /// The timeout of one backend request. A timed out request is issued again.
    /// The default is 30 seconds.
    pub chunk_timeout: Duration,
    /// The deadline of a whole query run. `None` means no deadline.
    pub generation_timeout: Option<Duration>,
    /// How often a timed out or rate limited request is retried.
    /// The default is 3.
    pub max_retries: u32,
    /// The delay before the first retry, doubled for every further retry.
    /// The default is 100 milliseconds.
    pub initial_backoff: Duration,
    pub api_key: Option<String>,
    pub organization: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: "random".to_string(),
            chunk_timeout: Duration::from_secs(30),
            generation_timeout: None,
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            api_key: None,
            organization: None,
        }
    }
}

/// The configuration of the on-disk cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct CacheConfig {
    /// The default is `true`.
    pub enabled: bool,
    /// The cache directory. `None` uses `.lmql-cache` in the working directory.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

impl CacheConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(".lmql-cache"))
    }
}

impl Config {
    /// The default configuration overlaid with the `LMQL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays the `LMQL_*` variables returned by `lookup`.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup("LMQL_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(organization) = lookup("LMQL_ORGANIZATION") {
            self.backend.organization = Some(organization);
        }
        if let Some(directory) = lookup("LMQL_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(directory));
        }
        if let Some(timeout) = lookup("LMQL_CHUNK_TIMEOUT") {
            match timeout.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 && secs.is_finite() => {
                    self.backend.chunk_timeout = Duration::from_secs_f64(secs)
                }
                _ => log::warn!(
                    "LMQL_CHUNK_TIMEOUT={:?} is not a positive number of seconds and is ignored.",
                    timeout
                ),
            }
        }
        if let Some(disable) = lookup("LMQL_DISABLE_CACHE") {
            if !matches!(disable.trim(), "" | "0" | "false" | "False") {
                self.cache.enabled = false;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::default().overlay(|key| match key {
            "LMQL_CHUNK_TIMEOUT" => Some("2.5".to_string()),
            "LMQL_DISABLE_CACHE" => Some("1".to_string()),
            "LMQL_API_KEY" => Some("sk".to_string()),
            _ => None,
        });
        assert_eq!(config.backend.chunk_timeout, Duration::from_millis(2500));
        assert!(!config.cache.enabled);
        assert_eq!(config.backend.api_key.as_deref(), Some("sk"));
    }

    #[test]
    fn invalid_timeout_is_ignored() {
        let config = Config::default().overlay(|key| {
            (key == "LMQL_CHUNK_TIMEOUT").then(|| "soon".to_string())
        });
        assert_eq!(config.backend.chunk_timeout, Duration::from_secs(30));
    }
}
