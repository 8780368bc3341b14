//! Error types for RuleGate.
//!
//! Two error families exist: [`ConfigError`] for anything that goes wrong
//! while loading, validating, or compiling configuration, and
//! [`ProxyError`] for per-request failures. Configuration errors are fatal
//! at startup and recoverable during reload; request errors never
//! terminate the process.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading, validating, or compiling a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config or include file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file did not parse as YAML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// The expanded document did not decode into the typed model.
    #[error("failed to decode config {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// An `include` node was malformed or nested too deeply.
    #[error("invalid include: {0}")]
    Include(String),

    /// A structural invariant does not hold on the merged config.
    #[error("config validation failed: {0}")]
    Validation(String),

    /// A regex pattern failed to compile.
    #[error("invalid regex pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    /// A template failed to parse, named by rule and operation position.
    #[error("rule {rule} {phase} operation {operation}: {source}")]
    Template {
        rule: usize,
        operation: usize,
        phase: &'static str,
        source: minijinja::Error,
    },

    /// CLI overrides were given but more than one proxy is configured.
    #[error(
        "CLI overrides for listen/target/timeout/ssl are only supported with a single proxy; \
         define multiple listeners in the config file instead"
    )]
    OverrideConflict,

    /// No usable proxy section was found after merging.
    #[error("no proxies configured; add a proxy section or pass --listen/--target")]
    NoProxies,

    /// No config files were supplied.
    #[error("at least one config file required")]
    NoConfigFiles,
}

/// Errors raised while processing a single request or response.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Reading the inbound or upstream body failed.
    #[error("body read error: {0}")]
    BodyRead(String),

    /// Template execution or post-transform serialization failed.
    #[error("transform error: {0}")]
    Transform(String),

    /// Dial/read/write towards the backend failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The streaming scanner or pipe failed mid-stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// A listener could not bind or serve.
    #[error("listener error: {0}")]
    Listener(String),
}

impl ProxyError {
    /// Returns the HTTP status code a client should see for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BodyRead(_) => 400,
            Self::Transform(_) => 502,
            Self::Upstream(_) => 502,
            Self::Stream(_) => 502,
            Self::Listener(_) => 500,
        }
    }

    /// Returns a sanitized message suitable for HTTP responses.
    ///
    /// Internal details stay in the logs; clients get a generic phrase.
    pub fn user_message(&self) -> &str {
        match self {
            Self::BodyRead(_) => "Bad request",
            Self::Transform(_) => "Bad gateway",
            Self::Upstream(_) => "Bad gateway",
            Self::Stream(_) => "Bad gateway",
            Self::Listener(_) => "Internal server error",
        }
    }
}
