//! RuleGate Core - Rule engine and JSON transformation pipeline
//!
//! This crate provides the configuration-driven rewrite machinery that
//! the `rulegate` binary wires into its HTTP plumbing:
//! - Pattern matching with case-insensitive, any-match regex sets
//! - A typed configuration model loaded from YAML with `include`
//!   expansion, multi-file merging, and CLI overrides
//! - Structural validation and in-place pattern compilation
//! - A template engine with the helper set user configs rely on
//! - The operation interpreter (template / default / merge / delete)
//! - Ordered rule matching by method and path
//! - A streaming line transformer for SSE and NDJSON responses
//!
//! # Overview
//!
//! The intended flow mirrors the proxy lifecycle: [`loader::load`]
//! produces a validated [`config::Config`] plus the watch list,
//! [`template::TemplateSet::compile`] prepares templates, and per
//! request the caller runs [`matcher::matching_rules`] and
//! [`ops::apply_operations`] against the parsed body. Streaming
//! responses go through [`streaming::StreamTransformer`] instead.
//!
//! # Modules
//!
//! - [`config`] - Configuration model and body type aliases
//! - [`error`] - Error types and result aliases
//! - [`loader`] - Multi-file loading and `include` expansion
//! - [`matcher`] - Ordered rule selection
//! - [`ops`] - The operation interpreter
//! - [`pattern`] - Case-insensitive regex pattern sets
//! - [`streaming`] - Line-by-line streaming transformation
//! - [`template`] - Template compilation and helper functions
//! - [`validate`] - Structural validation

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod loader;
pub mod matcher;
pub mod ops;
pub mod pattern;
pub mod streaming;
pub mod template;
#[cfg(test)]
pub mod test_utils;
pub mod validate;

// Re-export commonly used items at crate root
pub use config::{Config, JsonMap, Operation, ProxyConfig, Rule};
pub use error::{ConfigError, ConfigResult, ProxyError};
pub use loader::{CliOverrides, LoadedConfig};
pub use matcher::matching_rules;
pub use ops::{apply_operations, OpScope, DELETED};
pub use pattern::Pattern;
pub use streaming::{StreamContext, StreamTransformer, MAX_LINE_BYTES};
pub use template::{template_name, Phase, TemplateSet};
