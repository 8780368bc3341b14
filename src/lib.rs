//! RuleGate - A declarative rewrite gate for LLM backends
//!
//! RuleGate sits between LLM clients and one or more backend servers
//! and rewrites requests and responses in flight according to ordered
//! matching rules from a YAML configuration:
//! - Per-model generation parameter overrides (merge / default / delete)
//! - Template-driven body reshaping between vendor API formats
//! - URL path rewriting
//! - Streaming (SSE and NDJSON) response transformation, line by line
//! - Hot reload of the full listener set on config changes
//!
//! The rule engine itself lives in the `rulegate-core` crate; this
//! crate wires it into HTTP plumbing: listeners, TLS termination,
//! upstream forwarding, and the reload controller.
//!
//! # Modules
//!
//! - [`args`] - Command line argument parsing
//! - [`handler`] - Request and response pipelines
//! - [`reload`] - Config watching and hot reload
//! - [`server`] - Listener supervision and connection draining
//! - [`tls`] - TLS termination

#![forbid(unsafe_code)]

pub mod args;
pub mod handler;
pub mod reload;
pub mod server;
pub mod tls;

// Re-export commonly used items at crate root
pub use handler::{handle_request, ListenerState, ReadyConfig, MAX_BODY_BYTES};
pub use server::{start_listeners, stop_listeners, ListenerHandle, DRAIN_GRACE};
