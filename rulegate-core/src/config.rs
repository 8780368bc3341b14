//! Configuration model.
//!
//! The types here mirror the YAML surface: a top-level `proxy` section
//! (one mapping or a sequence of mappings) plus a shared `rules` list
//! that proxies without their own rules inherit at load time. All types
//! are built by the loader and treated as immutable afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::pattern::Pattern;

/// JSON object type used for request and response bodies.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Default upstream timeout applied when a listener does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// One transformation step.
///
/// An operation runs only when all of its `match_body` and
/// `match_headers` conditions hold; absent condition maps always match.
/// At least one of `template`, `merge`, `default`, `delete` must be
/// present (the validator enforces this).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    /// JSON key -> pattern; every entry must match the body value.
    #[serde(default)]
    pub match_body: HashMap<String, Pattern>,

    /// Header name -> pattern; every entry must match the header value.
    #[serde(default)]
    pub match_headers: HashMap<String, Pattern>,

    /// Template whose output replaces the whole body when it renders to
    /// a JSON object.
    #[serde(default)]
    pub template: Option<String>,

    /// Keys set unconditionally.
    #[serde(default)]
    pub merge: JsonMap,

    /// Keys set only when absent.
    #[serde(default)]
    pub default: JsonMap,

    /// Keys removed when present.
    #[serde(default)]
    pub delete: Vec<String>,

    /// When true, no later operation of the same rule runs.
    #[serde(default)]
    pub stop: bool,
}

impl Operation {
    /// Returns `true` when the operation carries at least one action.
    pub fn has_action(&self) -> bool {
        self.template.is_some()
            || !self.merge.is_empty()
            || !self.default.is_empty()
            || !self.delete.is_empty()
    }
}

/// A matcher plus ordered request/response operation lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rule {
    /// Patterns matched against the HTTP method.
    #[serde(default)]
    pub methods: Pattern,

    /// Patterns matched against the request URL path.
    #[serde(default)]
    pub paths: Pattern,

    /// Rewritten outbound path; must be absolute when set.
    #[serde(default)]
    pub target_path: Option<String>,

    /// Operations applied to the request body.
    #[serde(default)]
    pub on_request: Vec<Operation>,

    /// Operations applied to the response body.
    #[serde(default)]
    pub on_response: Vec<Operation>,
}

/// One listener binding: a listen address, an upstream target, and the
/// rules applied to traffic crossing it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// host:port to listen on; unique across the process.
    #[serde(default)]
    pub listen: String,

    /// Absolute URL of the upstream backend.
    #[serde(default)]
    pub target: String,

    /// Upstream timeout in seconds (default 60).
    #[serde(default)]
    pub timeout: Option<u64>,

    /// TLS certificate path; requires `ssl_key`.
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,

    /// TLS private key path; requires `ssl_cert`.
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,

    /// Enables per-request body dumps in the log.
    #[serde(default)]
    pub debug: bool,

    /// Listener-specific rules; when empty, the loader copies the
    /// top-level rules in.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl ProxyConfig {
    /// Upstream timeout with the default applied.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Returns `true` when both TLS materials are configured.
    pub fn has_tls(&self) -> bool {
        self.ssl_cert.is_some() && self.ssl_key.is_some()
    }
}

/// The merged configuration: every listener plus the shared rule list.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// All listener bindings, in file order.
    pub proxies: Vec<ProxyConfig>,

    /// Shared default rules, kept for diagnostics after inheritance.
    pub rules: Vec<Rule>,
}

/// One YAML document as written on disk, before merging.
///
/// `proxy:` accepts either a single mapping or a sequence of mappings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Document {
    #[serde(default, rename = "proxy", deserialize_with = "proxy_entries")]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn proxy_entries<'de, D>(deserializer: D) -> Result<Vec<ProxyConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entries {
        One(Box<ProxyConfig>),
        Many(Vec<ProxyConfig>),
        // A bare `proxy:` key reads as no proxies.
        Empty,
    }

    Ok(match Entries::deserialize(deserializer)? {
        Entries::One(single) => vec![*single],
        Entries::Many(multiple) => multiple,
        Entries::Empty => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_accepts_single_proxy_mapping() {
        let doc: Document = serde_yaml::from_str(
            r#"
proxy:
  listen: "localhost:8081"
  target: "http://localhost:8080"
"#,
        )
        .unwrap();
        assert_eq!(doc.proxies.len(), 1);
        assert_eq!(doc.proxies[0].listen, "localhost:8081");
    }

    #[test]
    fn test_document_accepts_proxy_sequence() {
        let doc: Document = serde_yaml::from_str(
            r#"
proxy:
  - listen: "localhost:8081"
    target: "http://localhost:8080"
  - listen: "localhost:8082"
    target: "http://localhost:8090"
"#,
        )
        .unwrap();
        assert_eq!(doc.proxies.len(), 2);
        assert_eq!(doc.proxies[1].listen, "localhost:8082");
    }

    #[test]
    fn test_document_with_bare_proxy_key() {
        let doc: Document = serde_yaml::from_str("proxy:\n").unwrap();
        assert!(doc.proxies.is_empty());
    }

    #[test]
    fn test_document_without_proxy_section() {
        let doc: Document = serde_yaml::from_str(
            r#"
rules:
  - methods: POST
    paths: /v1/chat
    on_request:
      - merge:
          temperature: 0.7
"#,
        )
        .unwrap();
        assert!(doc.proxies.is_empty());
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.rules[0].on_request.len(), 1);
    }

    #[test]
    fn test_operation_decodes_all_actions() {
        let op: Operation = serde_yaml::from_str(
            r#"
match_body:
  model: llama
match_headers:
  X-Env: prod
merge:
  temperature: 0.7
default:
  max_tokens: 256
delete:
  - stream_options
stop: true
"#,
        )
        .unwrap();
        assert!(op.has_action());
        assert!(op.stop);
        assert_eq!(op.merge["temperature"], serde_json::json!(0.7));
        assert_eq!(op.default["max_tokens"], serde_json::json!(256));
        assert_eq!(op.delete, vec!["stream_options"]);
        assert!(op.match_body.contains_key("model"));
        assert!(op.match_headers.contains_key("X-Env"));
    }

    #[test]
    fn test_operation_without_action() {
        let op: Operation = serde_yaml::from_str("stop: true").unwrap();
        assert!(!op.has_action());
    }

    #[test]
    fn test_timeout_default_and_explicit() {
        let proxy = ProxyConfig::default();
        assert_eq!(proxy.timeout_duration(), Duration::from_secs(60));

        let proxy: ProxyConfig = serde_yaml::from_str(
            r#"
listen: "localhost:8081"
target: "http://localhost:8080"
timeout: 30
"#,
        )
        .unwrap();
        assert_eq!(proxy.timeout_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_has_tls_requires_both_materials() {
        let mut proxy = ProxyConfig {
            ssl_cert: Some(PathBuf::from("cert.pem")),
            ..Default::default()
        };
        assert!(!proxy.has_tls());
        proxy.ssl_key = Some(PathBuf::from("key.pem"));
        assert!(proxy.has_tls());
    }
}
