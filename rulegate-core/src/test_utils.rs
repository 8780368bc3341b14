//! Test utilities for RuleGate.
//!
//! Shared builders used across unit tests. Only compiled for tests.

use std::sync::Arc;

use crate::config::{Config, Document};
use crate::template::TemplateSet;
use crate::validate;

/// Parses a YAML config string into a validated config with compiled
/// templates, applying rule inheritance the way the loader does.
///
/// Panics on any error; tests that exercise failure paths should call
/// the loader or validator directly.
pub fn ready_config(yaml: &str) -> (Arc<Config>, Arc<TemplateSet>) {
    let document: Document = serde_yaml::from_str(yaml).expect("test config must parse");
    let shared_rules = document.rules.clone();
    let mut config = Config {
        proxies: document.proxies,
        rules: document.rules,
    };
    for proxy in &mut config.proxies {
        if proxy.rules.is_empty() && !shared_rules.is_empty() {
            proxy.rules = shared_rules.clone();
        }
    }
    validate::validate(&mut config).expect("test config must validate");
    let templates = TemplateSet::compile(&config).expect("test templates must compile");
    (Arc::new(config), Arc::new(templates))
}
