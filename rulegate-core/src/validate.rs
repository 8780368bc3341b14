//! Structural validation of the merged configuration.
//!
//! Validation is pure apart from compiling patterns in place: no I/O,
//! no other mutation. It runs after loading and before template
//! compilation, both at startup and on every reload.

use std::collections::HashSet;

use url::Url;

use crate::config::{Config, Operation, Rule};
use crate::error::{ConfigError, ConfigResult};

/// Checks every invariant on the merged config and compiles all
/// patterns.
pub fn validate(config: &mut Config) -> ConfigResult<()> {
    if config.proxies.is_empty() {
        return Err(ConfigError::NoProxies);
    }

    let mut listens = HashSet::new();
    for (index, proxy) in config.proxies.iter_mut().enumerate() {
        if proxy.listen.is_empty() {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: listen is required"
            )));
        }
        if !listens.insert(proxy.listen.clone()) {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: duplicate listen address '{}'",
                proxy.listen
            )));
        }
        if proxy.target.is_empty() {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: target is required"
            )));
        }
        if let Err(err) = Url::parse(&proxy.target) {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: invalid target URL '{}': {err}",
                proxy.target
            )));
        }
        if let Some(0) = proxy.timeout {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: timeout must be positive"
            )));
        }
        if proxy.ssl_cert.is_some() != proxy.ssl_key.is_some() {
            return Err(ConfigError::Validation(format!(
                "proxy {index}: both ssl_cert and ssl_key must be provided together"
            )));
        }

        for (rule_index, rule) in proxy.rules.iter_mut().enumerate() {
            validate_rule(rule, rule_index)?;
        }
    }

    // Shared rules are validated too so a broken rule fails the load
    // even when every proxy has its own list.
    for (rule_index, rule) in config.rules.iter_mut().enumerate() {
        validate_rule(rule, rule_index)?;
    }

    Ok(())
}

fn validate_rule(rule: &mut Rule, index: usize) -> ConfigResult<()> {
    if rule.methods.is_empty() {
        return Err(ConfigError::Validation(format!(
            "rule {index}: methods required"
        )));
    }
    if rule.paths.is_empty() {
        return Err(ConfigError::Validation(format!(
            "rule {index}: paths required"
        )));
    }
    if rule.on_request.is_empty() && rule.on_response.is_empty() {
        return Err(ConfigError::Validation(format!(
            "rule {index}: at least one operation required (on_request or on_response)"
        )));
    }
    if let Some(target_path) = &rule.target_path {
        if !target_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "rule {index}: target_path must be absolute"
            )));
        }
    }

    rule.methods.compile()?;
    rule.paths.compile()?;

    for (op_index, op) in rule.on_request.iter_mut().enumerate() {
        validate_operation(op, index, op_index, "on_request")?;
    }
    for (op_index, op) in rule.on_response.iter_mut().enumerate() {
        validate_operation(op, index, op_index, "on_response")?;
    }

    Ok(())
}

fn validate_operation(
    op: &mut Operation,
    rule_index: usize,
    op_index: usize,
    phase: &str,
) -> ConfigResult<()> {
    for pattern in op.match_body.values_mut() {
        pattern.compile()?;
    }
    for pattern in op.match_headers.values_mut() {
        pattern.compile()?;
    }

    if !op.has_action() {
        return Err(ConfigError::Validation(format!(
            "rule {rule_index} {phase} {op_index}: must have at least one action \
             (template, merge, default, or delete)"
        )));
    }

    for (map_name, map) in [("merge", &op.merge), ("default", &op.default)] {
        for (key, value) in map {
            if key.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "rule {rule_index} {phase} {op_index}: {map_name} keys must be non-empty"
                )));
            }
            if value.is_null() {
                return Err(ConfigError::Validation(format!(
                    "rule {rule_index} {phase} {op_index}: {map_name} value for '{key}' \
                     must not be null"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::pattern::Pattern;

    fn proxy(listen: &str, target: &str) -> ProxyConfig {
        ProxyConfig {
            listen: listen.into(),
            target: target.into(),
            rules: vec![merge_rule()],
            ..Default::default()
        }
    }

    fn merge_rule() -> Rule {
        let mut merge = crate::config::JsonMap::new();
        merge.insert("temperature".into(), serde_json::json!(0.7));
        Rule {
            methods: Pattern::new(["POST"]),
            paths: Pattern::new(["/v1/chat"]),
            on_request: vec![Operation {
                merge,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let mut config = Config {
            proxies: vec![proxy("localhost:8081", "http://localhost:8080")],
            rules: vec![],
        };
        validate(&mut config).unwrap();
        // Patterns are compiled in place.
        assert!(config.proxies[0].rules[0].methods.matches("post"));
    }

    #[test]
    fn test_missing_listen() {
        let mut config = Config {
            proxies: vec![proxy("", "http://localhost:8080")],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("listen is required"));
    }

    #[test]
    fn test_missing_target() {
        let mut config = Config {
            proxies: vec![proxy("localhost:8081", "")],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("target is required"));
    }

    #[test]
    fn test_invalid_target_url() {
        let mut config = Config {
            proxies: vec![proxy("localhost:8081", "not a url")],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("invalid target URL"));
    }

    #[test]
    fn test_duplicate_listen_addresses() {
        let mut config = Config {
            proxies: vec![
                proxy("localhost:8081", "http://localhost:8080"),
                proxy("localhost:8081", "http://localhost:8090"),
            ],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("duplicate listen address"));
    }

    #[test]
    fn test_ssl_pair_incomplete() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.ssl_cert = Some("cert.pem".into());
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("ssl_cert and ssl_key"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.timeout = Some(0);
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("timeout must be positive"));
    }

    #[test]
    fn test_rule_requires_methods_and_paths() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].methods = Pattern::default();
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("methods required"));
    }

    #[test]
    fn test_rule_requires_operations() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].on_request.clear();
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("at least one operation required"));
    }

    #[test]
    fn test_response_only_rule_is_valid() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        let ops = listener.rules[0].on_request.drain(..).collect();
        listener.rules[0].on_response = ops;
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        validate(&mut config).unwrap();
    }

    #[test]
    fn test_target_path_must_be_absolute() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].target_path = Some("v1/chat".into());
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("target_path must be absolute"));
    }

    #[test]
    fn test_operation_without_action_rejected() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].on_request[0] = Operation {
            stop: true,
            ..Default::default()
        };
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("at least one action"));
    }

    #[test]
    fn test_null_merge_value_rejected() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].on_request[0]
            .merge
            .insert("bad".into(), serde_json::Value::Null);
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("must not be null"));
    }

    #[test]
    fn test_bad_regex_in_match_body() {
        let mut listener = proxy("localhost:8081", "http://localhost:8080");
        listener.rules[0].on_request[0]
            .match_body
            .insert("model".into(), Pattern::new(["[unclosed"]));
        let mut config = Config {
            proxies: vec![listener],
            rules: vec![],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("invalid regex pattern"));
    }

    #[test]
    fn test_shared_rules_validated() {
        let mut bad = merge_rule();
        bad.paths = Pattern::default();
        let mut config = Config {
            proxies: vec![proxy("localhost:8081", "http://localhost:8080")],
            rules: vec![bad],
        };
        let err = validate(&mut config).unwrap_err();
        assert!(err.to_string().contains("paths required"));
    }
}
