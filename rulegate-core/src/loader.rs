//! Configuration loading, `include` expansion, and multi-file merging.
//!
//! Loading works on the YAML value tree: every `include` node is
//! expanded in place *before* the tree is decoded into the typed model,
//! so included fragments can appear anywhere a mapping or sequence
//! element is structurally valid. Include paths resolve relative to the
//! file that contains them; SSL paths resolve relative to the config
//! file that defines them.
//!
//! The loader also produces the deduplicated list of every file it read
//! (configs, includes, SSL materials) so the reload controller knows
//! what to watch.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info};

use crate::config::{Config, Document, ProxyConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::validate;

/// Hard bound on include nesting. Anything deeper is treated as a cycle.
const MAX_INCLUDE_DEPTH: usize = 32;

/// Command-line overrides applied on top of the merged config.
///
/// Listener overrides require exactly one proxy; `debug` is always
/// applied process-wide.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub target: Option<String>,
    pub timeout: Option<u64>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub debug: bool,
}

impl CliOverrides {
    /// Returns `true` when any listener-scoped override is set.
    pub fn has_proxy_values(&self) -> bool {
        self.listen.is_some()
            || self.target.is_some()
            || self.timeout.is_some()
            || self.ssl_cert.is_some()
            || self.ssl_key.is_some()
    }
}

/// A validated configuration plus the files that produced it.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    /// Every file read during the load, deduplicated, first-seen order.
    pub watched_files: Vec<PathBuf>,
}

/// Ordered, deduplicated collection of files to watch.
struct WatchList {
    paths: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl WatchList {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn add(&mut self, path: &Path) {
        let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        if self.seen.insert(abs.clone()) {
            self.paths.push(abs);
        }
    }
}

/// Loads and merges one or more config files, expands includes, applies
/// CLI overrides, and validates the result.
///
/// Proxies and top-level rules concatenate across files in load order.
/// Proxies without rules inherit the merged top-level rules.
pub fn load(config_paths: &[PathBuf], overrides: &CliOverrides) -> ConfigResult<LoadedConfig> {
    if config_paths.is_empty() {
        return Err(ConfigError::NoConfigFiles);
    }

    let mut watch = WatchList::new();
    let mut proxies: Vec<ProxyConfig> = Vec::new();
    let mut rules = Vec::new();
    info!(files = config_paths.len(), "loading configuration");

    for (index, config_path) in config_paths.iter().enumerate() {
        watch.add(config_path);
        let mut document = load_document(config_path, &mut watch)?;
        debug!(index, path = %config_path.display(), "loaded config file");

        let config_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        for proxy in &mut document.proxies {
            if let Some(cert) = &proxy.ssl_cert {
                let resolved = resolve_path(cert, config_dir);
                watch.add(&resolved);
                proxy.ssl_cert = Some(resolved);
            }
            if let Some(key) = &proxy.ssl_key {
                let resolved = resolve_path(key, config_dir);
                watch.add(&resolved);
                proxy.ssl_key = Some(resolved);
            }
        }

        proxies.extend(document.proxies);
        rules.extend(document.rules);
    }

    // CLI-only setups are allowed: --listen/--target without a proxy
    // section synthesize a single listener.
    if proxies.is_empty() && overrides.has_proxy_values() {
        proxies.push(ProxyConfig::default());
    }
    if proxies.is_empty() {
        return Err(ConfigError::NoProxies);
    }
    if proxies.len() > 1 && overrides.has_proxy_values() {
        return Err(ConfigError::OverrideConflict);
    }

    if proxies.len() == 1 {
        apply_overrides(&mut proxies[0], overrides, &mut watch);
    } else if overrides.debug {
        for proxy in &mut proxies {
            proxy.debug = true;
        }
    }

    for proxy in &mut proxies {
        if proxy.rules.is_empty() && !rules.is_empty() {
            proxy.rules = rules.clone();
        }
    }

    let mut config = Config { proxies, rules };
    validate::validate(&mut config)?;

    for (index, proxy) in config.proxies.iter().enumerate() {
        info!(
            index,
            listen = %proxy.listen,
            target = %proxy.target,
            rules = proxy.rules.len(),
            timeout_secs = proxy.timeout_duration().as_secs(),
            tls = proxy.has_tls(),
            "proxy configured"
        );
    }

    Ok(LoadedConfig {
        config,
        watched_files: watch.paths,
    })
}

/// Reads one file, expands its includes, and decodes it.
fn load_document(path: &Path, watch: &mut WatchList) -> ConfigResult<Document> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut value: Value = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let base_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    expand_includes(&mut value, base_dir, watch, 0)?;

    if value.is_null() {
        return Ok(Document::default());
    }

    serde_yaml::from_value(value).map_err(|source| ConfigError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns the path node when `node` is a mapping whose sole entry is
/// `include`.
fn as_include(node: &Value) -> Option<&Value> {
    let mapping = node.as_mapping()?;
    if mapping.len() != 1 {
        return None;
    }
    let (key, value) = mapping.iter().next()?;
    if key.as_str() == Some("include") {
        Some(value)
    } else {
        None
    }
}

/// Recursively replaces `include` nodes with the content of the named
/// files. Sequence-element includes splice when the included document is
/// itself a sequence.
fn expand_includes(
    node: &mut Value,
    base_dir: &Path,
    watch: &mut WatchList,
    depth: usize,
) -> ConfigResult<()> {
    if let Some(path_value) = as_include(node) {
        let path_value = path_value.clone();
        *node = load_include(&path_value, base_dir, watch, depth)?;
        return Ok(());
    }

    match node {
        Value::Mapping(mapping) => {
            for (_key, value) in mapping.iter_mut() {
                expand_includes(value, base_dir, watch, depth)?;
            }
        }
        Value::Sequence(items) => {
            let mut expanded = Vec::with_capacity(items.len());
            for mut item in std::mem::take(items) {
                let splice = as_include(&item).is_some();
                expand_includes(&mut item, base_dir, watch, depth)?;
                if splice {
                    if let Value::Sequence(children) = item {
                        expanded.extend(children);
                        continue;
                    }
                }
                expanded.push(item);
            }
            *items = expanded;
        }
        Value::Tagged(tagged) => expand_includes(&mut tagged.value, base_dir, watch, depth)?,
        _ => {}
    }
    Ok(())
}

/// Loads and expands one included file.
fn load_include(
    path_value: &Value,
    base_dir: &Path,
    watch: &mut WatchList,
    depth: usize,
) -> ConfigResult<Value> {
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(ConfigError::Include(format!(
            "include depth exceeds {MAX_INCLUDE_DEPTH}; include cycle suspected"
        )));
    }

    let relative = path_value
        .as_str()
        .ok_or_else(|| ConfigError::Include("include path must be a string".into()))?;

    let include_path = resolve_path(Path::new(relative), base_dir);
    watch.add(&include_path);

    let data = fs::read_to_string(&include_path).map_err(|source| ConfigError::Read {
        path: include_path.clone(),
        source,
    })?;

    let mut value: Value = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
        path: include_path.clone(),
        source,
    })?;

    let include_dir = include_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    expand_includes(&mut value, include_dir, watch, depth + 1)?;
    debug!(path = %include_path.display(), depth, "expanded include");

    Ok(value)
}

fn apply_overrides(proxy: &mut ProxyConfig, overrides: &CliOverrides, watch: &mut WatchList) {
    if let Some(listen) = &overrides.listen {
        proxy.listen = listen.clone();
    }
    if let Some(target) = &overrides.target {
        proxy.target = target.clone();
    }
    if let Some(timeout) = overrides.timeout {
        proxy.timeout = Some(timeout);
    }
    if let Some(cert) = &overrides.ssl_cert {
        watch.add(cert);
        proxy.ssl_cert = Some(cert.clone());
    }
    if let Some(key) = &overrides.ssl_key {
        watch.add(key);
        proxy.ssl_key = Some(key.clone());
    }
    if overrides.debug {
        proxy.debug = true;
    }
}

/// Resolves `path` relative to `base_dir` unless it is already absolute.
pub fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
