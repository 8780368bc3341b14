//! Template compilation and helper functions.
//!
//! Every operation with a `template` is compiled at load time into a
//! shared environment; execution receives the current body map as the
//! template context and must produce a JSON object. The helper set is
//! part of the configuration contract: user configs depend on these
//! names and semantics.
//!
//! Instants are modelled as integer seconds since the Unix epoch:
//! `now()` produces one, `isoTime`/`unixTime` consume one.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use minijinja::value::{Rest, Value, ValueKind};
use minijinja::Environment;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, JsonMap};
use crate::error::{ConfigError, ConfigResult};

/// Which operation list a template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

impl Phase {
    /// Short name used in template identifiers and diagnostics.
    pub fn key(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

/// Stable identifier for the template of one operation.
pub fn template_name(proxy: usize, rule: usize, phase: Phase, op: usize) -> String {
    format!("proxy{}_rule{}_{}_op{}", proxy, rule, phase.key(), op)
}

/// All compiled templates of one configuration.
pub struct TemplateSet {
    env: Environment<'static>,
}

impl TemplateSet {
    /// Compiles every template in `config`. A parse failure names the
    /// rule index and operation position.
    pub fn compile(config: &Config) -> ConfigResult<Self> {
        let mut env = base_environment();

        for (proxy_index, proxy) in config.proxies.iter().enumerate() {
            for (rule_index, rule) in proxy.rules.iter().enumerate() {
                let phases = [
                    (Phase::Request, &rule.on_request),
                    (Phase::Response, &rule.on_response),
                ];
                for (phase, ops) in phases {
                    for (op_index, op) in ops.iter().enumerate() {
                        let Some(source) = &op.template else {
                            continue;
                        };
                        env.add_template_owned(
                            template_name(proxy_index, rule_index, phase, op_index),
                            source.clone(),
                        )
                        .map_err(|source| ConfigError::Template {
                            rule: rule_index,
                            operation: op_index,
                            phase: phase.key(),
                            source,
                        })?;
                    }
                }
            }
        }

        Ok(Self { env })
    }

    /// An empty set with only the helper functions registered.
    pub fn empty() -> Self {
        Self {
            env: base_environment(),
        }
    }

    /// Renders one template with the body map as context.
    pub fn render(&self, name: &str, body: &JsonMap) -> Result<String, minijinja::Error> {
        let template = self.env.get_template(name)?;
        template.render(Value::from_serialize(body))
    }
}

impl fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateSet").finish_non_exhaustive()
    }
}

/// Builds an environment with the full helper set registered.
fn base_environment() -> Environment<'static> {
    let mut env = Environment::new();

    env.add_function("toJson", to_json);
    env.add_function("default", default_value);
    env.add_function("now", now);
    env.add_function("isoTime", iso_time);
    env.add_function("unixTime", unix_time);
    env.add_function("uuid", uuid_v4);
    env.add_function("index", index);
    env.add_function("add", add);
    env.add_function("mul", mul);
    env.add_function("dict", dict);
    env.add_function("kindIs", kind_is);

    env
}

/// `toJson(value)` — JSON-encode any value; `null` on failure.
fn to_json(value: Value) -> String {
    match serde_json::to_string(&value) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "toJson failed");
            "null".to_string()
        }
    }
}

/// `default(fallback, value)` — fallback when `value` is nil, empty
/// string, zero number, or false.
fn default_value(fallback: Value, value: Value) -> Value {
    if is_zero_value(&value) {
        fallback
    } else {
        value
    }
}

fn is_zero_value(value: &Value) -> bool {
    if value.is_none() || value.is_undefined() {
        return true;
    }
    match value.kind() {
        ValueKind::String => value.as_str().is_some_and(|s| s.is_empty()),
        ValueKind::Number => to_number(value) == 0.0,
        ValueKind::Bool => !value.is_true(),
        _ => false,
    }
}

/// `now()` — current instant as integer Unix seconds.
fn now() -> i64 {
    Utc::now().timestamp()
}

/// `isoTime(instant)` — RFC 3339 rendering of an instant.
fn iso_time(instant: Value) -> Result<String, minijinja::Error> {
    let secs = to_int(&instant).ok_or_else(|| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            "isoTime expects an instant (integer seconds)",
        )
    })?;
    let time = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            "isoTime instant out of range",
        )
    })?;
    Ok(time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// `unixTime(instant)` — integer seconds since the Unix epoch.
fn unix_time(instant: Value) -> Result<i64, minijinja::Error> {
    to_int(&instant).ok_or_else(|| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            "unixTime expects an instant (integer seconds)",
        )
    })
}

/// `uuid()` — a version-4 UUID from the OS random source.
fn uuid_v4() -> String {
    Uuid::new_v4().to_string()
}

/// `index(container, key, ...)` — walk array indices and map keys;
/// missing or out-of-range steps yield nil.
fn index(container: Value, path: Rest<Value>) -> Value {
    let mut current = container;
    for step in path.0.iter() {
        current = match current.kind() {
            ValueKind::Seq => {
                let Some(position) = to_int(step) else {
                    warn!(step = %step, "index: invalid array index");
                    return Value::from(());
                };
                match current.get_item(&Value::from(position)) {
                    Ok(item) if !item.is_undefined() => item,
                    _ => {
                        warn!(position, "index: array position out of range");
                        return Value::from(());
                    }
                }
            }
            ValueKind::Map => {
                let Some(key) = step.as_str() else {
                    warn!(step = %step, "index: non-string key for map");
                    return Value::from(());
                };
                match current.get_item(step) {
                    Ok(item) if !item.is_undefined() => item,
                    _ => {
                        warn!(key, "index: key not found in map");
                        return Value::from(());
                    }
                }
            }
            other => {
                warn!(kind = ?other, "index: cannot index into value");
                return Value::from(());
            }
        };
    }
    current
}

/// `add(a, b)` with lenient numeric coercion from strings.
fn add(a: Value, b: Value) -> Value {
    number_value(to_number(&a) + to_number(&b))
}

/// `mul(a, b)` with lenient numeric coercion from strings.
fn mul(a: Value, b: Value) -> Value {
    number_value(to_number(&a) * to_number(&b))
}

/// Renders whole results as integers so template output stays natural
/// JSON.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// `dict(k1, v1, k2, v2, ...)` — build a mapping; odd arity yields an
/// empty map, non-string keys are skipped.
fn dict(pairs: Rest<Value>) -> Value {
    if pairs.0.len() % 2 != 0 {
        warn!(arity = pairs.0.len(), "dict: odd number of arguments");
        return Value::from_iter(Vec::<(String, Value)>::new());
    }
    let mut entries = Vec::with_capacity(pairs.0.len() / 2);
    for chunk in pairs.0.chunks(2) {
        let Some(key) = chunk[0].as_str() else {
            warn!(key = %chunk[0], "dict: skipping non-string key");
            continue;
        };
        entries.push((key.to_string(), chunk[1].clone()));
    }
    Value::from_iter(entries)
}

/// `kindIs(kind, value)` — type check by kind name.
fn kind_is(kind: String, value: Value) -> bool {
    match kind.as_str() {
        "string" => value.kind() == ValueKind::String,
        "number" | "int" | "float" => value.kind() == ValueKind::Number,
        "bool" => value.kind() == ValueKind::Bool,
        "slice" | "array" => value.kind() == ValueKind::Seq,
        "map" => value.kind() == ValueKind::Map,
        "nil" => value.is_none() || value.is_undefined(),
        other => {
            warn!(kind = other, "kindIs: unknown kind");
            false
        }
    }
}

/// Lenient numeric coercion: numbers pass through, numeric strings
/// parse, everything else is zero.
fn to_number(value: &Value) -> f64 {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Ok(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Number(n)) => {
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
        }
        Ok(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}
