//! The operation interpreter.
//!
//! Executes one rule's ordered operation list against a mutable JSON
//! body map. Per operation: evaluate header and body conditions, run
//! the template (replace-all semantics), then `default`, `merge`,
//! `delete`, and finally honor `stop`. The returned diff records every
//! key an operation added, replaced, or removed (`"<deleted>"`).
//!
//! Condition ordering detail: body values are stringified once per
//! invocation, so operations within one rule match against the body as
//! it stood when the rule started; rules observe each other's writes
//! because the body map is shared across rules.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{JsonMap, Operation};
use crate::template::{template_name, Phase, TemplateSet};

/// Sentinel recorded in the applied diff for removed keys.
pub const DELETED: &str = "<deleted>";

/// Identifies which rule's operations are executing, for template
/// lookup and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct OpScope<'a> {
    pub templates: &'a TemplateSet,
    pub proxy_index: usize,
    pub rule_index: usize,
    pub phase: Phase,
}

impl<'a> OpScope<'a> {
    pub fn new(
        templates: &'a TemplateSet,
        proxy_index: usize,
        rule_index: usize,
        phase: Phase,
    ) -> Self {
        Self {
            templates,
            proxy_index,
            rule_index,
            phase,
        }
    }
}

/// Applies `ops` in order against `body`, using `headers` for
/// condition matching.
///
/// Returns whether anything applied and the accumulated diff.
pub fn apply_operations(
    body: &mut JsonMap,
    headers: &HashMap<String, String>,
    ops: &[Operation],
    scope: OpScope<'_>,
) -> (bool, JsonMap) {
    let mut applied = JsonMap::new();
    let mut any_applied = false;

    // Stringified snapshot for match_body; see module docs.
    let body_strings: HashMap<String, String> = body
        .iter()
        .map(|(key, value)| (key.clone(), value_string(value)))
        .collect();

    for (op_index, op) in ops.iter().enumerate() {
        if !matches_body(op, &body_strings, scope, op_index)
            || !matches_headers(op, headers, scope, op_index)
        {
            continue;
        }

        let mut op_changes = JsonMap::new();

        if op.template.is_some() {
            let name = template_name(scope.proxy_index, scope.rule_index, scope.phase, op_index);
            if execute_template(body, &name, scope.templates) {
                for (key, value) in body.iter() {
                    applied.insert(key.clone(), value.clone());
                    op_changes.insert(key.clone(), value.clone());
                }
                any_applied = true;
            }
        }

        // Defaults precede merges so a rule can ensure a field exists
        // while still letting merge overwrite; deletes run last so a
        // value set in the same operation is not immediately erased.
        for (key, value) in &op.default {
            if !body.contains_key(key) {
                body.insert(key.clone(), value.clone());
                op_changes.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &op.merge {
            body.insert(key.clone(), value.clone());
            op_changes.insert(key.clone(), value.clone());
        }
        for key in &op.delete {
            if body.remove(key).is_some() {
                op_changes.insert(key.clone(), Value::String(DELETED.to_string()));
            }
        }

        if !op_changes.is_empty() {
            any_applied = true;
            for (key, value) in &op_changes {
                applied.insert(key.clone(), value.clone());
            }
            let changes_value = Value::Object(op_changes);
            debug!(
                rule = scope.rule_index,
                op = op_index,
                phase = scope.phase.key(),
                changes = %changes_value,
                "operation applied"
            );
        }

        if op.stop {
            debug!(
                rule = scope.rule_index,
                op = op_index,
                "stop flag set; halting operation processing"
            );
            break;
        }
    }

    (any_applied, applied)
}

fn matches_body(
    op: &Operation,
    body_strings: &HashMap<String, String>,
    scope: OpScope<'_>,
    op_index: usize,
) -> bool {
    for (key, pattern) in &op.match_body {
        let Some(actual) = body_strings.get(key) else {
            debug!(
                rule = scope.rule_index,
                op = op_index,
                key = %key,
                "operation skipped: body key not found"
            );
            return false;
        };
        if !pattern.matches(actual) {
            debug!(
                rule = scope.rule_index,
                op = op_index,
                key = %key,
                value = %actual,
                patterns = ?pattern.sources(),
                "operation skipped: body value does not match"
            );
            return false;
        }
    }
    true
}

fn matches_headers(
    op: &Operation,
    headers: &HashMap<String, String>,
    scope: OpScope<'_>,
    op_index: usize,
) -> bool {
    for (key, pattern) in &op.match_headers {
        let Some(actual) = header_value(headers, key) else {
            debug!(
                rule = scope.rule_index,
                op = op_index,
                key = %key,
                "operation skipped: header not found"
            );
            return false;
        };
        if !pattern.matches(actual) {
            debug!(
                rule = scope.rule_index,
                op = op_index,
                key = %key,
                value = %actual,
                "operation skipped: header value does not match"
            );
            return false;
        }
    }
    true
}

/// Header names compare case-insensitively, per HTTP semantics.
fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Renders the template and replaces the body contents with its output.
///
/// Output that is not a JSON object leaves the body untouched.
fn execute_template(body: &mut JsonMap, name: &str, templates: &TemplateSet) -> bool {
    let rendered = match templates.render(name, body) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!(template = name, error = %err, "template execution failed");
            return false;
        }
    };

    match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Object(result)) => {
            body.clear();
            body.extend(result);
            true
        }
        Ok(_) => {
            warn!(
                template = name,
                output = %rendered,
                "template output is not a JSON object"
            );
            false
        }
        Err(err) => {
            warn!(
                template = name,
                error = %err,
                output = %rendered,
                "template output is not valid JSON"
            );
            false
        }
    }
}

/// The canonical textual form used for body-value matching: strings
/// verbatim, everything else compact JSON.
fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
