//! Rule matching.
//!
//! Returns every rule whose method and path patterns match, in
//! configuration order. All matches are returned because rules compose:
//! each matching rule's request operations run against the same body
//! map, and the last match owns the response transformation.

use tracing::debug;

use crate::config::Rule;

/// Returns the ordered sublist of rules matching `method` and `path`,
/// with their original indices.
pub fn matching_rules<'a>(rules: &'a [Rule], method: &str, path: &str) -> Vec<(usize, &'a Rule)> {
    let mut matched = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        let method_match = rule.methods.matches(method);
        let path_match = rule.paths.matches(path);
        debug!(
            index,
            methods = ?rule.methods.sources(),
            paths = ?rule.paths.sources(),
            method_match,
            path_match,
            "evaluated rule"
        );
        if method_match && path_match {
            matched.push((index, rule));
        }
    }
    debug!(method, path, matched = matched.len(), total = rules.len(), "rule matching done");
    matched
}
