//! Scope predicate evaluation.
//!
//! A scope is a JSON object read as an AND of constraints; missing keys are
//! unconstrained and an empty object matches every resource.
//!
//! Reserved keys test the resource string itself:
//! - `resource`: exact match
//! - `resource_prefix`: prefix match
//! - `resource_pattern`: glob-lite match (`*` matches any run of characters)
//!
//! Every other key tests the request context: the context value must equal
//! the constraint (string compare for strings, structural equality
//! otherwise). A JSON array constraint means "any of".

use serde_json::Value;
use std::collections::BTreeMap;

/// Evaluate a scope predicate against a resource and request context.
pub fn scope_matches(
    scope: &Value,
    resource: Option<&str>,
    context: &BTreeMap<String, Value>,
) -> bool {
    let constraints = match scope {
        Value::Null => return true,
        Value::Object(map) if map.is_empty() => return true,
        Value::Object(map) => map,
        // A malformed scope never matches; granting code validates shape.
        _ => return false,
    };

    for (key, constraint) in constraints {
        let satisfied = match key.as_str() {
            "resource" => resource.map_or(false, |resource| value_matches(constraint, resource)),
            "resource_prefix" => resource.map_or(false, |resource| {
                any_str(constraint, |prefix| resource.starts_with(prefix))
            }),
            "resource_pattern" => resource.map_or(false, |resource| {
                any_str(constraint, |pattern| glob_matches(pattern, resource))
            }),
            _ => context
                .get(key)
                .map_or(false, |value| context_matches(constraint, value)),
        };
        if !satisfied {
            return false;
        }
    }
    true
}

fn value_matches(constraint: &Value, resource: &str) -> bool {
    any_str(constraint, |expected| expected == resource)
}

fn any_str(constraint: &Value, predicate: impl Fn(&str) -> bool) -> bool {
    match constraint {
        Value::String(expected) => predicate(expected),
        Value::Array(options) => options
            .iter()
            .filter_map(|option| option.as_str())
            .any(predicate),
        _ => false,
    }
}

fn context_matches(constraint: &Value, value: &Value) -> bool {
    match constraint {
        Value::Array(options) => options.iter().any(|option| option == value),
        other => other == value,
    }
}

/// Match `pattern` against `input` where `*` matches any run of characters.
pub fn glob_matches(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }

    let mut remainder = input;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(at) => remainder = &remainder[at + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with `*`, any remainder is fine.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_scope_matches_all() {
        assert!(scope_matches(&json!({}), Some("anything"), &BTreeMap::new()));
        assert!(scope_matches(&Value::Null, None, &BTreeMap::new()));
    }

    #[test]
    fn exact_resource_constraint() {
        let scope = json!({"resource": "db://customers"});
        assert!(scope_matches(&scope, Some("db://customers"), &BTreeMap::new()));
        assert!(!scope_matches(&scope, Some("db://orders"), &BTreeMap::new()));
        assert!(!scope_matches(&scope, None, &BTreeMap::new()));
    }

    #[test]
    fn prefix_and_pattern_constraints() {
        let scope = json!({"resource_prefix": "s3://reports/"});
        assert!(scope_matches(&scope, Some("s3://reports/2026/q1.csv"), &BTreeMap::new()));
        assert!(!scope_matches(&scope, Some("s3://secrets/keys"), &BTreeMap::new()));

        let scope = json!({"resource_pattern": "db://*/readonly"});
        assert!(scope_matches(&scope, Some("db://replica-2/readonly"), &BTreeMap::new()));
        assert!(!scope_matches(&scope, Some("db://replica-2/admin"), &BTreeMap::new()));
    }

    #[test]
    fn context_constraints_and_any_of() {
        let scope = json!({"environment": ["staging", "dev"]});
        let mut context = BTreeMap::new();
        context.insert("environment".to_string(), json!("staging"));
        assert!(scope_matches(&scope, None, &context));

        context.insert("environment".to_string(), json!("production"));
        assert!(!scope_matches(&scope, None, &context));

        // Missing context key fails the constraint.
        assert!(!scope_matches(&scope, None, &BTreeMap::new()));
    }

    #[test]
    fn all_constraints_must_hold() {
        let scope = json!({
            "resource_prefix": "db://reporting",
            "environment": "staging"
        });
        let mut context = BTreeMap::new();
        context.insert("environment".to_string(), json!("staging"));
        assert!(scope_matches(&scope, Some("db://reporting/x"), &context));
        assert!(!scope_matches(&scope, Some("db://billing/x"), &context));
    }
}
