//! Canonical JSON serialization for signed payloads.
//!
//! Rules: keys sorted lexicographically, `": "` and `", "` separators, no
//! HTML escaping, `null` for an absent resource, `{}` for an empty context.
//! The output must be byte-identical across implementations.

use crate::CryptoError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;

/// Writes objects and arrays with `", "` / `": "` separators.
///
/// Key ordering comes from `serde_json::Map` itself, which is backed by a
/// BTreeMap and therefore iterates keys lexicographically.
struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }
}

/// Serialize a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(256);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter);
    serde::Serialize::serialize(&sort_value(value), &mut serializer)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?;
    Ok(out)
}

// Rebuilds nested objects into serde_json's sorted map so arbitrary input
// (including maps built with preserve_order upstream) canonicalizes the same.
fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let ordered: BTreeMap<&String, &Value> = map.iter().collect();
            for (key, inner) in ordered {
                sorted.insert(key.clone(), sort_value(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// The signed message for an action-verification request.
///
/// Exactly the keys `{action_type, agent_id, context, resource, timestamp}`;
/// `risk_level` never participates (it travels inside `context` if the agent
/// wants it signed). `timestamp` is the raw RFC3339 string from the wire.
pub fn canonical_request_payload(
    agent_id: &str,
    action_type: &str,
    resource: Option<&str>,
    context: &BTreeMap<String, Value>,
    timestamp: &str,
) -> Result<Vec<u8>, CryptoError> {
    let mut root = Map::new();
    root.insert("action_type".to_string(), Value::String(action_type.to_string()));
    root.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    root.insert(
        "context".to_string(),
        Value::Object(context.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    root.insert(
        "resource".to_string(),
        match resource {
            None | Some("") => Value::Null,
            Some(resource) => Value::String(resource.to_string()),
        },
    );
    root.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    canonical_json(&Value::Object(root))
}

/// The signed message for an MCP attestation.
pub fn canonical_attestation_payload(
    mcp_server_id: &str,
    agent_id: &str,
    capabilities_found: &[String],
    connection_latency_ms: i64,
    signed_at: DateTime<Utc>,
) -> Result<Vec<u8>, CryptoError> {
    let mut root = Map::new();
    root.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    root.insert(
        "capabilities_found".to_string(),
        Value::Array(
            capabilities_found
                .iter()
                .map(|capability| Value::String(capability.clone()))
                .collect(),
        ),
    );
    root.insert(
        "connection_latency_ms".to_string(),
        Value::Number(connection_latency_ms.into()),
    );
    root.insert("mcp_server_id".to_string(), Value::String(mcp_server_id.to_string()));
    root.insert(
        "signed_at".to_string(),
        Value::String(signed_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    canonical_json(&Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn request_payload_matches_pinned_bytes() {
        let mut context = BTreeMap::new();
        context.insert("risk_level".to_string(), json!("low"));
        let payload = canonical_request_payload(
            "agent-1",
            "read_database",
            Some("SELECT id FROM customers LIMIT 10"),
            &context,
            "2026-01-15T12:00:00Z",
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"action_type": "read_database", "agent_id": "agent-1", "context": {"risk_level": "low"}, "resource": "SELECT id FROM customers LIMIT 10", "timestamp": "2026-01-15T12:00:00Z"}"#
        );
    }

    #[test]
    fn empty_resource_and_context_canonicalize_to_null_and_empty_object() {
        let payload = canonical_request_payload(
            "agent-1",
            "read_database",
            Some(""),
            &BTreeMap::new(),
            "2026-01-15T12:00:00Z",
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"action_type": "read_database", "agent_id": "agent-1", "context": {}, "resource": null, "timestamp": "2026-01-15T12:00:00Z"}"#
        );
    }

    #[test]
    fn nested_context_keys_are_sorted() {
        let mut context = BTreeMap::new();
        context.insert("zebra".to_string(), json!({"b": 2, "a": 1}));
        context.insert("alpha".to_string(), json!(true));
        let payload =
            canonical_request_payload("a", "read_x", None, &context, "2026-01-01T00:00:00Z")
                .unwrap();
        let text = String::from_utf8(payload).unwrap();
        let alpha = text.find("\"alpha\"").unwrap();
        let zebra = text.find("\"zebra\"").unwrap();
        assert!(alpha < zebra);
        assert!(text.contains(r#"{"a": 1, "b": 2}"#));
    }

    #[test]
    fn html_characters_are_not_escaped() {
        let mut context = BTreeMap::new();
        context.insert("query".to_string(), json!("a < b && c > d"));
        let payload =
            canonical_request_payload("a", "read_x", None, &context, "2026-01-01T00:00:00Z")
                .unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("a < b && c > d"));
    }

    proptest! {
        // Serializing the same logical request twice must give identical bytes.
        #[test]
        fn canonicalization_is_deterministic(
            action in "[a-z_]{1,24}",
            agent in "[a-z0-9-]{1,24}",
            resource in proptest::option::of("[ -~]{0,64}"),
            keys in proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..6),
        ) {
            let context: BTreeMap<String, Value> = keys
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let first = canonical_request_payload(
                &agent, &action, resource.as_deref(), &context, "2026-01-01T00:00:00Z",
            ).unwrap();
            let second = canonical_request_payload(
                &agent, &action, resource.as_deref(), &context, "2026-01-01T00:00:00Z",
            ).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
