//! Deterministic JSON serialization used to build the bytes that get signed
//! (spec §4.1). Object keys are sorted ascending, numbers must be finite,
//! and the result is byte-for-byte reproducible for equal values — this is
//! what P1 (`canonical(parse(canonical(x))) = canonical(x)`) requires.

use crate::error::NodeError;
use serde_json::Value;
use std::fmt::Write as _;

pub fn canonical_json(value: &Value) -> Result<String, NodeError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), NodeError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(NodeError::Validation(
                        "non-finite numbers are not canonicalizable".into(),
                    ));
                }
            }
            write!(out, "{n}").map_err(|e| NodeError::Internal(e.to_string()))?;
        }
        Value::String(s) => {
            write_json_string(s, out);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Canonicalizes an envelope-shaped object with `sig` removed, the input to
/// both signing and verification (spec §4.1, §4.3).
pub fn canonical_without_sig(value: &Value) -> Result<String, NodeError> {
    let mut stripped = value.clone();
    if let Value::Object(map) = &mut stripped {
        map.remove("sig");
    }
    canonical_json(&stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let a = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let out = canonical_json(&a).unwrap();
        assert_eq!(out, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn is_idempotent_round_trip() {
        let a = json!({"nonce": "abc", "ts": 12345, "data": {"postId": "P1"}, "arr": [3,1,2]});
        let first = canonical_json(&a).unwrap();
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        let second = canonical_json(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_non_finite_numbers() {
        // f64::NAN cannot be represented by serde_json::Number directly via json!()
        // but can be constructed through from_f64 returning None; simulate the
        // rejection path by constructing via Number::from_f64 and unwrapping the Option.
        assert!(serde_json::Number::from_f64(f64::NAN).is_none());
    }

    #[test]
    fn strips_sig_before_canonicalizing() {
        let a = json!({"action": "like", "sig": "deadbeef", "did": "did:key:x"});
        let out = canonical_without_sig(&a).unwrap();
        assert_eq!(out, r#"{"action":"like","did":"did:key:x"}"#);
    }
}
