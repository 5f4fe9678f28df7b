//! Canonical JSON serialization.
//!
//! The hash chain and the learning-ledger pattern hashes are only stable if
//! every producer serializes identically. The canonical form:
//!
//! - object keys sorted lexicographically (byte order), recursively
//! - arrays keep their order, elements canonicalized recursively
//! - non-finite numbers normalize to `null`
//! - integers outside the f64-safe range (|n| >= 2^53) serialize as decimal
//!   strings, so the form survives implementations that read numbers as
//!   doubles
//! - strings and finite numbers use serde_json's standard formatting
//!
//! No whitespace is emitted.

use serde_json::Value as JsonValue;

/// Largest integer magnitude a double represents exactly (2^53).
const F64_SAFE: u64 = 1 << 53;

/// Serialize a value into its canonical string form.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => write_number(n, out),
        JsonValue::String(s) => write_string(s, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(u) = n.as_u64() {
        if u >= F64_SAFE {
            write_string(&u.to_string(), out);
        } else {
            out.push_str(&u.to_string());
        }
        return;
    }
    if let Some(i) = n.as_i64() {
        if i.unsigned_abs() >= F64_SAFE {
            write_string(&i.to_string(), out);
        } else {
            out.push_str(&i.to_string());
        }
        return;
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            // serde_json's own float formatting (ryu) for stability.
            out.push_str(&JsonValue::from(f).to_string());
        }
        _ => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json performs the escaping; a &str never fails to serialize.
    out.push_str(&JsonValue::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_deeply() {
        let v = json!({"b": 1, "a": {"z": true, "m": [{"q": 1, "p": 2}]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"m":[{"p":2,"q":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn arrays_keep_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_json(&v), "[3,1,2]");
    }

    #[test]
    fn big_integers_stringify() {
        let v = json!({"n": 9_007_199_254_740_993_u64});
        assert_eq!(canonical_json(&v), r#"{"n":"9007199254740993"}"#);

        let v = json!({"n": -9_007_199_254_740_993_i64});
        assert_eq!(canonical_json(&v), r#"{"n":"-9007199254740993"}"#);

        // Safe-range integers stay numbers.
        let v = json!({"n": 9_007_199_254_740_991_u64});
        assert_eq!(canonical_json(&v), r#"{"n":9007199254740991}"#);
    }

    #[test]
    fn strings_escape_like_serde() {
        let v = json!("line\nbreak \"quoted\"");
        assert_eq!(canonical_json(&v), r#""line\nbreak \"quoted\"""#);
    }

    #[test]
    fn identical_values_identical_output() {
        let a = json!({"x": [1, 2, {"k": "v"}], "y": null});
        let b: JsonValue =
            serde_json::from_str(r#"{"y": null, "x": [1, 2, {"k": "v"}]}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    // Property corpus: canonical output is deterministic, parseable, and
    // key-order independent.

    fn arb_json(depth: u32) -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::Bool),
            any::<i64>().prop_map(|i| json!(i)),
            "[a-zA-Z0-9 _.-]{0,24}".prop_map(JsonValue::String),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(JsonValue::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_is_deterministic(v in arb_json(3)) {
            prop_assert_eq!(canonical_json(&v), canonical_json(&v));
        }

        #[test]
        fn canonical_round_trips_structure(v in arb_json(3)) {
            let s = canonical_json(&v);
            let reparsed: JsonValue = serde_json::from_str(&s).unwrap();
            // Canonicalizing the reparse is a fixpoint.
            prop_assert_eq!(canonical_json(&reparsed), s);
        }
    }
}
