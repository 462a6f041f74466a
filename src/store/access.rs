//! Provides the value level helpers of the document store.
//!
//! Three concerns live here as they are shared by the query engine and the store itself:
//! resolving dotted paths into nested records, removing private fields from outgoing
//! values and coercing values to the string form used by filter comparisons.
use serde_json::{Map, Value};

/// Marks fields and collections as private.
///
/// Keys starting with this prefix are kept in the persisted document but are stripped from
/// every value leaving the store. The same prefix marks the control parameters of the query
/// engine, so the `_` namespace is reserved throughout.
pub const PRIVATE_PREFIX: char = '_';

/// Determines if the given key denotes a private field or collection.
pub fn is_private(key: &str) -> bool {
    key.starts_with(PRIVATE_PREFIX)
}

/// Resolves a dotted path within the given record.
///
/// Each segment descends into an object field. The lookup fails (returning **None**) if a
/// segment is missing or an intermediate value is not an object. Note that a present
/// **null** is a successful lookup and therefore distinct from a missing field.
///
/// # Examples
///
/// ```
/// # use serde_json::json;
/// # use shdb::store::access::resolve;
/// let record = json!({ "name": { "first": "Anna", "last": null } });
///
/// assert_eq!(resolve(&record, "name.first"), Some(&json!("Anna")));
/// assert_eq!(resolve(&record, "name.last"), Some(&serde_json::Value::Null));
/// assert_eq!(resolve(&record, "name.middle"), None);
/// assert_eq!(resolve(&record, "name.first.x"), None);
/// ```
pub fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}

/// Returns a deep copy of the given value with all private fields removed.
///
/// Objects are rebuilt without keys starting with the private prefix, arrays recurse into
/// their elements and scalars pass through unchanged. The input is never modified.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (key, value) in map {
                if !is_private(key) {
                    let _ = result.insert(key.clone(), redact(value));
                }
            }
            Value::Object(result)
        }
        Value::Array(values) => Value::Array(values.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Coerces a value to the string form used when comparing against filter parameters.
///
/// Strings yield their raw contents (no quotes), everything else yields its JSON
/// rendering. Thus the filter value `42` matches both the number `42` and the string
/// `"42"`, whereas `true` only matches the boolean or the string `"true"`.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_finds_top_level_and_nested_fields() {
        let record = json!({ "id": 1, "address": { "city": { "name": "Kiel" } } });

        assert_eq!(resolve(&record, "id"), Some(&json!(1)));
        assert_eq!(resolve(&record, "address.city.name"), Some(&json!("Kiel")));
    }

    #[test]
    fn resolve_distinguishes_null_from_missing() {
        let record = json!({ "value": null });

        assert_eq!(resolve(&record, "value"), Some(&Value::Null));
        assert_eq!(resolve(&record, "other"), None);
    }

    #[test]
    fn resolve_rejects_non_object_intermediates() {
        let record = json!({ "tags": ["a", "b"], "name": "test" });

        assert_eq!(resolve(&record, "tags.0"), None);
        assert_eq!(resolve(&record, "name.length"), None);
    }

    #[test]
    fn redact_strips_private_fields_recursively() {
        let record = json!({
            "id": 1,
            "_token": "hunter2",
            "profile": { "_internal": true, "name": "Anna" },
            "friends": [ { "id": 2, "_note": "x" } ]
        });

        let expected = json!({
            "id": 1,
            "profile": { "name": "Anna" },
            "friends": [ { "id": 2 } ]
        });

        assert_eq!(redact(&record), expected);
    }

    #[test]
    fn redact_leaves_input_untouched_and_is_idempotent() {
        let record = json!({ "_secret": 1, "id": 2 });
        let redacted = redact(&record);

        assert_eq!(record, json!({ "_secret": 1, "id": 2 }));
        assert_eq!(redact(&redacted), redacted);
    }

    #[test]
    fn stringify_renders_scalars_and_containers() {
        assert_eq!(stringify(&json!("plain")), "plain");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&Value::Null), "null");
        assert_eq!(stringify(&json!([1, 2])), "[1,2]");
    }
}
