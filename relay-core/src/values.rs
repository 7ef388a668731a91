//! Value codec: bidirectional mapping between nested request structs and
//! flat dotted key/value pairs (used by query strings, path parameters,
//! and event payloads), plus JSON body encode/decode.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Failure;

/// A flattened struct: dotted paths to their string representation.
///
/// `BTreeMap` (rather than `HashMap`) gives deterministic iteration order,
/// which matters for [`decode_values`]'s field-at-a-time loose decoding.
pub type FlatMap = BTreeMap<String, String>;

/// Encode a `Serialize` value into a flat dotted-path map.
///
/// Field rename and skip directives are honored for free because encoding
/// goes through `serde_json::to_value`, which already applies
/// `#[serde(rename = ..)]` / `#[serde(skip)]` the same way JSON
/// serialization would. Custom string marshallers (a type with a
/// hand-written `Serialize` that emits a bare string) fall out of the same
/// mechanism: the leaf is already a JSON string with no surrounding quotes
/// to strip.
pub fn encode_values<T: Serialize>(value: &T) -> Result<FlatMap, Failure> {
    let json = serde_json::to_value(value)?;
    let mut out = FlatMap::new();
    flatten("", &json, &mut out);
    Ok(out)
}

/// Flatten an already-constructed JSON value (e.g. a registered handler's
/// type-erased response) without re-deriving it from a `Serialize` type.
pub fn flatten_value(value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    flatten("", value, &mut out);
    out
}

fn flatten(prefix: &str, value: &Value, out: &mut FlatMap) {
    match value {
        Value::Object(map) => {
            if map.is_empty() && !prefix.is_empty() {
                return;
            }
            for (key, val) in map {
                let path = join(prefix, key);
                flatten(&path, val, out);
            }
        }
        Value::Null => {
            // Fields that serialize to null are treated as omitted.
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::Array(_) => {
            // Arrays have no natural dotted-path decomposition; carry them
            // as an opaque JSON fragment, same as the body codec would.
            out.insert(prefix.to_string(), value.to_string());
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Guess the natural JSON scalar for a raw string value: `true`/`false`
/// become booleans, syntactically numeric strings become numbers, bodies
/// that look like a JSON object/array are parsed structurally, everything
/// else stays a string.
fn guess_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(f) {
            return Value::Number(num);
        }
    }
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            return parsed;
        }
    }
    Value::String(raw.to_string())
}

fn set_path(tree: &mut Value, dotted: &str, leaf: Value) {
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let mut cursor = tree;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        let obj = cursor.as_object_mut().expect("cursor is always an object");
        if parts.peek().is_none() {
            obj.insert(part.to_string(), leaf);
            return;
        }
        let entry = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cursor = entry;
    }
}

/// Insert `leaf` under `key` verbatim, with no dot-splitting. This is the
/// counterpart to [`flatten`]'s leaf case: a `#[serde(rename = "A.B")]`
/// field serializes to a single flat top-level key literally named
/// `"A.B"`, never a nested `{"A":{"B":..}}` tree, so decoding it has to
/// write the same literal key back rather than infer a hierarchy from it.
fn set_literal(tree: &mut Value, key: &str, leaf: Value) {
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    tree.as_object_mut()
        .expect("tree coerced to object above")
        .insert(key.to_string(), leaf);
}

/// Decode a flat dotted-path map onto a fresh `T::default()`.
///
/// Two shapes of key are possible, mirroring the two ways [`flatten`] can
/// have produced one: a key that is itself a literal top-level field name
/// of `T` (including one containing dots, via `#[serde(rename = "A.B")]`),
/// or a key that is a genuine dotted path into nested structs. The default
/// tree already tells us which: a literal field shows up there under its
/// exact rename, dots included, while a nested path doesn't. So each key
/// is classified once up front against `T::default()`'s own top-level
/// keys, then written with [`set_literal`] or [`set_path`] accordingly.
///
/// Fields are merged one key at a time, in sorted order, validating the
/// whole tree after each insertion. This gives field-granular error
/// handling without needing struct reflection: if a single key's value
/// doesn't fit the target's shape, first its JSON-typed guess is retried
/// as a bare string (covering alias types with custom string formats),
/// and only if that also fails does loose/strict mode decide whether to
/// drop it or fail the whole decode.
pub fn decode_values<T>(flat: &FlatMap, loose: bool) -> Result<T, Failure>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut tree = serde_json::to_value(T::default())?;
    let literal_keys: std::collections::HashSet<String> = tree
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    for (key, raw) in flat {
        if key.is_empty() {
            continue;
        }
        let is_literal_field = literal_keys.contains(key.as_str());
        let write = |t: &mut Value, leaf: Value| {
            if is_literal_field {
                set_literal(t, key, leaf);
            } else {
                set_path(t, key, leaf);
            }
        };

        let typed_leaf = guess_scalar(raw);
        let mut candidate = tree.clone();
        write(&mut candidate, typed_leaf);

        if serde_json::from_value::<T>(candidate.clone()).is_ok() {
            tree = candidate;
            continue;
        }

        let mut string_candidate = tree.clone();
        write(&mut string_candidate, Value::String(raw.clone()));
        match serde_json::from_value::<T>(string_candidate.clone()) {
            Ok(_) => tree = string_candidate,
            Err(err) => {
                if loose {
                    continue;
                }
                return Err(Failure::bad_request(format!(
                    "field '{key}' failed to decode: {err}"
                )));
            }
        }
    }

    serde_json::from_value(tree).map_err(Failure::from)
}

/// JSON body encode: the whole-payload case of the codec (no flattening).
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, Failure> {
    serde_json::to_vec(value).map_err(Failure::from)
}

/// JSON body decode: the whole-payload case of the codec.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Failure> {
    let bytes: &[u8] = if bytes.is_empty() { b"null" } else { bytes };
    serde_json::from_slice(bytes).map_err(Failure::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct ContactInfo {
        email: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct User {
        #[serde(rename = "ID")]
        id: String,
        name: String,
        age: u32,
        active: bool,
        #[serde(skip)]
        internal: String,
        contact_info: ContactInfo,
    }

    #[test]
    fn encode_flattens_nested_struct_with_dotted_paths() {
        let user = User {
            id: "123".into(),
            name: "Ada".into(),
            age: 30,
            active: true,
            internal: "secret".into(),
            contact_info: ContactInfo {
                email: "ada@example.com".into(),
            },
        };
        let flat = encode_values(&user).unwrap();
        assert_eq!(flat.get("ID").unwrap(), "123");
        assert_eq!(flat.get("name").unwrap(), "Ada");
        assert_eq!(flat.get("age").unwrap(), "30");
        assert_eq!(flat.get("active").unwrap(), "true");
        assert_eq!(flat.get("contact_info.email").unwrap(), "ada@example.com");
        assert!(!flat.contains_key("internal"), "skipped fields are omitted");
    }

    #[test]
    fn decode_roundtrips_encoded_values() {
        let user = User {
            id: "9".into(),
            name: "Lin".into(),
            age: 41,
            active: false,
            internal: String::new(),
            contact_info: ContactInfo {
                email: "lin@example.com".into(),
            },
        };
        let flat = encode_values(&user).unwrap();
        let decoded: User = decode_values(&flat, false).unwrap();
        assert_eq!(decoded.id, "9");
        assert_eq!(decoded.name, "Lin");
        assert_eq!(decoded.age, 41);
        assert!(!decoded.active);
        assert_eq!(decoded.contact_info.email, "lin@example.com");
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct ErrorView {
        #[serde(rename = "Error.Message")]
        message: String,
        #[serde(rename = "Error.Status")]
        status: String,
    }

    #[test]
    fn decode_writes_a_dotted_rename_as_a_literal_key_not_a_nested_path() {
        // flatten() never produces a nested {"Error":{"Message":..}} tree for
        // a `#[serde(rename = "Error.Message")]` field, since serde_json
        // already renders it as one flat key. decode_values must recognize
        // that and write the same literal key back, not split on the dot.
        let encoded = encode_values(&ErrorView {
            message: "boom".into(),
            status: "500".into(),
        })
        .unwrap();
        assert_eq!(encoded.get("Error.Message").unwrap(), "boom");

        let mut flat = FlatMap::new();
        flat.insert("Error.Message".into(), "boom".into());
        flat.insert("Error.Status".into(), "500".into());
        let decoded: ErrorView = decode_values(&flat, false).unwrap();
        assert_eq!(decoded.message, "boom");
        assert_eq!(decoded.status, "500");
    }

    #[test]
    fn decode_skips_missing_fields() {
        let mut flat = FlatMap::new();
        flat.insert("name".into(), "Solo".into());
        let decoded: User = decode_values(&flat, false).unwrap();
        assert_eq!(decoded.name, "Solo");
        assert_eq!(decoded.age, 0);
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct AliasId(String);

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct WithAlias {
        id: AliasId,
    }

    #[test]
    fn decode_downgrades_numeric_looking_value_to_string_for_alias_type() {
        let mut flat = FlatMap::new();
        // "42" parses as a number, but the target field is a string alias,
        // so decode must retry with the bare string and succeed.
        flat.insert("id".into(), "42".into());
        let decoded: WithAlias = decode_values(&flat, false).unwrap();
        assert_eq!(decoded.id, AliasId("42".into()));
    }

    #[test]
    fn decode_strict_mode_fails_on_first_bad_field() {
        // contact_info is an object; a bare scalar can never satisfy it,
        // even after the string-downgrade retry.
        let mut flat = FlatMap::new();
        flat.insert("contact_info".into(), "oops".into());
        let result: Result<User, _> = decode_values(&flat, false);
        assert!(result.is_err());
    }

    #[test]
    fn decode_loose_mode_swallows_bad_field_and_keeps_the_rest() {
        let mut flat = FlatMap::new();
        flat.insert("contact_info".into(), "oops".into());
        flat.insert("name".into(), "Still Works".into());
        let decoded: User = decode_values(&flat, true).unwrap();
        assert_eq!(decoded.name, "Still Works");
        assert_eq!(decoded.contact_info.email, "");
    }

    #[test]
    fn body_round_trip() {
        let user = User {
            id: "1".into(),
            name: "Body".into(),
            age: 5,
            active: true,
            internal: String::new(),
            contact_info: ContactInfo::default(),
        };
        let bytes = encode_body(&user).unwrap();
        let decoded: User = decode_body(&bytes).unwrap();
        assert_eq!(decoded.name, "Body");
    }
}
