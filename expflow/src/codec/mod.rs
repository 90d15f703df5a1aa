//! Flat key-value transport for nested configuration.
//!
//! Remote job parameter channels only carry string-to-string pairs and may
//! re-parse values on the way. [`flatten`] turns a nested JSON tree into such a
//! map, and [`unflatten`] restores it:
//!
//! ```
//! use expflow::codec::{flatten, unflatten_strings};
//! use serde_json::json;
//!
//! let tree = json!({"a": {"b": [1, "x"]}});
//! let flat = flatten(&tree, "p_").unwrap();
//! assert_eq!(flat["p_a.b[0]"], "1");
//! assert_eq!(flat["p_a.b[1]"], "\"x\"");
//! assert_eq!(unflatten_strings(&flat, "p_").unwrap(), tree);
//! ```

mod key;

pub use key::{is_valid_field, parse_key, Segment, SEPARATORS};

use crate::errors::ConfigurationError;
use key::push_field;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Flat parameter map as carried by the transport.
pub type FlatParameters = BTreeMap<String, String>;

/// Flattens `tree` into a map whose keys all start with `prefix`.
///
/// Scalars are JSON-encoded. Empty objects and arrays become the leaves `{}`
/// and `[]` so they survive the trip back. Object keys must be non-empty and
/// free of `.`, `[` and `]`.
pub fn flatten(tree: &Value, prefix: &str) -> Result<FlatParameters, ConfigurationError> {
    let mut out = FlatParameters::new();
    flatten_into(tree, prefix, true, &mut out)?;
    Ok(out)
}

fn flatten_into(
    node: &Value,
    key: &str,
    at_root: bool,
    out: &mut FlatParameters,
) -> Result<(), ConfigurationError> {
    match node {
        Value::Object(map) if !map.is_empty() => {
            for (name, child) in map {
                if !is_valid_field(name) {
                    return Err(ConfigurationError::new(format!(
                        "Object key '{name}' under '{key}' is empty or contains one of . [ ]"
                    ))
                    .with_key(name.clone()));
                }
                flatten_into(child, &push_field(key, at_root, name), false, out)?;
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (idx, child) in items.iter().enumerate() {
                flatten_into(child, &format!("{key}[{idx}]"), false, out)?;
            }
        }
        leaf => {
            if out.insert(key.to_string(), leaf.to_string()).is_some() {
                return Err(ConfigurationError::new(format!("Duplicate flat key '{key}'")).with_key(key));
            }
        }
    }
    Ok(())
}

/// Rebuilds a tree from the entries of `flat` whose keys start with `prefix`.
///
/// String values are parsed as JSON when possible and kept verbatim otherwise;
/// non-string values are taken as already decoded by the transport.
pub fn unflatten(flat: &BTreeMap<String, Value>, prefix: &str) -> Result<Value, ConfigurationError> {
    unflatten_entries(flat.iter().map(|(k, v)| (k.as_str(), v.clone())), prefix)
}

/// [`unflatten`] for a map of raw strings.
pub fn unflatten_strings(flat: &FlatParameters, prefix: &str) -> Result<Value, ConfigurationError> {
    unflatten_entries(
        flat.iter().map(|(k, v)| (k.as_str(), Value::String(v.clone()))),
        prefix,
    )
}

fn unflatten_entries<'a>(
    entries: impl Iterator<Item = (&'a str, Value)>,
    prefix: &str,
) -> Result<Value, ConfigurationError> {
    let mut root: Option<Node> = None;
    for (raw_key, value) in entries {
        let Some(rest) = raw_key.strip_prefix(prefix) else {
            continue;
        };
        let path = parse_key(rest)?;
        insert(&mut root, &path, decode_leaf(value), raw_key)?;
    }
    Ok(root.map_or_else(|| Value::Object(Map::new()), Node::into_value))
}

fn decode_leaf(value: Value) -> Value {
    match value {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

/// Partially rebuilt tree. A slot's kind is fixed by the first write.
#[derive(Debug)]
enum Node {
    Leaf(Value),
    Object(BTreeMap<String, Node>),
    Array(BTreeMap<usize, Node>),
}

impl Node {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "scalar",
            Self::Object(_) => "object",
            Self::Array(_) => "array",
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Leaf(v) => v,
            Self::Object(map) => Value::Object(map.into_iter().map(|(k, n)| (k, n.into_value())).collect()),
            // gaps collapse, order follows the index
            Self::Array(items) => Value::Array(items.into_values().map(Self::into_value).collect()),
        }
    }
}

fn insert(slot: &mut Option<Node>, path: &[Segment], value: Value, raw_key: &str) -> Result<(), ConfigurationError> {
    let conflict = |existing: &Node, wanted: &str| {
        ConfigurationError::new(format!(
            "Key '{raw_key}' writes a {wanted} where a {} already exists",
            existing.kind()
        ))
        .with_key(raw_key)
    };

    let Some((head, tail)) = path.split_first() else {
        return match slot {
            Some(existing) => Err(conflict(existing, "scalar")),
            None => {
                *slot = Some(Node::Leaf(value));
                Ok(())
            }
        };
    };

    match head {
        Segment::Field(name) => {
            let node = slot.get_or_insert_with(|| Node::Object(BTreeMap::new()));
            let Node::Object(map) = node else {
                return Err(conflict(node, "object"));
            };
            let mut child = map.remove(name);
            let result = insert(&mut child, tail, value, raw_key);
            if let Some(child) = child {
                map.insert(name.clone(), child);
            }
            result
        }
        Segment::Index(idx) => {
            let node = slot.get_or_insert_with(|| Node::Array(BTreeMap::new()));
            let Node::Array(items) = node else {
                return Err(conflict(node, "array"));
            };
            let mut child = items.remove(idx);
            let result = insert(&mut child, tail, value, raw_key);
            if let Some(child) = child {
                items.insert(*idx, child);
            }
            result
        }
    }
}
