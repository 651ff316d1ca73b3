//! Deduplicated, versioned generation parameters
//!
//! Every request an agent makes is tagged with the index of the parameter set it
//! used. Structurally equal sets (same keys and values, regardless of insertion
//! order or nesting) always map to the same index.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A set of generation options, e.g. `{"temperature": 0.7, "max_tokens": 512}`
pub type Params = Map<String, Value>;

/// Nesting depth past which substructures are compared by their literal JSON text
pub const MAX_CANONICAL_DEPTH: usize = 42;

/// Merge `overrides` over `base`, later keys winning
pub fn merge_params(base: &Params, overrides: &Params) -> Params {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Stable content key for a parameter set
pub fn params_key(params: &Params) -> String {
    let mut canonical = String::new();
    write_canonical_map(params, 0, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical_map(map: &Map<String, Value>, depth: usize, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], depth + 1, out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_CANONICAL_DEPTH {
        out.push_str(&value.to_string());
        return;
    }
    match value {
        Value::Object(map) => write_canonical_map(map, depth, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, depth + 1, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Append-only list of distinct parameter sets for one agent
#[derive(Debug, Clone, Default)]
pub struct ParamVersionStore {
    versions: Vec<Params>,
    index: HashMap<String, usize>,
}

impl ParamVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from previously exported versions, keeping their order.
    /// Duplicates in the input keep pointing at their first occurrence.
    pub fn from_versions(versions: Vec<Params>) -> Self {
        let mut index = HashMap::new();
        for (i, params) in versions.iter().enumerate() {
            index.entry(params_key(params)).or_insert(i);
        }
        Self { versions, index }
    }

    /// Register `params` and return its version index
    pub fn store(&mut self, params: &Params) -> usize {
        let key = params_key(params);
        if let Some(&version) = self.index.get(&key) {
            return version;
        }
        self.versions.push(params.clone());
        let version = self.versions.len() - 1;
        self.index.insert(key, version);
        version
    }

    pub fn get(&self, version: usize) -> Option<&Params> {
        self.versions.get(version)
    }

    pub fn versions(&self) -> &[Params] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl PartialEq for ParamVersionStore {
    fn eq(&self, other: &Self) -> bool {
        self.versions == other.versions
    }
}

impl Serialize for ParamVersionStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.versions.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParamVersionStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Params>::deserialize(deserializer).map(Self::from_versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn test_equal_sets_share_a_version() {
        let mut store = ParamVersionStore::new();
        let first = params(json!({"temperature": 0.7, "stop": ["\n"], "extra": {"a": 1, "b": {"c": 2}}}));

        let mut second = Params::new();
        second.insert("extra".into(), json!({"b": {"c": 2}, "a": 1}));
        second.insert("stop".into(), json!(["\n"]));
        second.insert("temperature".into(), json!(0.7));

        assert_eq!(store.store(&first), 0);
        assert_eq!(store.store(&second), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_sets_append() {
        let mut store = ParamVersionStore::new();
        assert_eq!(store.store(&Params::new()), 0);
        assert_eq!(store.store(&params(json!({"temperature": 0.9}))), 1);
        assert_eq!(store.store(&params(json!({"temperature": 0.1}))), 2);
        assert_eq!(store.store(&params(json!({"temperature": 0.9}))), 1);
        assert_eq!(store.get(2), Some(&params(json!({"temperature": 0.1}))));
    }

    #[test]
    fn test_array_order_matters() {
        let a = params(json!({"stop": ["a", "b"]}));
        let b = params(json!({"stop": ["b", "a"]}));
        assert_ne!(params_key(&a), params_key(&b));
    }

    #[test]
    fn test_deep_nesting_is_capped() {
        let mut nested = json!(1);
        for i in 0..200 {
            nested = json!({ format!("k{}", i % 3): nested });
        }
        let deep = params(json!({ "deep": nested }));

        let mut store = ParamVersionStore::new();
        assert_eq!(store.store(&deep), 0);
        assert_eq!(store.store(&deep.clone()), 0);
    }

    #[test]
    fn test_merge_params_overrides_base() {
        let base = params(json!({"temperature": 0.2, "max_tokens": 100}));
        let merged = merge_params(&base, &params(json!({"temperature": 0.9})));
        assert_eq!(merged, params(json!({"temperature": 0.9, "max_tokens": 100})));
    }

    #[test]
    fn test_store_round_trips_through_json() {
        let mut store = ParamVersionStore::new();
        store.store(&Params::new());
        store.store(&params(json!({"temperature": 0.9})));

        let text = serde_json::to_string(&store).unwrap();
        let mut restored: ParamVersionStore = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, store);
        assert_eq!(restored.store(&params(json!({"temperature": 0.9}))), 1);
    }
}
