//! Algorithm definitions.
//!
//! A definition is a JSON object published inside the algorithm artifact. It
//! carries the algorithm identity, its dependencies and per-step settings.
//! Definitions are immutable values: applying an override produces a new one.

mod artifact;
mod layout;
mod version;

pub use artifact::{definition_entry_name, AlgorithmArtifact};
pub use layout::{
    CachePolicy, DefinitionLayout, ExecutionParameters, FeatureStateConfig, StepCacheConfig,
    TrainingConfig,
};
pub use version::{ParameterVersion, NO_TRAIN_DATE};

use crate::errors::ConfigurationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

/// Key holding the algorithm name.
pub const NAME_KEY: &str = "algorithm_name";
/// Key holding the algorithm version.
pub const VERSION_KEY: &str = "algorithm_version";
/// Key holding the optional hyperparameter version.
pub const HYPERPARAMETER_VERSION_KEY: &str = "hyperparameter_version";
/// Key holding the dependency list or map.
pub const DEPENDENCIES_KEY: &str = "dependencies";

#[allow(clippy::expect_used)]
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-_]+$").expect("valid name pattern"));
#[allow(clippy::expect_used)]
static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-_\.]+$").expect("valid version pattern"));
#[allow(clippy::expect_used)]
static REFERENCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w\-]+)(?:@([\w\-.]+))?$").expect("valid reference pattern"));

/// Checks an algorithm name.
pub fn verify_name(name: &str) -> Result<&str, ConfigurationError> {
    if NAME_PATTERN.is_match(name) {
        Ok(name)
    } else {
        Err(ConfigurationError::new(format!(
            "Invalid algorithm name '{name}', it must match {}",
            NAME_PATTERN.as_str()
        ))
        .with_key(NAME_KEY))
    }
}

/// Checks an algorithm version.
pub fn verify_version(version: &str) -> Result<&str, ConfigurationError> {
    if VERSION_PATTERN.is_match(version) {
        Ok(version)
    } else {
        Err(ConfigurationError::new(format!(
            "Invalid algorithm version '{version}', it must match {}",
            VERSION_PATTERN.as_str()
        ))
        .with_key(VERSION_KEY))
    }
}

/// Checks a hyperparameter version.
pub fn verify_hyperparameter_version(version: &str) -> Result<&str, ConfigurationError> {
    // same alphabet as names: no dots
    if NAME_PATTERN.is_match(version) {
        Ok(version)
    } else {
        Err(ConfigurationError::new(format!(
            "Invalid hyperparameter version '{version}', it must match {}",
            NAME_PATTERN.as_str()
        ))
        .with_key(HYPERPARAMETER_VERSION_KEY))
    }
}

/// The identity of an algorithm: name, version and optional hyperparameter version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlgorithmIdentity {
    /// Algorithm name.
    pub name: String,
    /// Algorithm version.
    pub version: String,
    /// Hyperparameter version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameter_version: Option<String>,
}

impl AlgorithmIdentity {
    /// Identity string used in directory names: `name@version[-hyperparameterVersion]`.
    #[must_use]
    pub fn slug(&self) -> String {
        match &self.hyperparameter_version {
            Some(hp) => format!("{}@{}-{hp}", self.name, self.version),
            None => format!("{}@{}", self.name, self.version),
        }
    }
}

impl fmt::Display for AlgorithmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug())
    }
}

/// A dependency declared by a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Name of the algorithm depended on.
    pub name: String,
    /// Version pinned with `name@version`, if any.
    pub pinned_version: Option<String>,
    /// Override applied to the dependency's definition (map form only).
    pub definition_override: Option<Value>,
}

impl DependencySpec {
    /// Parses a `name` or `name@version` reference.
    pub fn parse(reference: &str) -> Result<Self, ConfigurationError> {
        let caps = REFERENCE_PATTERN.captures(reference).ok_or_else(|| {
            ConfigurationError::new(format!("Invalid dependency reference '{reference}'"))
                .with_key(DEPENDENCIES_KEY)
        })?;
        Ok(Self {
            name: caps[1].to_string(),
            pinned_version: caps.get(2).map(|m| m.as_str().to_string()),
            definition_override: None,
        })
    }

    /// Sets the override.
    #[must_use]
    pub fn with_override(mut self, definition_override: Value) -> Self {
        self.definition_override = Some(definition_override);
        self
    }
}

/// A validated algorithm definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct AlgorithmDefinition {
    raw: Map<String, Value>,
}

impl AlgorithmDefinition {
    /// Validates `value` and wraps it.
    pub fn from_value(value: Value) -> Result<Self, ConfigurationError> {
        let Value::Object(raw) = value else {
            return Err(ConfigurationError::new("Algorithm definition must be a JSON object"));
        };
        let definition = Self { raw };
        verify_name(definition.required_str(NAME_KEY)?)?;
        verify_version(definition.required_str(VERSION_KEY)?)?;
        if let Some(hp) = definition.optional_str(HYPERPARAMETER_VERSION_KEY)? {
            verify_hyperparameter_version(hp)?;
        }
        // surface malformed dependency declarations at load time
        definition.dependencies()?;
        Ok(definition)
    }

    /// Parses a definition from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ConfigurationError::new(format!("Algorithm definition is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    fn required_str(&self, key: &str) -> Result<&str, ConfigurationError> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigurationError::new(format!("Algorithm definition lacks string '{key}'")).with_key(key))
    }

    fn optional_str(&self, key: &str) -> Result<Option<&str>, ConfigurationError> {
        match self.raw.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(ConfigurationError::new(format!("'{key}' must be a string, got {other}")).with_key(key)),
        }
    }

    fn str_field(&self, key: &str) -> &str {
        self.raw.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    /// Algorithm name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.str_field(NAME_KEY)
    }

    /// Algorithm version.
    #[must_use]
    pub fn version(&self) -> &str {
        self.str_field(VERSION_KEY)
    }

    /// Hyperparameter version, if declared.
    #[must_use]
    pub fn hyperparameter_version(&self) -> Option<&str> {
        self.raw.get(HYPERPARAMETER_VERSION_KEY).and_then(Value::as_str)
    }

    /// Full identity.
    #[must_use]
    pub fn identity(&self) -> AlgorithmIdentity {
        AlgorithmIdentity {
            name: self.name().to_string(),
            version: self.version().to_string(),
            hyperparameter_version: self.hyperparameter_version().map(str::to_string),
        }
    }

    /// Hyperparameter slug, see [`AlgorithmIdentity::slug`].
    #[must_use]
    pub fn slug(&self) -> String {
        self.identity().slug()
    }

    /// Looks up a top-level entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Declared dependencies in declaration order.
    ///
    /// The list form (`["a", "b@1.0"]`) carries no overrides; the map form
    /// (`{"a": {...}}`) maps each name to its override.
    pub fn dependencies(&self) -> Result<Vec<DependencySpec>, ConfigurationError> {
        match self.raw.get(DEPENDENCIES_KEY) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(reference) => DependencySpec::parse(reference),
                    other => Err(ConfigurationError::new(format!("Dependency entries must be strings, got {other}"))
                        .with_key(DEPENDENCIES_KEY)),
                })
                .collect(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(reference, ov)| {
                    let spec = DependencySpec::parse(reference)?;
                    Ok(match ov {
                        Value::Null => spec,
                        Value::Object(o) if o.is_empty() => spec,
                        Value::Object(_) => spec.with_override(ov.clone()),
                        other => {
                            return Err(ConfigurationError::new(format!(
                                "Override for dependency '{reference}' must be an object, got {other}"
                            ))
                            .with_key(DEPENDENCIES_KEY))
                        }
                    })
                })
                .collect(),
            Some(other) => Err(ConfigurationError::new(format!(
                "'dependencies' must be a list or a map, got {other}"
            ))
            .with_key(DEPENDENCIES_KEY)),
        }
    }

    /// Returns a new definition with `definition_override` merged in.
    ///
    /// Nested objects merge recursively; other values replace. A list in the
    /// base that meets an object in the override becomes an object keyed by
    /// its former entries. Name and version cannot be changed.
    pub fn with_override(&self, definition_override: &Value) -> Result<Self, ConfigurationError> {
        let Value::Object(patch) = definition_override else {
            return Err(ConfigurationError::new(format!(
                "Definition override must be an object, got {definition_override}"
            )));
        };
        for key in [NAME_KEY, VERSION_KEY] {
            if let Some(new) = patch.get(key) {
                if self.raw.get(key) != Some(new) {
                    return Err(ConfigurationError::new(format!(
                        "Override may not change '{key}' of {} (attempted {new})",
                        self.slug()
                    ))
                    .with_key(key));
                }
            }
        }
        let mut merged = Value::Object(self.raw.clone());
        merge_into(&mut merged, patch);
        Self::from_value(merged)
    }

    /// Typed view of the step settings.
    pub fn layout(&self) -> Result<DefinitionLayout, ConfigurationError> {
        serde_json::from_value(Value::Object(self.raw.clone())).map_err(|e| {
            ConfigurationError::new(format!("Invalid step settings in {}: {e}", self.slug()))
        })
    }

    /// Content hash of the canonical JSON text.
    #[must_use]
    pub fn definition_hash(&self) -> String {
        // serde_json maps are key-sorted, so the text is canonical
        let json = serde_json::to_string(&self.raw).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }

    /// The definition as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }

    /// Pretty-printed JSON text.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.raw)
    }
}

impl TryFrom<Value> for AlgorithmDefinition {
    type Error = ConfigurationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<AlgorithmDefinition> for Value {
    fn from(definition: AlgorithmDefinition) -> Self {
        Self::Object(definition.raw)
    }
}

fn merge_into(base: &mut Value, patch: &Map<String, Value>) {
    if let Value::Array(items) = base {
        let keyed = items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .map(|k| (k, Value::Object(Map::new())))
            .collect();
        *base = Value::Object(keyed);
    }
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let Value::Object(target) = base else {
        return;
    };
    for (key, value) in patch {
        match value {
            Value::Object(nested) => {
                let slot = target.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()));
                merge_into(slot, nested);
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn definition(value: Value) -> AlgorithmDefinition {
        AlgorithmDefinition::from_value(value).unwrap()
    }

    #[test]
    fn test_identity_and_slug() {
        let d = definition(json!({"algorithm_name": "ranker", "algorithm_version": "1.2.0"}));
        assert_eq!(d.slug(), "ranker@1.2.0");

        let d = definition(json!({
            "algorithm_name": "ranker",
            "algorithm_version": "1.2.0",
            "hyperparameter_version": "lr-01",
        }));
        assert_eq!(d.slug(), "ranker@1.2.0-lr-01");
        assert_eq!(d.identity().hyperparameter_version.as_deref(), Some("lr-01"));
    }

    #[test]
    fn test_invalid_identity_rejected() {
        assert!(AlgorithmDefinition::from_value(json!({"algorithm_name": "a b", "algorithm_version": "1"})).is_err());
        assert!(AlgorithmDefinition::from_value(json!({"algorithm_name": "a", "algorithm_version": "1/2"})).is_err());
        assert!(AlgorithmDefinition::from_value(json!({"algorithm_version": "1"})).is_err());
        assert!(AlgorithmDefinition::from_value(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "hyperparameter_version": "x.y",
        }))
        .is_err());
        assert!(AlgorithmDefinition::from_value(json!([1])).is_err());
    }

    #[test]
    fn test_override_cannot_change_identity() {
        let d = definition(json!({"algorithm_name": "a", "algorithm_version": "1"}));
        let err = d.with_override(&json!({"algorithm_name": "b"})).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("algorithm_name"));
        assert!(d.with_override(&json!({"algorithm_version": "2"})).is_err());
        // restating the same identity is harmless
        assert!(d.with_override(&json!({"algorithm_name": "a", "x": 1})).is_ok());
    }

    #[test]
    fn test_override_merges_recursively() {
        let d = definition(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "training": {"command": "train", "params": {"lr": 0.1, "epochs": 3}},
            "dependencies": ["b", "c"],
        }));
        let merged = d
            .with_override(&json!({
                "training": {"params": {"lr": 0.5}},
                "dependencies": {"b": {"hyperparameter_version": "v2"}},
                "hyperparameter_version": "hp1",
            }))
            .unwrap();
        assert_eq!(
            merged.to_value(),
            json!({
                "algorithm_name": "a",
                "algorithm_version": "1",
                "hyperparameter_version": "hp1",
                "training": {"command": "train", "params": {"lr": 0.5, "epochs": 3}},
                "dependencies": {"b": {"hyperparameter_version": "v2"}, "c": {}},
            })
        );
        // the original is untouched
        assert_eq!(d.hyperparameter_version(), None);
    }

    #[test]
    fn test_dependencies_list_and_map_forms() {
        let d = definition(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "dependencies": ["b", "c@2.0"],
        }));
        let deps = d.dependencies().unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[1].name, "c");
        assert_eq!(deps[1].pinned_version.as_deref(), Some("2.0"));
        assert!(deps.iter().all(|dep| dep.definition_override.is_none()));

        let d = definition(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "dependencies": {"b": {"x": 1}, "c": {}},
        }));
        let deps = d.dependencies().unwrap();
        assert_eq!(deps[0].definition_override, Some(json!({"x": 1})));
        assert_eq!(deps[1].definition_override, None);
    }

    #[test]
    fn test_bad_dependency_reference() {
        assert!(AlgorithmDefinition::from_value(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "dependencies": ["b@"],
        }))
        .is_err());
        assert!(AlgorithmDefinition::from_value(json!({
            "algorithm_name": "a",
            "algorithm_version": "1",
            "dependencies": 5,
        }))
        .is_err());
    }

    #[test]
    fn test_definition_hash_tracks_content() {
        let a = definition(json!({"algorithm_name": "a", "algorithm_version": "1", "k": 1}));
        let same = definition(json!({"k": 1, "algorithm_version": "1", "algorithm_name": "a"}));
        let other = a.with_override(&json!({"k": 2})).unwrap();
        assert_eq!(a.definition_hash(), same.definition_hash());
        assert_ne!(a.definition_hash(), other.definition_hash());
        assert_eq!(a.definition_hash().len(), 32);
    }

    #[test]
    fn test_serde_validates() {
        let parsed: Result<AlgorithmDefinition, _> =
            serde_json::from_value(json!({"algorithm_name": "?", "algorithm_version": "1"}));
        assert!(parsed.is_err());
        let d = definition(json!({"algorithm_name": "a", "algorithm_version": "1"}));
        let round: AlgorithmDefinition = serde_json::from_str(&serde_json::to_string(&d).unwrap()).unwrap();
        assert_eq!(round, d);
    }
}
