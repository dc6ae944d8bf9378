//! Tag → constructor registries for the polymorphic configuration sections.
//!
//! A section such as `"loss": {"type": "nt_xent", "temperature": 0.05}` names its strategy
//! through the `type` tag. Each registry knows the tags of one section kind, the parameters
//! every tag requires, and how to turn the section into a typed value.

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds a typed value from a section that already passed the required-parameter check
pub type Constructor<T> = fn(&Value) -> Result<T, ConfigError>;

struct Registration<T> {
    required: &'static [&'static str],
    constructor: Constructor<T>,
}

/// Registry of strategies for one configuration section kind.
pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<&'static str, Registration<T>>,
}

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register `tag` with the parameters it requires and its constructor.
    pub fn register(
        mut self,
        tag: &'static str,
        required: &'static [&'static str],
        constructor: Constructor<T>,
    ) -> Self {
        self.entries.insert(
            tag,
            Registration {
                required,
                constructor,
            },
        );
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Registered tags in sorted order
    pub fn tags(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Look up the section's `type` tag, check required parameters and construct the value.
    pub fn build(&self, section: &Value) -> Result<T, ConfigError> {
        let tag = section_type(section).ok_or(ConfigError::MissingType { kind: self.kind })?;

        let registration = self
            .entries
            .get(tag)
            .ok_or_else(|| ConfigError::UnknownType {
                kind: self.kind,
                tag: tag.to_string(),
                available: self.tags().join(", "),
            })?;

        for parameter in registration.required {
            if section.get(parameter).map_or(true, Value::is_null) {
                return Err(ConfigError::MissingParameter {
                    kind: self.kind,
                    tag: tag.to_string(),
                    parameter,
                });
            }
        }

        (registration.constructor)(section)
    }
}

/// The `type` tag of a section, if present.
pub fn section_type(section: &Value) -> Option<&str> {
    section.get("type").and_then(Value::as_str)
}

/// Deserialize a section into `T`, ignoring its `type` tag.
pub fn from_section<T: DeserializeOwned>(name: &str, section: &Value) -> Result<T, ConfigError> {
    let mut section = section.clone();
    if let Value::Object(map) = &mut section {
        map.remove("type");
    }
    serde_json::from_value(section).map_err(|e| ConfigError::parse(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Scaled {
        factor: f64,
    }

    fn scaled(section: &Value) -> Result<f64, ConfigError> {
        let scaled: Scaled = from_section("scale", section)?;
        Ok(scaled.factor)
    }

    fn unit(_: &Value) -> Result<f64, ConfigError> {
        Ok(1.0)
    }

    fn registry() -> Registry<f64> {
        Registry::new("scale")
            .register("unit", &[], unit)
            .register("scaled", &["factor"], scaled)
    }

    #[test]
    fn test_builds_registered_tag() {
        let registry = registry();
        assert_eq!(registry.build(&json!({"type": "unit"})).unwrap(), 1.0);
        assert_eq!(
            registry
                .build(&json!({"type": "scaled", "factor": 2.5}))
                .unwrap(),
            2.5
        );
    }

    #[test]
    fn test_unknown_tag_lists_available() {
        let err = registry().build(&json!({"type": "cubic"})).unwrap_err();
        match err {
            ConfigError::UnknownType {
                kind,
                tag,
                available,
            } => {
                assert_eq!(kind, "scale");
                assert_eq!(tag, "cubic");
                assert_eq!(available, "scaled, unit");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = registry().build(&json!({"type": "scaled"})).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingParameter {
                parameter: "factor",
                ..
            }
        ));

        // An explicit null counts as missing
        let err = registry()
            .build(&json!({"type": "scaled", "factor": null}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter { .. }));
    }

    #[test]
    fn test_missing_type_tag() {
        let err = registry().build(&json!({"factor": 1.0})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingType { kind: "scale" }));
    }

    #[test]
    fn test_wrongly_typed_parameter_is_parse_error() {
        let err = registry()
            .build(&json!({"type": "scaled", "factor": "big"}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
