//! Read-only backend settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::StorageError;

/// Free-form configuration handed to a backend at construction.
///
/// Settings are immutable once built. Cloning is cheap and shares the
/// underlying map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: Arc<BTreeMap<String, Value>>,
}

impl Settings {
    /// Builds settings from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidInput`] if `value` is not an object.
    pub fn from_json(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(StorageError::InvalidInput(format!(
                "settings must be a JSON object, got {other}"
            ))),
        }
    }

    /// Returns a copy of these settings with `other` layered on top.
    pub fn merged(&self, other: &Settings) -> Settings {
        let mut values = (*self.values).clone();
        values.extend(other.iter().map(|(k, v)| (k.to_string(), v.clone())));
        Settings {
            values: Arc::new(values),
        }
    }

    /// Returns the raw value of a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns true if the setting is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns a string setting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSettings`] if the value is not a string.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, StorageError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(invalid(key, "expected a string")),
        }
    }

    /// Returns an unsigned integer setting. Numeric strings are accepted.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, StorageError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(key, "expected a non-negative integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "expected a non-negative integer")),
            Some(_) => Err(invalid(key, "expected a non-negative integer")),
        }
    }

    /// Returns a boolean setting. `"true"` and `"false"` strings are accepted.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(invalid(key, "expected a boolean")),
            },
            Some(_) => Err(invalid(key, "expected a boolean")),
        }
    }

    /// Iterates over all settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of settings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no settings are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses a `KEY=VALUE` override.
    ///
    /// The value is read as JSON when it parses, otherwise kept as a string,
    /// so `LIMIT=5` yields a number and `PATH=/tmp/db` a string.
    pub fn parse_override(spec: &str) -> Result<(String, Value), StorageError> {
        let (key, raw) = spec
            .split_once('=')
            .ok_or_else(|| {
                StorageError::InvalidInput(format!("expected KEY=VALUE, got {spec}"))
            })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StorageError::InvalidInput(
                "setting name cannot be empty".into(),
            ));
        }

        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok((key.to_string(), value))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Settings {
            values: Arc::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

impl Serialize for Settings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(Settings {
            values: Arc::new(values),
        })
    }
}

fn invalid(key: &str, reason: &str) -> StorageError {
    StorageError::InvalidSettings {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
