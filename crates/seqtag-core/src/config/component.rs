//! Generic `{class, params}` configuration nodes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A polymorphic configuration node: a class name plus free-form params.
///
/// In TOML the params sit beside `class` in the same table:
///
/// ```toml
/// [model.rnn2seqencoder]
/// class = "Lstm2SeqEncoder"
/// hidden_dim = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub class: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ComponentConfig {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            params: Map::new(),
        }
    }

    /// Builder-style param insertion, mostly for tests and programmatic configs.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// A read view of this node's params that reports errors under `path`.
    pub fn at<'a>(&'a self, path: impl Into<String>) -> Params<'a> {
        Params {
            path: path.into(),
            params: &self.params,
        }
    }
}

/// Path-aware accessor over a node's params.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    path: String,
    params: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn field(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.optional(key)?
            .ok_or_else(|| ConfigError::missing(self.field(key)))
    }

    pub fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| ConfigError::TypeMismatch {
                    field: self.field(key),
                    reason: err.to_string(),
                }),
        }
    }

    pub fn or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    /// A nested component node stored under `key`.
    pub fn component(&self, key: &str) -> Result<(ComponentConfig, String), ConfigError> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| ConfigError::missing(self.field(key)))?;
        Ok((to_component(value, &self.field(key))?, self.field(key)))
    }

    /// A list of component nodes stored under `key`, in declared order.
    pub fn components(&self, key: &str) -> Result<Vec<(ComponentConfig, String)>, ConfigError> {
        let field = self.field(key);
        match self.params.get(key) {
            None => Err(ConfigError::missing(field)),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let path = format!("{field}[{i}]");
                    Ok((to_component(item, &path)?, path))
                })
                .collect(),
            // A single table is accepted as a one-element list.
            Some(single @ Value::Object(_)) => Ok(vec![(to_component(single, &field)?, field)]),
            Some(_) => Err(ConfigError::TypeMismatch {
                field,
                reason: "expected a list of component tables".into(),
            }),
        }
    }
}

fn to_component(value: &Value, path: &str) -> Result<ComponentConfig, ConfigError> {
    let Value::Object(map) = value else {
        return Err(ConfigError::TypeMismatch {
            field: path.to_string(),
            reason: "expected a component table".into(),
        });
    };
    if !map.contains_key("class") {
        return Err(ConfigError::missing(format!("{path}.class")));
    }
    serde_json::from_value(value.clone()).map_err(|err| ConfigError::TypeMismatch {
        field: path.to_string(),
        reason: err.to_string(),
    })
}
