//! Typed values for message metadata and node configuration.
//!
//! Metadata and configuration are open key/value mappings, but their values
//! are drawn from a small closed set of kinds so that they survive JSON and
//! TOML round-trips unchanged. Mappings preserve insertion order.

use crate::error::PipelineError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Insertion-ordered mapping from string keys to [`Value`]s.
pub type Meta = IndexMap<String, Value>;

/// A metadata or configuration value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  /// Absent value.
  #[default]
  Null,
  /// Boolean flag.
  Bool(bool),
  /// Any numeric value.
  Number(f64),
  /// UTF-8 text.
  String(String),
  /// Ordered list of values.
  List(Vec<Value>),
  /// Nested ordered mapping.
  Map(Meta),
}

impl Value {
  /// Returns the string content, if this is a string.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  /// Returns the numeric content, if this is a number.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Number(n) => Some(*n),
      _ => None,
    }
  }

  /// Returns the content as an unsigned integer when it is a whole,
  /// non-negative number.
  pub fn as_u64(&self) -> Option<u64> {
    match self {
      Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= u64::MAX as f64 => Some(*n as u64),
      _ => None,
    }
  }

  /// Returns the boolean content, if this is a boolean.
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  /// Returns the list content, if this is a list.
  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(items) => Some(items),
      _ => None,
    }
  }

  /// Returns the mapping content, if this is a mapping.
  pub fn as_map(&self) -> Option<&Meta> {
    match self {
      Value::Map(map) => Some(map),
      _ => None,
    }
  }

  /// Returns true for [`Value::Null`].
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Short name of the value kind, used in diagnostics.
  pub fn kind_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Number(_) => "number",
      Value::String(_) => "string",
      Value::List(_) => "list",
      Value::Map(_) => "mapping",
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Self {
    Value::Number(n)
  }
}

impl From<f32> for Value {
  fn from(n: f32) -> Self {
    Value::Number(f64::from(n))
  }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self {
    Value::Number(n as f64)
  }
}

impl From<i32> for Value {
  fn from(n: i32) -> Self {
    Value::Number(f64::from(n))
  }
}

impl From<u64> for Value {
  fn from(n: u64) -> Self {
    Value::Number(n as f64)
  }
}

impl From<u32> for Value {
  fn from(n: u32) -> Self {
    Value::Number(f64::from(n))
  }
}

impl From<usize> for Value {
  fn from(n: usize) -> Self {
    Value::Number(n as f64)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl From<Vec<Value>> for Value {
  fn from(items: Vec<Value>) -> Self {
    Value::List(items)
  }
}

impl From<Meta> for Value {
  fn from(map: Meta) -> Self {
    Value::Map(map)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(Value::Null)
  }
}

impl From<serde_json::Value> for Value {
  fn from(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
      serde_json::Value::String(s) => Value::String(s),
      serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
      serde_json::Value::Object(map) => {
        Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
      }
    }
  }
}

impl From<toml::Value> for Value {
  fn from(value: toml::Value) -> Self {
    match value {
      toml::Value::String(s) => Value::String(s),
      toml::Value::Integer(i) => Value::Number(i as f64),
      toml::Value::Float(f) => Value::Number(f),
      toml::Value::Boolean(b) => Value::Bool(b),
      toml::Value::Datetime(dt) => Value::String(dt.to_string()),
      toml::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
      toml::Value::Table(table) => Value::Map(table_to_meta(table)),
    }
  }
}

/// Converts a TOML table into an ordered metadata mapping.
pub fn table_to_meta(table: toml::Table) -> Meta {
  table.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

/// Node configuration: ordered option names mapped to values.
///
/// Typed getters fail with a configuration error naming the offending option,
/// so node constructors can simply use `?`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(Meta);

impl Config {
  /// Creates an empty configuration.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets an option, returning the configuration for chaining.
  #[must_use]
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  /// Sets an option.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(key.into(), value.into());
  }

  /// Returns the raw value of an option.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  /// Returns true when the option is present and not null.
  pub fn contains(&self, key: &str) -> bool {
    self.0.get(key).is_some_and(|v| !v.is_null())
  }

  /// Number of options.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Returns true when no option is set.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Iterates over options in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  /// Overlays `overrides` onto this configuration; overriding keys win.
  pub fn merge(&mut self, overrides: &Config) {
    for (key, value) in overrides.iter() {
      self.0.insert(key.clone(), value.clone());
    }
  }

  /// Returns the underlying mapping.
  pub fn into_meta(self) -> Meta {
    self.0
  }

  /// Reads a string option, falling back to `default` when absent.
  pub fn str_or(&self, key: &str, default: &str) -> Result<String, PipelineError> {
    match self.present(key) {
      None => Ok(default.to_string()),
      Some(value) => value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(key, "a string", value)),
    }
  }

  /// Reads a required string option.
  pub fn require_str(&self, key: &str) -> Result<String, PipelineError> {
    let value = self
      .present(key)
      .ok_or_else(|| PipelineError::configuration(option_scope(key), "required option is missing"))?;
    value
      .as_str()
      .map(str::to_string)
      .ok_or_else(|| mismatch(key, "a string", value))
  }

  /// Reads a non-negative integer option, falling back to `default`.
  pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, PipelineError> {
    match self.present(key) {
      None => Ok(default),
      Some(value) => value
        .as_u64()
        .ok_or_else(|| mismatch(key, "a non-negative integer", value)),
    }
  }

  /// Reads a numeric option, falling back to `default`.
  pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, PipelineError> {
    match self.present(key) {
      None => Ok(default),
      Some(value) => value.as_f64().ok_or_else(|| mismatch(key, "a number", value)),
    }
  }

  /// Reads a boolean option, falling back to `default`.
  pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, PipelineError> {
    match self.present(key) {
      None => Ok(default),
      Some(value) => value.as_bool().ok_or_else(|| mismatch(key, "a boolean", value)),
    }
  }

  fn present(&self, key: &str) -> Option<&Value> {
    self.0.get(key).filter(|v| !v.is_null())
  }
}

impl From<Meta> for Config {
  fn from(meta: Meta) -> Self {
    Config(meta)
  }
}

impl FromIterator<(String, Value)> for Config {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    Config(iter.into_iter().collect())
  }
}

fn option_scope(key: &str) -> String {
  format!("option '{}'", key)
}

fn mismatch(key: &str, expected: &str, found: &Value) -> PipelineError {
  PipelineError::configuration(
    option_scope(key),
    format!("expected {}, found {}", expected, found.kind_name()),
  )
}
