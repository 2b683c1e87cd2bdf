//! Per-group, per-plugin settings
//!
//! Persisted shape:
//! `{ "<group_id>": { "name": "...", "plugin": { "<plugin>": { "apply": true, "lock": false, ... } } } }`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::application::errors::BotError;

fn default_apply() -> bool {
    true
}

/// Options of one plugin inside one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginOption {
    #[serde(default = "default_apply")]
    pub apply: bool,
    #[serde(default)]
    pub lock: bool,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl Default for PluginOption {
    fn default() -> Self {
        Self {
            apply: true,
            lock: false,
            custom: Map::new(),
        }
    }
}

impl PluginOption {
    pub fn with_custom(custom: Map<String, Value>) -> Self {
        Self {
            custom,
            ..Self::default()
        }
    }

    /// Current value of `key`, including the two built-in flags
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "apply" => Some(Value::Bool(self.apply)),
            "lock" => Some(Value::Bool(self.lock)),
            _ => self.custom.get(key).cloned(),
        }
    }

    fn set_raw(&mut self, key: &str, value: Value) {
        match (key, value) {
            ("apply", Value::Bool(b)) => self.apply = b,
            ("lock", Value::Bool(b)) => self.lock = b,
            (key, value) => {
                self.custom.insert(key.to_string(), value);
            }
        }
    }

    /// Fill keys missing from `self` with the defaults; existing keys win.
    pub fn merge_defaults(&mut self, defaults: &Map<String, Value>) {
        for (key, default) in defaults {
            if key == "apply" || key == "lock" {
                continue;
            }
            match self.custom.get_mut(key) {
                Some(existing) => deep_merge(existing, default),
                None => {
                    self.custom.insert(key.clone(), default.clone());
                }
            }
        }
    }

    /// Validate `value` against the current value of `key` and store it.
    ///
    /// Scalars must keep their JSON type. An array is an enum whose first
    /// element is the current selection; `value` must be one of its members
    /// and is moved to the front.
    pub fn set_checked(&mut self, key: &str, value: Value) -> Result<(), BotError> {
        let current = self
            .get(key)
            .ok_or_else(|| BotError::validation(format!("unknown option '{}'", key)))?;

        let next = match current {
            Value::Array(members) => {
                if !members.contains(&value) {
                    return Err(BotError::validation(format!(
                        "'{}' expects one of: {}",
                        key,
                        members
                            .iter()
                            .map(render)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
                let mut reordered = vec![value.clone()];
                reordered.extend(members.into_iter().filter(|m| *m != value));
                Value::Array(reordered)
            }
            current => {
                if type_name(&current) != type_name(&value) {
                    return Err(BotError::validation(format!(
                        "'{}' expects a {} value, got {}",
                        key,
                        type_name(&current),
                        type_name(&value)
                    )));
                }
                value
            }
        };

        self.set_raw(key, next);
        Ok(())
    }
}

fn deep_merge(existing: &mut Value, default: &Value) {
    if let (Value::Object(existing), Value::Object(default)) = (existing, default) {
        for (key, value) in default {
            match existing.get_mut(key) {
                Some(slot) => deep_merge(slot, value),
                None => {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Settings of one group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupSetting {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plugin: BTreeMap<String, PluginOption>,
}

impl GroupSetting {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: BTreeMap::new(),
        }
    }

    /// Whether `plugin` may run in this group; unknown plugins default to applied
    pub fn is_applied(&self, plugin: &str) -> bool {
        self.plugin.get(plugin).map(|o| o.apply).unwrap_or(true)
    }

    pub fn is_locked(&self, plugin: &str) -> bool {
        self.plugin.get(plugin).map(|o| o.lock).unwrap_or(false)
    }
}

/// The whole settings document of one account, keyed by group id
pub type SettingDocument = BTreeMap<String, GroupSetting>;
