//! Stringly-typed config sidecar
//!
//! Every hyperparameter and templating convention reaches the native runtime
//! as a `(key, value)` pair of strings; parsing them back is the runtime's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Flat string-keyed mapping as read from a framework config file
pub type ConfigMap = serde_json::Map<String, Value>;

/// Render a config value as the text the native runtime expects.
///
/// Strings are passed verbatim, booleans use the `True`/`False` spelling,
/// null becomes `None` and nested structures are written as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Ordered key/value block; last write wins, first insertion fixes position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlock {
    entries: Vec<ConfigEntry>,
    index: HashMap<String, usize>,
}

impl ConfigBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &ConfigMap) -> Self {
        let mut block = Self::new();
        block.merge_map(map);
        block
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].value = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push(ConfigEntry { key, value });
            }
        }
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: &Value) {
        self.set(key, stringify(value));
    }

    /// Overlay every key of `map`, stringifying values
    pub fn merge_map(&mut self, map: &ConfigMap) {
        for (key, value) in map {
            self.set_value(key.as_str(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.entries[i].value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Config of one adapter (e.g. a LoRA) attached to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub name: String,
    pub entries: ConfigBlock,
}

impl AdapterConfig {
    pub fn from_map(name: impl Into<String>, map: &ConfigMap) -> Self {
        Self { name: name.into(), entries: ConfigBlock::from_map(map) }
    }
}

/// The four conversational template strings a caller may override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateStrings {
    pub pre_prompt: Option<String>,
    pub user_role: Option<String>,
    pub bot_role: Option<String>,
    pub history_sep: Option<String>,
}

impl TemplateStrings {
    /// Non-empty template strings, in declaration order
    pub fn present(&self) -> impl Iterator<Item = &str> {
        [&self.pre_prompt, &self.user_role, &self.bot_role, &self.history_sep]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Write caller overrides into `block`.
    ///
    /// An empty history separator is not written, so the model's own default
    /// stays in effect.
    pub fn apply(&self, block: &mut ConfigBlock) {
        if let Some(v) = &self.pre_prompt {
            block.set("pre_prompt", v.as_str());
        }
        if let Some(v) = &self.user_role {
            block.set("user_role", v.as_str());
        }
        if let Some(v) = &self.bot_role {
            block.set("bot_role", v.as_str());
        }
        if let Some(v) = self.history_sep.as_deref().filter(|s| !s.is_empty()) {
            block.set("history_sep", v);
        }
    }
}
