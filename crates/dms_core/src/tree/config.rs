//! Engine settings and declarative tree configuration.
//!
//! A `TreeConfig` is plain JSON:
//!
//! ```json
//! { "items": [
//!   { "name": "parcels", "kind": "domain_unit", "count": 3, "items": [
//!     { "name": "area", "kind": "attribute", "domain": ".", "value_type": "float64",
//!       "storage": { "kind": "generic_file", "location": "%projDir%/parcels.json",
//!                    "read_only": true } }
//!   ] }
//! ] }
//! ```
//!
//! Relative item paths (attribute domains, rule arguments) resolve against
//! the item's parent: `.` is the parent itself, `..` one level above it.

use crate::model::item::ValueType;
use crate::storage::{PlaceholderTable, StorageKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Session settings supplied by the embedding application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub project_dir: PathBuf,
    pub config_name: String,
    /// Extra `%name%` placeholders.
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn new(project_dir: impl Into<PathBuf>, config_name: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            config_name: config_name.into(),
            placeholders: BTreeMap::new(),
        }
    }

    pub fn with_placeholder(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.placeholders.insert(name.into(), value.into());
        self
    }

    /// Built-in plus user placeholders; user entries may not shadow built-ins.
    pub fn placeholder_table(&self) -> PlaceholderTable {
        let mut table = PlaceholderTable::default();
        for (name, value) in &self.placeholders {
            table.insert(name.clone(), value.clone());
        }
        let builtins = PlaceholderTable::new(&self.project_dir, &self.config_name);
        for name in [
            crate::storage::location::PLACEHOLDER_PROJECT_DIR,
            crate::storage::location::PLACEHOLDER_CONFIG_NAME,
        ] {
            if let Some(value) = builtins.get(name) {
                table.insert(name, value);
            }
        }
        table
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl TreeConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ItemKindConfig,
    /// Expression text handed to the rule resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub keep_data: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKindConfig {
    Container,
    DomainUnit {
        #[serde(default)]
        count: Option<u32>,
        #[serde(default = "default_element_type")]
        element_type: ValueType,
    },
    Attribute {
        /// Path of the domain unit.
        domain: String,
        value_type: ValueType,
        #[serde(default)]
        tile_size: Option<u32>,
    },
}

fn default_element_type() -> ValueType {
    ValueType::UInt32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Location with optional `%placeholder%`s.
    pub location: String,
    /// Role inside the storage; defaults to the item name.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}
