use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Manual version advertised by converters and expected from providers.
pub const MANUAL_VERSION: &str = "1.0";

/// JSON-schema subset used for tool inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "ToolSchema::object_type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl ToolSchema {
    fn object_type() -> String {
        "object".to_string()
    }

    /// Empty `{"type": "object"}` schema.
    pub fn object() -> Self {
        Self {
            type_: Self::object_type(),
            properties: None,
            required: None,
            description: None,
            items: None,
            enum_: None,
            format: None,
        }
    }
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self::object()
    }
}

/// A named, schema-described callable exposed by a provider.
///
/// After registration the public name is `"<provider>.<tool>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: ToolSchema,
    #[serde(default)]
    pub outputs: ToolSchema,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            inputs: ToolSchema::object(),
            outputs: ToolSchema::object(),
            tags: Vec::new(),
        }
    }
}

/// A provider's advertised catalog of tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manual {
    pub version: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Manual {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self {
            version: MANUAL_VERSION.to_string(),
            tools,
        }
    }
}

/// Ranking of registered tools against a query string.
#[async_trait]
pub trait ToolSearchStrategy: Send + Sync {
    /// `limit == 0` means unlimited.
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>>;
}
