use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::tools::{Manual, Tool, ToolSchema, MANUAL_VERSION};

/// Translates an OpenAPI document into a tool manual.
///
/// Only operations carrying an `operationId` become tools; the id is the tool
/// name, unprefixed (the registry adds the provider prefix later).
pub struct OpenApiConverter {
    document: Value,
    source_url: Option<String>,
}

impl OpenApiConverter {
    pub fn new(document: Value, source_url: Option<String>) -> Self {
        Self {
            document,
            source_url,
        }
    }

    /// Fetch a document over HTTP. Bodies that fail JSON parsing are retried
    /// as YAML, which many published specs use.
    pub async fn new_from_url(url: &str) -> Result<Self> {
        let response = reqwest::get(url).await?;
        if !response.status().is_success() {
            return Err(anyhow!("{} returned {}", url, response.status()));
        }
        let body = response.text().await?;

        let document = match serde_json::from_str::<Value>(&body) {
            Ok(doc) => doc,
            Err(_) => serde_yaml::from_str::<Value>(&body)
                .map_err(|e| anyhow!("document is neither JSON nor YAML: {}", e))?,
        };
        Ok(Self::new(document, Some(url.to_string())))
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    pub fn convert(&self) -> Manual {
        let mut tools = Vec::new();
        let mut seen_ids = HashSet::new();

        if let Some(paths) = self.document.get("paths").and_then(Value::as_object) {
            for (path, raw_item) in paths {
                let Some(path_item) = raw_item.as_object() else {
                    continue;
                };
                for (method, raw_op) in path_item {
                    let lower = method.to_ascii_lowercase();
                    if !matches!(lower.as_str(), "get" | "post" | "put" | "delete" | "patch") {
                        continue;
                    }
                    let Some(op) = raw_op.as_object() else {
                        continue;
                    };
                    let Some(op_id) = op.get("operationId").and_then(Value::as_str) else {
                        continue;
                    };

                    if !seen_ids.insert(op_id.to_string()) {
                        warn!(
                            operation_id = op_id,
                            path, method, "duplicate operationId dropped"
                        );
                        continue;
                    }

                    tools.push(self.create_tool(op_id, op));
                }
            }
        }

        Manual {
            version: MANUAL_VERSION.to_string(),
            tools,
        }
    }

    fn create_tool(&self, op_id: &str, op: &Map<String, Value>) -> Tool {
        let description = op
            .get("summary")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| op.get("description").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        let tags = op
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Tool {
            name: op_id.to_string(),
            description,
            inputs: self.extract_inputs(op),
            outputs: self.extract_outputs(op),
            tags,
        }
    }

    /// Synthesize one object schema: a property per operation parameter plus
    /// a `body` property for the JSON request body.
    fn extract_inputs(&self, op: &Map<String, Value>) -> ToolSchema {
        let mut properties = HashMap::new();
        let mut required = Vec::new();

        if let Some(params) = op.get("parameters").and_then(Value::as_array) {
            for raw in params {
                let param = self.resolve_schema(raw.clone());
                let Some(name) = param.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let schema = param
                    .get("schema")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({ "type": "string" }));
                if param.get("required").and_then(Value::as_bool) == Some(true) {
                    required.push(name.to_string());
                }
                properties.insert(name.to_string(), schema);
            }
        }

        if let Some(body) = op.get("requestBody") {
            let body = self.resolve_schema(body.clone());
            if let Some(schema) = body
                .pointer("/content/application~1json/schema")
                .cloned()
            {
                properties.insert("body".to_string(), self.resolve_schema(schema));
                if body.get("required").and_then(Value::as_bool) == Some(true) {
                    required.push("body".to_string());
                }
            }
        }

        ToolSchema {
            properties: (!properties.is_empty()).then_some(properties),
            required: (!required.is_empty()).then_some(required),
            ..ToolSchema::object()
        }
    }

    /// The 2xx `application/json` schema, else an empty object schema.
    fn extract_outputs(&self, op: &Map<String, Value>) -> ToolSchema {
        let Some(responses) = op.get("responses").and_then(Value::as_object) else {
            return ToolSchema::object();
        };

        for (status, raw) in responses {
            if !status.starts_with('2') {
                continue;
            }
            let response = self.resolve_schema(raw.clone());
            let schema = response
                .pointer("/content/application~1json/schema")
                .cloned()
                // OpenAPI 2.0 keeps the schema directly on the response.
                .or_else(|| response.get("schema").cloned());
            if let Some(schema) = schema {
                let resolved = self.resolve_schema(schema);
                if let Ok(parsed) = serde_json::from_value::<ToolSchema>(resolved) {
                    return parsed;
                }
            }
        }

        ToolSchema::object()
    }

    fn resolve_ref(&self, reference: &str) -> Option<Value> {
        let pointer = reference.strip_prefix('#')?;
        self.document.pointer(pointer).cloned()
    }

    /// Recursively inline local `$ref`s; foreign refs are left untouched.
    fn resolve_schema(&self, schema: Value) -> Value {
        match schema {
            Value::Object(map) => {
                if let Some(Value::String(reference)) = map.get("$ref") {
                    if let Some(resolved) = self.resolve_ref(reference) {
                        return self.resolve_schema(resolved);
                    }
                    return Value::Object(map);
                }

                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k, self.resolve_schema(v));
                }
                Value::Object(out)
            }
            Value::Array(arr) => Value::Array(
                arr.into_iter()
                    .map(|item| self.resolve_schema(item))
                    .collect(),
            ),
            other => other,
        }
    }
}
