// Text transport: local template rendering, no network.
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::text::TextProvider;
use crate::tools::Tool;
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

pub struct TextTransport {
    placeholder: Regex,
}

impl TextTransport {
    pub fn new() -> Self {
        Self {
            // Matches `{{.key}}` placeholders.
            placeholder: Regex::new(r"\{\{\.([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap(),
        }
    }

    fn render(&self, template: &str, args: &HashMap<String, Value>) -> Result<String> {
        let mut missing = None;
        let rendered = self.placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match args.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(key) => Err(UtcpError::call_failed(format!(
                "missing template argument '{}'",
                key
            ))
            .into()),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl Default for TextTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for TextTransport {
    async fn register_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let text_prov = expect_provider::<TextProvider>(prov, "text")?;

        let mut names: Vec<&String> = text_prov.templates.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| Tool::new(name.clone(), format!("Renders the '{}' template", name)))
            .collect())
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        expect_provider::<TextProvider>(prov, "text")?;
        Ok(())
    }

    async fn call_tool(
        &self,
        _ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        _correlation: Option<&str>,
    ) -> Result<ToolResult> {
        let text_prov = expect_provider::<TextProvider>(prov, "text")?;

        let call_name = local_tool_name(tool_name, &text_prov.name());
        let template = text_prov
            .templates
            .get(call_name)
            .ok_or_else(|| UtcpError::ToolNotFound(tool_name.to_string()))?;

        let rendered = self.render(template, &args)?;
        Ok(ToolResult::Value(Value::String(rendered)))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<TextProvider>(prov, "text")?;
        Err(UtcpError::UnsupportedOp("text templates do not stream".to_string()).into())
    }
}
