// CLI transport: tools behind a local subprocess.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::cli::CliProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

pub struct CliTransport;

impl CliTransport {
    pub fn new() -> Self {
        Self
    }

    fn command_parts(prov: &CliProvider) -> Result<(String, Vec<String>)> {
        let mut parts = prov.command_name.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| UtcpError::Config("empty command name".to_string()))?;
        Ok((program, parts.collect()))
    }

    async fn run(
        prov: &CliProvider,
        extra_args: &[String],
        stdin_input: Option<&str>,
    ) -> Result<String> {
        let (program, mut args) = Self::command_parts(prov)?;
        args.extend_from_slice(extra_args);

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        if let Some(env) = &prov.env_vars {
            for (k, v) in env {
                cmd.env(k, v);
            }
        }
        if let Some(dir) = &prov.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if stdin_input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| UtcpError::transport(prov.name(), format!("{}: {}", program, e)))?;

        if let Some(input) = stdin_input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;

        if !output.status.success() {
            return Err(UtcpError::CallFailed {
                message: format!(
                    "{} exited with status {}",
                    program,
                    output.status.code().unwrap_or(-1)
                ),
                payload: Some(Value::String(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                )),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for CliTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for CliTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let cli_prov = expect_provider::<CliProvider>(prov, "cli")?;

        let stdout = ctx
            .drive(cli_prov.timeout_ms, Self::run(cli_prov, &[], None))
            .await?;
        let manual: Manual = serde_json::from_str(stdout.trim())
            .map_err(|e| UtcpError::discovery(cli_prov.name(), e.to_string()))?;
        tracing::debug!(provider = %cli_prov.name(), version = %manual.version, "discovered manual");
        Ok(manual.tools)
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        expect_provider::<CliProvider>(prov, "cli")?;
        Ok(())
    }

    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        _correlation: Option<&str>,
    ) -> Result<ToolResult> {
        let cli_prov = expect_provider::<CliProvider>(prov, "cli")?;

        let call_name = local_tool_name(tool_name, &cli_prov.name()).to_string();
        let input = serde_json::to_string(&args)?;
        let stdout = ctx
            .drive(
                cli_prov.timeout_ms,
                Self::run(cli_prov, &[call_name], Some(&input)),
            )
            .await?;

        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(ToolResult::Value(Value::Null));
        }
        let value = serde_json::from_str::<Value>(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));
        Ok(ToolResult::Value(value))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<CliProvider>(prov, "cli")?;
        Err(UtcpError::UnsupportedOp("CLI tools do not stream".to_string()).into())
    }
}
