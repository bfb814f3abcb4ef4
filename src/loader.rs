// Provider loading from JSON files.
use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config::UtcpClientConfig;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::cli::CliProvider;
use crate::providers::graphql::GraphqlProvider;
use crate::providers::grpc::GrpcProvider;
use crate::providers::http::HttpProvider;
use crate::providers::http_stream::StreamableHttpProvider;
use crate::providers::mcp::McpProvider;
use crate::providers::sse::SseProvider;
use crate::providers::tcp::TcpProvider;
use crate::providers::text::TextProvider;
use crate::providers::udp::UdpProvider;
use crate::providers::webrtc::WebRtcProvider;
use crate::providers::websocket::WebSocketProvider;

/// Load providers from a JSON file: an array of provider objects, or a single
/// bare object. `${NAME}` references are substituted before parsing.
pub async fn load_providers_from_file(
    path: impl AsRef<Path>,
    config: &UtcpClientConfig,
) -> Result<Vec<Arc<dyn Provider>>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| UtcpError::Config(format!("cannot read providers file: {}", e)))?;
    let json: Value = serde_json::from_str(&contents)
        .map_err(|e| UtcpError::Config(format!("providers file is not valid JSON: {}", e)))?;

    let provider_values = match json {
        Value::Array(arr) => arr,
        Value::Object(_) => vec![json],
        _ => {
            return Err(
                UtcpError::Config("providers file root must be an array or object".into()).into(),
            )
        }
    };

    let mut providers = Vec::new();
    for mut provider_value in provider_values {
        substitute_variables(&mut provider_value, config).await?;
        providers.push(parse_provider(provider_value)?);
    }
    Ok(providers)
}

/// Parse one provider object, dispatching on the `provider_type` field.
pub fn parse_provider(value: Value) -> Result<Arc<dyn Provider>> {
    let kind = value
        .get("provider_type")
        .and_then(Value::as_str)
        .ok_or_else(|| UtcpError::Config("provider is missing 'provider_type'".to_string()))?
        .to_string();

    fn decode<P: serde::de::DeserializeOwned + Provider + 'static>(
        value: Value,
    ) -> Result<Arc<dyn Provider>> {
        let provider: P = serde_json::from_value(value)
            .map_err(|e| UtcpError::Config(format!("invalid provider definition: {}", e)))?;
        Ok(Arc::new(provider))
    }

    match kind.as_str() {
        "http" => decode::<HttpProvider>(value),
        "sse" => decode::<SseProvider>(value),
        "http_stream" => decode::<StreamableHttpProvider>(value),
        "cli" => decode::<CliProvider>(value),
        "websocket" => decode::<WebSocketProvider>(value),
        "grpc" => decode::<GrpcProvider>(value),
        "graphql" => decode::<GraphqlProvider>(value),
        "tcp" => decode::<TcpProvider>(value),
        "udp" => decode::<UdpProvider>(value),
        "webrtc" => decode::<WebRtcProvider>(value),
        "mcp" => decode::<McpProvider>(value),
        "text" => decode::<TextProvider>(value),
        other => Err(UtcpError::UnknownProviderKind(other.to_string()).into()),
    }
}

/// Replace `${NAME}` references in every string value. An unresolvable
/// reference fails the load rather than leaking the placeholder downstream.
async fn substitute_variables(value: &mut Value, config: &UtcpClientConfig) -> Result<()> {
    let reference = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    substitute_inner(value, config, &reference).await
}

fn substitute_inner<'a>(
    value: &'a mut Value,
    config: &'a UtcpClientConfig,
    reference: &'a Regex,
) -> futures::future::BoxFuture<'a, Result<()>> {
    use futures::FutureExt;
    async move {
        match value {
            Value::String(s) => {
                let mut result = s.clone();
                for caps in reference.captures_iter(s) {
                    let name = &caps[1];
                    let replacement = config
                        .get_variable(name)
                        .await
                        .ok_or_else(|| UtcpError::UnresolvedVariable(name.to_string()))?;
                    result = result.replace(&caps[0], &replacement);
                }
                *s = result;
            }
            Value::Object(obj) => {
                for (_, v) in obj.iter_mut() {
                    substitute_inner(v, config, reference).await?;
                }
            }
            Value::Array(arr) => {
                for item in arr.iter_mut() {
                    substitute_inner(item, config, reference).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
    .boxed()
}
