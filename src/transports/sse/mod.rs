// Server-Sent Events transport.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::sse::SseProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name,
    stream::{ChannelStreamResult, StreamResult},
    ClientTransport, ToolResult,
};

/// Sentinel payload that ends an event stream.
const DONE_SENTINEL: &str = "[DONE]";

pub struct SseTransport {
    client: Client,
    tokens: OAuth2TokenManager,
}

impl SseTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            tokens: OAuth2TokenManager::new(),
        }
    }

    async fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        provider_name: &str,
        auth: &AuthConfig,
    ) -> Result<reqwest::RequestBuilder> {
        match auth {
            AuthConfig::ApiKey(api_key) => {
                let location = api_key.location.to_ascii_lowercase();
                match location.as_str() {
                    "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                    "query" => {
                        Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())]))
                    }
                    "cookie" => {
                        let cookie_value = format!("{}={}", api_key.var_name, api_key.api_key);
                        Ok(builder.header(header::COOKIE, cookie_value))
                    }
                    other => Err(UtcpError::Config(format!(
                        "unsupported API key location: {}",
                        other
                    ))
                    .into()),
                }
            }
            AuthConfig::Basic(basic) => {
                Ok(builder.basic_auth(&basic.username, Some(&basic.password)))
            }
            AuthConfig::OAuth2(oauth) => {
                let token = self.tokens.bearer_token(provider_name, oauth).await?;
                Ok(builder.bearer_auth(token))
            }
        }
    }

    /// Parse `data:` lines out of the byte stream and forward each JSON
    /// payload. `[DONE]` or stream end closes the channel.
    fn spawn_sse_reader(
        mut stream: impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
        provider_name: String,
    ) -> mpsc::Receiver<Result<Value, UtcpError>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut data_buf = String::new();

            'outer: while let Some(chunk_res) = stream.next().await {
                match chunk_res {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let mut line = buffer[..pos].to_string();
                            buffer.drain(..=pos);
                            line = line.trim_end_matches('\r').to_string();

                            if let Some(data) = line.strip_prefix("data:") {
                                let data = data.strip_prefix(' ').unwrap_or(data);
                                if data == DONE_SENTINEL {
                                    break 'outer;
                                }
                                if !data_buf.is_empty() {
                                    data_buf.push('\n');
                                }
                                data_buf.push_str(data);
                            } else if line.is_empty() && !data_buf.is_empty() {
                                let parsed = serde_json::from_str::<Value>(&data_buf)
                                    .map_err(|e| UtcpError::MalformedResponse(e.to_string()));
                                data_buf.clear();
                                if tx.send(parsed).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(UtcpError::transport(provider_name, err.to_string())))
                            .await;
                        return;
                    }
                }
            }

            // Flush a trailing event that arrived without a final blank line.
            if !data_buf.is_empty() && data_buf != DONE_SENTINEL {
                let _ = tx
                    .send(
                        serde_json::from_str::<Value>(&data_buf)
                            .map_err(|e| UtcpError::MalformedResponse(e.to_string())),
                    )
                    .await;
            }
        });
        rx
    }

    async fn open_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &SseProvider,
    ) -> Result<Box<dyn StreamResult>> {
        let call_name = local_tool_name(tool_name, &prov.name());
        let url = format!("{}/{}", prov.url.trim_end_matches('/'), call_name);

        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream");
        for (key, value) in &args {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.query(&[(key, text)]);
        }
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                request = request.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            request = self.apply_auth(request, &prov.name(), auth).await?;
        }

        let response = ctx
            .drive(None, async {
                request
                    .send()
                    .await
                    .map_err(|e| UtcpError::transport(prov.name(), e.to_string()).into())
            })
            .await?;
        if !response.status().is_success() {
            return Err(UtcpError::transport(
                prov.name(),
                format!("SSE request failed: {}", response.status()),
            )
            .into());
        }

        let rx = Self::spawn_sse_reader(response.bytes_stream(), prov.name());
        Ok(Box::new(
            ChannelStreamResult::new(rx, None).with_context(ctx.clone()),
        ))
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for SseTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let sse_prov = expect_provider::<SseProvider>(prov, "sse")?;

        let discover = async {
            let mut request = self
                .client
                .get(&sse_prov.url)
                .header(header::ACCEPT, "application/json");
            if let Some(headers) = &sse_prov.headers {
                for (k, v) in headers {
                    request = request.header(k, v);
                }
            }
            if let Some(auth) = &sse_prov.base.auth {
                request = self.apply_auth(request, &sse_prov.name(), auth).await?;
            }

            let response = request
                .send()
                .await
                .map_err(|e| UtcpError::discovery(sse_prov.name(), e.to_string()))?;
            if !response.status().is_success() {
                return Err(UtcpError::discovery(
                    sse_prov.name(),
                    format!("{} returned {}", sse_prov.url, response.status()),
                )
                .into());
            }

            let manual: Manual = response
                .json()
                .await
                .map_err(|e| UtcpError::discovery(sse_prov.name(), e.to_string()))?;
            tracing::debug!(provider = %sse_prov.name(), version = %manual.version, "discovered manual");
            Ok(manual.tools)
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let sse_prov = expect_provider::<SseProvider>(prov, "sse")?;
        self.tokens.forget(&sse_prov.name()).await;
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
        // An event stream is this transport's natural response shape; hand
        // the caller the stream arm instead of buffering it.
        let sse_prov = expect_provider::<SseProvider>(prov, "sse")?;
        let stream = self.open_stream(ctx, tool_name, args, sse_prov).await?;
        Ok(ToolResult::Stream(stream))
    }

    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let sse_prov = expect_provider::<SseProvider>(prov, "sse")?;
        self.open_stream(ctx, tool_name, args, sse_prov).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{BaseProvider, ProviderType};
    use axum::{body::Body, http::Response, routing::get, Json, Router};
    use serde_json::json;
    use std::net::TcpListener;

    fn provider(url: String) -> SseProvider {
        SseProvider {
            base: BaseProvider::new("sse".to_string(), ProviderType::Sse, None),
            url,
            headers: None,
        }
    }

    fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn register_reads_manual_then_stream_yields_events() {
        async fn manual() -> Json<Value> {
            Json(json!({
                "version": "1.0",
                "tools": [{ "name": "ticks", "description": "tick stream" }]
            }))
        }

        async fn ticks(
            headers: axum::http::HeaderMap,
            axum::extract::Query(query): axum::extract::Query<HashMap<String, String>>,
        ) -> Response<Body> {
            assert_eq!(
                headers.get("accept").and_then(|v| v.to_str().ok()),
                Some("text/event-stream")
            );
            assert_eq!(query.get("count").map(String::as_str), Some("2"));
            let stream = tokio_stream::iter(vec![
                Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(
                    b"data: {\"tick\":1}\n\n",
                )),
                Ok(Bytes::from_static(b"data: {\"tick\":2}\n\n")),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ]);
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::wrap_stream(stream))
                .unwrap()
        }

        let base = spawn(Router::new().route("/", get(manual)).route("/ticks", get(ticks)));
        let prov = provider(base);
        let transport = SseTransport::new();

        let tools = transport
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);

        let args = HashMap::from([("count".to_string(), json!(2))]);
        let mut stream = transport
            .call_tool_stream(&CallContext::new(), "sse.ticks", args, &prov)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), Some(json!({"tick": 1})));
        assert_eq!(stream.next().await.unwrap(), Some(json!({"tick": 2})));
        // [DONE] ends the stream even though the body technically continues.
        assert_eq!(stream.next().await.unwrap(), None);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn call_tool_returns_the_stream_arm() {
        async fn events() -> Response<Body> {
            let stream = tokio_stream::iter(vec![Ok::<Bytes, std::convert::Infallible>(
                Bytes::from_static(b"data: {\"v\":1}\n\n"),
            )]);
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::wrap_stream(stream))
                .unwrap()
        }

        let base = spawn(Router::new().route("/events", get(events)));
        let prov = provider(base);
        let result = SseTransport::new()
            .call_tool(&CallContext::new(), "events", HashMap::new(), &prov, None)
            .await
            .unwrap();
        assert!(result.is_stream());

        let mut stream = result.into_stream().unwrap();
        assert_eq!(stream.next().await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_line_data_events_concatenate() {
        async fn events() -> Response<Body> {
            let stream = tokio_stream::iter(vec![Ok::<Bytes, std::convert::Infallible>(
                Bytes::from_static(b"data: {\"a\":\ndata: 1}\n\n"),
            )]);
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::wrap_stream(stream))
                .unwrap()
        }

        let base = spawn(Router::new().route("/joined", get(events)));
        let prov = provider(base);
        let mut stream = SseTransport::new()
            .call_tool_stream(&CallContext::new(), "joined", HashMap::new(), &prov)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), Some(json!({"a": 1})));
    }
}
