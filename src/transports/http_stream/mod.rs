// Streamable HTTP transport: chunked responses as newline-delimited JSON.
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::http_stream::StreamableHttpProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name,
    stream::{ChannelStreamResult, StreamResult},
    ClientTransport, ToolResult,
};

pub struct StreamableHttpTransport {
    client: Client,
    tokens: OAuth2TokenManager,
}

impl StreamableHttpTransport {
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

    async fn open_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &StreamableHttpProvider,
    ) -> Result<Box<dyn StreamResult>> {
        let call_name = local_tool_name(tool_name, &prov.name());
        let url = format!("{}/{}", prov.url.trim_end_matches('/'), call_name);

        let method_upper = prov.http_method.to_uppercase();
        let mut request = match method_upper.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url).json(&args),
            "PUT" => self.client.put(&url).json(&args),
            other => {
                return Err(
                    UtcpError::Config(format!("unsupported HTTP method: {}", other)).into(),
                )
            }
        };

        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                request = request.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            request = self.apply_auth(request, &prov.name(), auth).await?;
        }

        let provider_name = prov.name();
        let response = ctx
            .drive(None, async {
                request
                    .send()
                    .await
                    .map_err(|e| UtcpError::transport(provider_name.clone(), e.to_string()).into())
            })
            .await?;
        if !response.status().is_success() {
            return Err(UtcpError::transport(
                prov.name(),
                format!("stream request failed: {}", response.status()),
            )
            .into());
        }

        // Split the chunked body on newlines; each line is one JSON value.
        let (tx, rx) = mpsc::channel(16);
        let provider_name = prov.name();
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }
                            let parsed = serde_json::from_str::<Value>(&line)
                                .map_err(|e| UtcpError::MalformedResponse(e.to_string()));
                            if tx.send(parsed).await.is_err() {
                                return;
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
            let trailing = buffer.trim();
            if !trailing.is_empty() {
                let _ = tx
                    .send(
                        serde_json::from_str::<Value>(trailing)
                            .map_err(|e| UtcpError::MalformedResponse(e.to_string())),
                    )
                    .await;
            }
        });

        Ok(Box::new(
            ChannelStreamResult::new(rx, None).with_context(ctx.clone()),
        ))
    }
}

impl Default for StreamableHttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for StreamableHttpTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let http_prov = expect_provider::<StreamableHttpProvider>(prov, "http_stream")?;

        let discover = async {
            let mut request = self.client.get(&http_prov.url);
            if let Some(headers) = &http_prov.headers {
                for (k, v) in headers {
                    request = request.header(k, v);
                }
            }
            if let Some(auth) = &http_prov.base.auth {
                request = self.apply_auth(request, &http_prov.name(), auth).await?;
            }

            let response = request
                .send()
                .await
                .map_err(|e| UtcpError::discovery(http_prov.name(), e.to_string()))?;
            if !response.status().is_success() {
                return Err(UtcpError::discovery(
                    http_prov.name(),
                    format!("{} returned {}", http_prov.url, response.status()),
                )
                .into());
            }

            let manual: Manual = response
                .json()
                .await
                .map_err(|e| UtcpError::discovery(http_prov.name(), e.to_string()))?;
            tracing::debug!(provider = %http_prov.name(), version = %manual.version, "discovered manual");
            Ok(manual.tools)
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let http_prov = expect_provider::<StreamableHttpProvider>(prov, "http_stream")?;
        self.tokens.forget(&http_prov.name()).await;
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
        let http_prov = expect_provider::<StreamableHttpProvider>(prov, "http_stream")?;
        let stream = self.open_stream(ctx, tool_name, args, http_prov).await?;
        Ok(ToolResult::Stream(stream))
    }

    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let http_prov = expect_provider::<StreamableHttpProvider>(prov, "http_stream")?;
        self.open_stream(ctx, tool_name, args, http_prov).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{BaseProvider, ProviderType};
    use axum::{body::Body, http::Response, routing::post, Json, Router};
    use bytes::Bytes;
    use serde_json::json;
    use std::net::TcpListener;

    #[tokio::test]
    async fn chunked_lines_become_stream_elements() {
        async fn chunks(Json(payload): Json<Value>) -> Response<Body> {
            assert_eq!(payload["n"], json!(2));
            let stream = tokio_stream::iter(vec![
                Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(b"{\"part\":1}\n")),
                Ok(Bytes::from_static(b"{\"part\":2}\n")),
            ]);
            Response::builder()
                .body(Body::wrap_stream(stream))
                .unwrap()
        }

        let app = Router::new().route("/feed", post(chunks));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        let prov = StreamableHttpProvider {
            base: BaseProvider::new("hs".to_string(), ProviderType::HttpStream, None),
            url: format!("http://{}", addr),
            http_method: "POST".to_string(),
            headers: None,
        };

        let result = StreamableHttpTransport::new()
            .call_tool(
                &CallContext::new(),
                "hs.feed",
                HashMap::from([("n".to_string(), json!(2))]),
                &prov,
                None,
            )
            .await
            .unwrap();
        assert!(result.is_stream());

        let mut stream = result.into_stream().unwrap();
        assert_eq!(stream.next().await.unwrap(), Some(json!({"part": 1})));
        assert_eq!(stream.next().await.unwrap(), Some(json!({"part": 2})));
        assert_eq!(stream.next().await.unwrap(), None);
    }
}
