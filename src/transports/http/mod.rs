use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::openapi::OpenApiConverter;
use crate::providers::base::Provider;
use crate::providers::http::HttpProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, stream::StreamResult, ClientTransport, ToolResult,
};

pub struct HttpClientTransport {
    client: Client,
    tokens: OAuth2TokenManager,
}

impl HttpClientTransport {
    pub fn new() -> Self {
        // Pooled client shared by every provider of this kind.
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .gzip(true)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
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

    /// Move `header_fields` args out of the body and wrap the rest in
    /// `body_field` when the provider asks for it.
    fn split_payload(
        prov: &HttpProvider,
        mut args: HashMap<String, Value>,
    ) -> (HashMap<String, String>, Value) {
        let mut headers = HashMap::new();
        if let Some(header_fields) = &prov.header_fields {
            for field in header_fields {
                if let Some(value) = args.remove(field) {
                    let text = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    headers.insert(field.clone(), text);
                }
            }
        }

        let body = match &prov.body_field {
            Some(field) => serde_json::json!({ field: args }),
            None => serde_json::json!(args),
        };
        (headers, body)
    }
}

impl Default for HttpClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let http_prov = expect_provider::<HttpProvider>(prov, "http")?;

        let discover = async {
            let mut request = self.client.get(&http_prov.url);
            if let Some(headers) = &http_prov.headers {
                for (key, value) in headers {
                    request = request.header(key, value);
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

            let body: Value = response
                .json()
                .await
                .map_err(|e| UtcpError::discovery(http_prov.name(), e.to_string()))?;

            // A UTCP manual wins; any other JSON document is assumed OpenAPI.
            if body.get("tools").is_some() {
                let manual: Manual = serde_json::from_value(body)
                    .map_err(|e| UtcpError::discovery(http_prov.name(), e.to_string()))?;
                debug!(provider = %http_prov.name(), version = %manual.version, "discovered manual");
                return Ok(manual.tools);
            }

            debug!(provider = %http_prov.name(), "discovery document is not a manual; trying OpenAPI");
            let manual =
                OpenApiConverter::new(body, Some(http_prov.url.clone())).convert();
            if manual.tools.is_empty() {
                return Err(UtcpError::discovery(
                    http_prov.name(),
                    "document is neither a manual nor a usable OpenAPI spec",
                )
                .into());
            }
            Ok(manual.tools)
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let http_prov = expect_provider::<HttpProvider>(prov, "http")?;
        self.tokens.forget(&http_prov.name()).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        ctx: &CallContext,
        _tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        _correlation: Option<&str>,
    ) -> Result<ToolResult> {
        let http_prov = expect_provider::<HttpProvider>(prov, "http")?;

        let call = async {
            // Substitute `{param}` URL placeholders from args first.
            let mut url = http_prov.url.clone();
            let mut args = args;
            args.retain(|key, value| {
                let placeholder = format!("{{{}}}", key);
                if url.contains(&placeholder) {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    url = url.replace(&placeholder, &text);
                    false
                } else {
                    true
                }
            });

            let method_upper = http_prov.http_method.to_uppercase();
            let mut request = match method_upper.as_str() {
                "GET" => self.client.get(&url),
                "POST" => self.client.post(&url),
                "PUT" => self.client.put(&url),
                "DELETE" => self.client.delete(&url),
                "PATCH" => self.client.patch(&url),
                method => {
                    return Err(UtcpError::Config(format!(
                        "unsupported HTTP method: {}",
                        method
                    ))
                    .into())
                }
            };

            if let Some(headers) = &http_prov.headers {
                for (key, value) in headers {
                    request = request.header(key, value);
                }
            }
            if let Some(auth) = &http_prov.base.auth {
                request = self.apply_auth(request, &http_prov.name(), auth).await?;
            }

            let (dynamic_headers, body) = Self::split_payload(http_prov, args);
            for (key, value) in &dynamic_headers {
                request = request.header(key, value);
            }

            if method_upper == "GET" {
                if let Value::Object(map) = &body {
                    for (key, value) in map {
                        let text = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        request = request.query(&[(key, text)]);
                    }
                }
            } else {
                request = request.json(&body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| UtcpError::transport(http_prov.name(), e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let payload = response.json::<Value>().await.ok();
                return Err(UtcpError::CallFailed {
                    message: format!("HTTP request failed with status {}", status),
                    payload,
                }
                .into());
            }

            let result: Value = response
                .json()
                .await
                .map_err(|e| UtcpError::MalformedResponse(e.to_string()))?;
            Ok(ToolResult::Value(result))
        };

        ctx.drive(None, call).await
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<HttpProvider>(prov, "http")?;
        Err(UtcpError::UnsupportedOp(
            "plain HTTP does not stream; use an sse or http_stream provider".to_string(),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, AuthType, BasicAuth};
    use crate::errors::as_utcp_error;
    use crate::providers::base::{BaseProvider, ProviderType};
    use axum::{extract::Json, routing::get, routing::post, Router};
    use serde_json::json;
    use std::net::TcpListener;

    fn provider(url: String, method: &str) -> HttpProvider {
        HttpProvider {
            base: BaseProvider::new("http".to_string(), ProviderType::Http, None),
            http_method: method.to_string(),
            url,
            content_type: None,
            headers: None,
            body_field: None,
            header_fields: None,
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
    async fn apply_auth_handles_api_key_locations() {
        let transport = HttpClientTransport::new();

        let header_auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".to_string(),
            var_name: "X-Key".to_string(),
            location: "header".to_string(),
        });
        let request = transport
            .apply_auth(
                reqwest::Client::new().get("http://example.com"),
                "p",
                &header_auth,
            )
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers().get("X-Key").unwrap(), "secret");

        let query_auth = AuthConfig::ApiKey(ApiKeyAuth {
            auth_type: AuthType::ApiKey,
            api_key: "secret".to_string(),
            var_name: "key".to_string(),
            location: "query".to_string(),
        });
        let request = transport
            .apply_auth(
                reqwest::Client::new().get("http://example.com"),
                "p",
                &query_auth,
            )
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.url().query(), Some("key=secret"));
    }

    #[tokio::test]
    async fn apply_auth_sets_basic_auth_header() {
        let transport = HttpClientTransport::new();
        let auth = AuthConfig::Basic(BasicAuth::new("user".into(), "pass".into()));
        let request = transport
            .apply_auth(reqwest::Client::new().get("http://example.com"), "p", &auth)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[tokio::test]
    async fn register_parses_manual_and_call_posts_args() {
        async fn manual_handler() -> Json<Value> {
            Json(json!({
                "version": "1.0",
                "tools": [{ "name": "greet", "description": "says hello" }]
            }))
        }
        async fn call_handler(Json(payload): Json<Value>) -> Json<Value> {
            Json(json!({ "echo": payload }))
        }

        let base = spawn(
            Router::new()
                .route("/", get(manual_handler))
                .route("/", post(call_handler)),
        );
        let prov = provider(base, "POST");
        let transport = HttpClientTransport::new();

        let tools = transport
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");

        let args = HashMap::from([("name".to_string(), json!("http"))]);
        let result = transport
            .call_tool(&CallContext::new(), "greet", args.clone(), &prov, None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({ "echo": json!(args) }));
    }

    #[tokio::test]
    async fn register_falls_back_to_openapi() {
        async fn spec_handler() -> Json<Value> {
            Json(json!({
                "openapi": "3.0.0",
                "paths": {
                    "/ping": { "get": { "operationId": "ping", "summary": "Ping" } }
                }
            }))
        }

        let base = spawn(Router::new().route("/", get(spec_handler)));
        let prov = provider(base, "GET");
        let tools = HttpClientTransport::new()
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
    }

    #[tokio::test]
    async fn non_success_status_is_call_failed() {
        async fn failing() -> (axum::http::StatusCode, Json<Value>) {
            (
                axum::http::StatusCode::BAD_GATEWAY,
                Json(json!({ "detail": "backend down" })),
            )
        }

        let base = spawn(Router::new().route("/", post(failing)));
        let prov = provider(base, "POST");
        let err = HttpClientTransport::new()
            .call_tool(&CallContext::new(), "x", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::CallFailed { payload: Some(p), .. })
                if p["detail"] == json!("backend down")
        ));
    }

    #[tokio::test]
    async fn url_path_params_come_from_args() {
        async fn by_id(axum::extract::Path(id): axum::extract::Path<String>) -> Json<Value> {
            Json(json!({ "id": id }))
        }

        let base = spawn(Router::new().route("/items/:id", get(by_id)));
        let prov = provider(format!("{}/items/{{item}}", base), "GET");
        let result = HttpClientTransport::new()
            .call_tool(
                &CallContext::new(),
                "get_item",
                HashMap::from([("item".to_string(), json!("42"))]),
                &prov,
                None,
            )
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({ "id": "42" }));
    }
}
