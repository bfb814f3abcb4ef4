// GraphQL transport: introspection discovery, query/mutation calls.
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::graphql::GraphqlProvider;
use crate::tools::Tool;
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

/// Introspection query listing query- and mutation-type fields.
const INTROSPECTION: &str = r#"
query {
  __schema {
    queryType { fields { name description } }
    mutationType { fields { name description } }
  }
}"#;

pub struct GraphQlTransport {
    client: Client,
    tokens: OAuth2TokenManager,
}

impl GraphQlTransport {
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

    async fn execute(&self, prov: &GraphqlProvider, query: String, variables: Value) -> Result<Value> {
        let mut request = self
            .client
            .post(&prov.url)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                request = request.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            request = self.apply_auth(request, &prov.name(), auth).await?;
        }

        let response = request
            .send()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(UtcpError::transport(
                prov.name(),
                format!("GraphQL request failed: {}", response.status()),
            )
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UtcpError::MalformedResponse(e.to_string()))?;

        if let Some(errors) = body.get("errors").filter(|e| !e.as_array().map_or(true, Vec::is_empty))
        {
            return Err(UtcpError::CallFailed {
                message: "GraphQL reported errors".to_string(),
                payload: Some(errors.clone()),
            }
            .into());
        }

        body.get("data")
            .cloned()
            .ok_or_else(|| UtcpError::MalformedResponse("response has no data member".into()).into())
    }

    /// Build `query ($a: String) { tool(a: $a) }` style documents, typing
    /// every variable as JSON scalars.
    fn build_document(operation: &str, field: &str, args: &HashMap<String, Value>) -> String {
        if args.is_empty() {
            return format!("{} {{ {} }}", operation, field);
        }

        let mut keys: Vec<_> = args.keys().collect();
        keys.sort();
        let decls: Vec<String> = keys
            .iter()
            .map(|k| format!("${}: {}", k, Self::scalar_type(&args[k.as_str()])))
            .collect();
        let bindings: Vec<String> = keys.iter().map(|k| format!("{}: ${}", k, k)).collect();
        format!(
            "{} ({}) {{ {}({}) }}",
            operation,
            decls.join(", "),
            field,
            bindings.join(", ")
        )
    }

    fn scalar_type(value: &Value) -> &'static str {
        match value {
            Value::Bool(_) => "Boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
            Value::Number(_) => "Float",
            _ => "String",
        }
    }

    fn fields_to_tools(raw: Option<&Value>) -> Vec<Tool> {
        raw.and_then(|t| t.get("fields"))
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| {
                        let name = f.get("name")?.as_str()?;
                        let description = f
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Some(Tool::new(name, description))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for GraphQlTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for GraphQlTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let gql_prov = expect_provider::<GraphqlProvider>(prov, "graphql")?;

        let discover = async {
            let data = self
                .execute(gql_prov, INTROSPECTION.to_string(), json!({}))
                .await
                .map_err(|e| UtcpError::discovery(gql_prov.name(), e.to_string()))?;

            let schema = data.get("__schema");
            let mut tools =
                Self::fields_to_tools(schema.and_then(|s| s.get("queryType")));
            tools.extend(Self::fields_to_tools(
                schema.and_then(|s| s.get("mutationType")),
            ));
            Ok(tools)
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let gql_prov = expect_provider::<GraphqlProvider>(prov, "graphql")?;
        self.tokens.forget(&gql_prov.name()).await;
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
        let gql_prov = expect_provider::<GraphqlProvider>(prov, "graphql")?;

        let operation = match gql_prov.operation_type.as_str() {
            "mutation" => "mutation",
            _ => "query",
        };
        let field = local_tool_name(tool_name, &gql_prov.name()).to_string();
        let document = Self::build_document(operation, &field, &args);

        let call = async {
            let data = self
                .execute(gql_prov, document, json!(args))
                .await?;
            let value = data.get(&field).cloned().unwrap_or(data);
            Ok(ToolResult::Value(value))
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
        expect_provider::<GraphqlProvider>(prov, "graphql")?;
        Err(UtcpError::UnsupportedOp(
            "GraphQL subscriptions are not wired into this client".to_string(),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;
    use crate::providers::base::{BaseProvider, ProviderType};
    use axum::{routing::post, Json, Router};
    use std::net::TcpListener;

    fn provider(url: String) -> GraphqlProvider {
        GraphqlProvider {
            base: BaseProvider::new("gql".to_string(), ProviderType::Graphql, None),
            url,
            operation_type: "query".to_string(),
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

    #[test]
    fn document_builder_types_variables() {
        let args = HashMap::from([
            ("city".to_string(), json!("Oslo")),
            ("days".to_string(), json!(3)),
        ]);
        let doc = GraphQlTransport::build_document("query", "forecast", &args);
        assert_eq!(
            doc,
            "query ($city: String, $days: Int) { forecast(city: $city, days: $days) }"
        );

        let empty = GraphQlTransport::build_document("mutation", "reset", &HashMap::new());
        assert_eq!(empty, "mutation { reset }");
    }

    #[tokio::test]
    async fn introspection_lists_query_and_mutation_fields() {
        async fn handler(Json(body): Json<Value>) -> Json<Value> {
            let query = body["query"].as_str().unwrap();
            assert!(query.contains("__schema"));
            Json(json!({
                "data": {
                    "__schema": {
                        "queryType": { "fields": [{ "name": "forecast", "description": "weather" }] },
                        "mutationType": { "fields": [{ "name": "reset", "description": null }] }
                    }
                }
            }))
        }

        let base = spawn(Router::new().route("/", post(handler)));
        let tools = GraphQlTransport::new()
            .register_tool_provider(&CallContext::new(), &provider(base))
            .await
            .unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["forecast", "reset"]);
    }

    #[tokio::test]
    async fn call_unwraps_the_field_and_surfaces_errors() {
        async fn handler(Json(body): Json<Value>) -> Json<Value> {
            let query = body["query"].as_str().unwrap();
            if query.contains("boom") {
                return Json(json!({ "errors": [{ "message": "nope" }] }));
            }
            assert_eq!(body["variables"]["city"], json!("Oslo"));
            Json(json!({ "data": { "forecast": { "temp": -4 } } }))
        }

        let base = spawn(Router::new().route("/", post(handler)));
        let prov = provider(base);
        let transport = GraphQlTransport::new();

        let value = transport
            .call_tool(
                &CallContext::new(),
                "gql.forecast",
                HashMap::from([("city".to_string(), json!("Oslo"))]),
                &prov,
                None,
            )
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!({ "temp": -4 }));

        let err = transport
            .call_tool(&CallContext::new(), "boom", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::CallFailed { payload: Some(_), .. })
        ));
    }
}
