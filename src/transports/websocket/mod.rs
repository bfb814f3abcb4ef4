// WebSocket transport: one-shot dial for discovery, one long-lived
// multiplexed connection per provider for calls.
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, Request},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::websocket::WebSocketProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name,
    stream::{ChannelStreamResult, StreamResult},
    ClientTransport, ToolResult,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type CallSender = mpsc::Sender<Result<Value, UtcpError>>;

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<WsConnection>>>>;

/// One live connection to a provider. The background reader owns the read
/// half and routes frames to per-call channels by id.
struct WsConnection {
    provider_name: String,
    sink: Mutex<WsSink>,
    /// `None` once the socket died; no new calls may be enrolled.
    calls: std::sync::Mutex<Option<HashMap<String, CallSender>>>,
    next_id: AtomicU64,
}

impl WsConnection {
    fn new(provider_name: String, sink: WsSink) -> Self {
        Self {
            provider_name,
            sink: Mutex::new(sink),
            calls: std::sync::Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn is_alive(&self) -> bool {
        self.calls.lock().unwrap().is_some()
    }

    /// Enroll a call channel; fails on a dead connection.
    fn enroll(&self, id: &str, tx: CallSender) -> Result<(), UtcpError> {
        let mut calls = self.calls.lock().unwrap();
        match calls.as_mut() {
            Some(map) => {
                map.insert(id.to_string(), tx);
                Ok(())
            }
            None => Err(UtcpError::transport(
                self.provider_name.clone(),
                "connection closed",
            )),
        }
    }

    fn remove_call(&self, id: &str) -> Option<CallSender> {
        self.calls
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|map| map.remove(id))
    }

    fn sender_for(&self, id: &str) -> Option<CallSender> {
        self.calls
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|map| map.get(id).cloned())
    }

    /// Mark the connection dead and fail every in-flight call.
    async fn fail_all(&self, err: UtcpError) {
        let pending = self.calls.lock().unwrap().take();
        if let Some(map) = pending {
            for (_, tx) in map {
                let _ = tx.send(Err(err.clone())).await;
            }
        }
    }

    /// Route one inbound frame. Frames follow `{id, value? | error? | end?}`.
    async fn route_frame(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            debug!(provider = %self.provider_name, "dropping non-JSON websocket frame");
            return;
        };
        let Some(id) = frame.get("id").map(frame_id_key) else {
            debug!(provider = %self.provider_name, "dropping websocket frame without id");
            return;
        };

        if let Some(error) = frame.get("error") {
            if let Some(tx) = self.remove_call(&id) {
                let _ = tx
                    .send(Err(UtcpError::CallFailed {
                        message: error
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| error.to_string()),
                        payload: Some(error.clone()),
                    }))
                    .await;
            }
            return;
        }

        if let Some(value) = frame.get("value") {
            if let Some(tx) = self.sender_for(&id) {
                let _ = tx.send(Ok(value.clone())).await;
            }
        }

        if frame.get("end").and_then(Value::as_bool) == Some(true) {
            // Dropping the sender closes the call's channel: EOS.
            self.remove_call(&id);
        }
    }

    /// Drop the pending entry and tell the server to stop, best effort.
    fn abandon_call(self: &Arc<Self>, id: String) {
        if self.remove_call(&id).is_none() {
            return; // already terminated by the server
        }
        let conn = self.clone();
        tokio::spawn(async move {
            let frame = serde_json::json!({ "id": frame_id_value(&id), "cancel": true });
            let mut sink = conn.sink.lock().await;
            let _ = sink.send(Message::Text(frame.to_string())).await;
        });
    }
}

/// Frames may carry numeric or string ids; both index the same call table.
fn frame_id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn frame_id_value(key: &str) -> Value {
    match key.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(key.to_string()),
    }
}

pub struct WebSocketTransport {
    connections: ConnectionMap,
    tokens: OAuth2TokenManager,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            tokens: OAuth2TokenManager::new(),
        }
    }

    fn apply_auth_to_url(url: &str, auth: &AuthConfig) -> Result<String> {
        if let AuthConfig::ApiKey(api_key) = auth {
            if api_key.location.eq_ignore_ascii_case("query") {
                let mut parsed = Url::parse(url)?;
                parsed
                    .query_pairs_mut()
                    .append_pair(&api_key.var_name, &api_key.api_key);
                return Ok(parsed.to_string());
            }
        }
        Ok(url.to_string())
    }

    async fn apply_auth_headers(
        &self,
        prov: &WebSocketProvider,
        req: &mut Request<()>,
        auth: &AuthConfig,
    ) -> Result<()> {
        match auth {
            AuthConfig::ApiKey(api_key) => {
                let location = api_key.location.to_ascii_lowercase();
                if location == "header" {
                    let name = HeaderName::from_str(&api_key.var_name)?;
                    req.headers_mut()
                        .insert(name, HeaderValue::from_str(&api_key.api_key)?);
                } else if location == "cookie" {
                    let cookie_val = format!("{}={}", api_key.var_name, api_key.api_key);
                    req.headers_mut()
                        .insert("cookie", HeaderValue::from_str(&cookie_val)?);
                }
                Ok(())
            }
            AuthConfig::Basic(basic) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", basic.username, basic.password));
                req.headers_mut().insert(
                    "authorization",
                    HeaderValue::from_str(&format!("Basic {}", encoded))?,
                );
                Ok(())
            }
            AuthConfig::OAuth2(oauth) => {
                let token = self.tokens.bearer_token(&prov.name(), oauth).await?;
                req.headers_mut().insert(
                    "authorization",
                    HeaderValue::from_str(&format!("Bearer {}", token))?,
                );
                Ok(())
            }
        }
    }

    async fn build_request(&self, prov: &WebSocketProvider, url: &str) -> Result<Request<()>> {
        let mut url = url.to_string();
        if let Some(auth) = &prov.base.auth {
            url = Self::apply_auth_to_url(&url, auth)?;
        }

        let mut req = url.into_client_request()?;
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                let name = HeaderName::from_str(k)?;
                req.headers_mut().insert(name, HeaderValue::from_str(v)?);
            }
        }
        if let Some(proto) = &prov.protocol {
            req.headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(proto)?);
        }
        if let Some(auth) = &prov.base.auth {
            self.apply_auth_headers(prov, &mut req, auth).await?;
        }
        Ok(req)
    }

    /// URL for the long-lived call connection: the discovery URL without its
    /// `/tools` suffix.
    fn call_url(prov: &WebSocketProvider) -> String {
        let base = prov.url.trim_end_matches('/');
        base.strip_suffix("/tools").unwrap_or(base).to_string()
    }

    /// Fetch the live connection for a provider, dialing if needed.
    async fn connection_for(&self, prov: &WebSocketProvider) -> Result<Arc<WsConnection>> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&prov.name()) {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
            connections.remove(&prov.name());
        }

        let req = self.build_request(prov, &Self::call_url(prov)).await?;
        let (ws_stream, _) = connect_async(req)
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        let (sink, source) = ws_stream.split();

        let conn = Arc::new(WsConnection::new(prov.name(), sink));
        connections.insert(prov.name(), conn.clone());
        spawn_reader(conn.clone(), source, self.connections.clone());
        Ok(conn)
    }

    /// Enroll a fresh call on the provider's connection and send its request
    /// frame. Returns the connection, call id, and receive channel.
    async fn open_call(
        &self,
        prov: &WebSocketProvider,
        tool_name: &str,
        args: &HashMap<String, Value>,
        correlation: Option<&str>,
    ) -> Result<(Arc<WsConnection>, String, mpsc::Receiver<Result<Value, UtcpError>>)> {
        let conn = self.connection_for(prov).await?;

        let id_key = match correlation {
            Some(c) => c.to_string(),
            None => conn.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
        };
        let (tx, rx) = mpsc::channel(64);
        conn.enroll(&id_key, tx)?;

        let frame = serde_json::json!({
            "id": frame_id_value(&id_key),
            "tool": local_tool_name(tool_name, &prov.name()),
            "args": args,
        });
        let send_result = {
            let mut sink = conn.sink.lock().await;
            sink.send(Message::Text(frame.to_string())).await
        };
        if let Err(e) = send_result {
            conn.remove_call(&id_key);
            return Err(UtcpError::transport(prov.name(), e.to_string()).into());
        }

        Ok((conn, id_key, rx))
    }

    async fn close_connection(&self, provider_name: &str) {
        let conn = self.connections.lock().await.remove(provider_name);
        if let Some(conn) = conn {
            conn.fail_all(UtcpError::transport(provider_name, "connection closed"))
                .await;
            let mut sink = conn.sink.lock().await;
            let _ = sink.close().await;
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(conn: Arc<WsConnection>, mut source: WsSource, connections: ConnectionMap) {
    tokio::spawn(async move {
        let mut reason = "connection closed by peer".to_string();
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Text(text)) => conn.route_frame(&text).await,
                Ok(Message::Binary(bin)) => {
                    if let Ok(text) = String::from_utf8(bin) {
                        conn.route_frame(&text).await;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    reason = e.to_string();
                    break;
                }
            }
        }

        conn.fail_all(UtcpError::transport(conn.provider_name.clone(), reason))
            .await;

        // Drop the map entry so the next call re-dials, unless a newer
        // connection already replaced this one.
        let mut map = connections.lock().await;
        if let Some(current) = map.get(&conn.provider_name) {
            if Arc::ptr_eq(current, &conn) {
                map.remove(&conn.provider_name);
            }
        }
    });
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let ws_prov = expect_provider::<WebSocketProvider>(prov, "websocket")?;

        let discover = async {
            let req = self.build_request(ws_prov, &ws_prov.url).await?;
            let (mut ws_stream, _) = connect_async(req)
                .await
                .map_err(|e| UtcpError::discovery(ws_prov.name(), e.to_string()))?;

            ws_stream
                .send(Message::Text("manual".to_string()))
                .await
                .map_err(|e| UtcpError::discovery(ws_prov.name(), e.to_string()))?;

            let reply = loop {
                match ws_stream.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                        Ok(text) => break text,
                        Err(_) => {
                            return Err(UtcpError::discovery(
                                ws_prov.name(),
                                "manual frame is not UTF-8",
                            )
                            .into())
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(UtcpError::discovery(
                            ws_prov.name(),
                            "socket closed before the manual frame",
                        )
                        .into())
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(UtcpError::discovery(ws_prov.name(), e.to_string()).into())
                    }
                }
            };
            let _ = ws_stream.close(None).await;

            let manual: Manual = serde_json::from_str(&reply)
                .map_err(|e| UtcpError::discovery(ws_prov.name(), e.to_string()))?;
            debug!(provider = %ws_prov.name(), version = %manual.version, "discovered manual");
            Ok(manual.tools)
        };

        ctx.drive(ws_prov.timeout_ms, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let ws_prov = expect_provider::<WebSocketProvider>(prov, "websocket")?;
        self.close_connection(&ws_prov.name()).await;
        self.tokens.forget(&ws_prov.name()).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        correlation: Option<&str>,
    ) -> Result<ToolResult> {
        let ws_prov = expect_provider::<WebSocketProvider>(prov, "websocket")?;

        let (conn, id, mut rx) = self.open_call(ws_prov, tool_name, &args, correlation).await?;

        let drain = async {
            let mut values = Vec::new();
            while let Some(item) = rx.recv().await {
                values.push(item?);
            }
            Ok(values)
        };
        let result = ctx.drive(ws_prov.timeout_ms, drain).await;
        if result.is_err() {
            conn.abandon_call(id);
        }

        let mut values = result?;
        Ok(ToolResult::Value(match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        }))
    }

    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let ws_prov = expect_provider::<WebSocketProvider>(prov, "websocket")?;

        let open = self.open_call(ws_prov, tool_name, &args, None);
        let (conn, id, rx) = ctx.drive(ws_prov.timeout_ms, open).await?;

        let close_fn = Box::new(move || conn.abandon_call(id));
        Ok(Box::new(
            ChannelStreamResult::new(rx, Some(close_fn)).with_context(ctx.clone()),
        ))
    }

    async fn close(&self) -> Result<()> {
        let drained: Vec<Arc<WsConnection>> = {
            let mut map = self.connections.lock().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.fail_all(UtcpError::transport(
                conn.provider_name.clone(),
                "transport closed",
            ))
            .await;
            let mut sink = conn.sink.lock().await;
            let _ = sink.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;
    use crate::providers::base::{BaseProvider, ProviderType};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn provider(addr: &str, name: &str) -> WebSocketProvider {
        WebSocketProvider {
            base: BaseProvider::new(name.to_string(), ProviderType::Websocket, None),
            url: format!("ws://{}/tools", addr),
            protocol: None,
            keep_alive: false,
            headers: None,
            timeout_ms: None,
        }
    }

    async fn read_request(
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Option<Value> {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Text(text)) = msg {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    #[tokio::test]
    async fn manual_handshake_returns_tools() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                assert_eq!(text, "manual");
                let manual = json!({
                    "version": "1.0",
                    "tools": [{ "name": "counter", "description": "counts" }]
                });
                let _ = ws.send(Message::Text(manual.to_string())).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let tools = WebSocketTransport::new()
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "counter");
    }

    #[tokio::test]
    async fn stream_delivers_values_then_eos() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let req = read_request(&mut ws).await.unwrap();
            assert_eq!(req.get("tool"), Some(&json!("counter")));
            let id = req["id"].clone();
            for frame in [
                json!({ "id": id, "value": 1 }),
                json!({ "id": id, "value": 2 }),
                json!({ "id": id, "end": true }),
            ] {
                let _ = ws.send(Message::Text(frame.to_string())).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let transport = WebSocketTransport::new();
        let mut stream = transport
            .call_tool_stream(&CallContext::new(), "ws.counter", HashMap::new(), &prov)
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
        assert_eq!(stream.next().await.unwrap(), Some(json!(2)));
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(stream.next().await.unwrap(), None);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_streams_receive_only_their_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = read_request(&mut ws).await.unwrap();
            let second = read_request(&mut ws).await.unwrap();

            let (a, b) = if first["tool"] == json!("alpha") {
                (first["id"].clone(), second["id"].clone())
            } else {
                (second["id"].clone(), first["id"].clone())
            };

            // Interleave, second call first, to prove routing is by id.
            for frame in [
                json!({ "id": b, "value": "b1" }),
                json!({ "id": a, "value": "a1" }),
                json!({ "id": b, "value": "b2" }),
                json!({ "id": b, "end": true }),
                json!({ "id": a, "value": "a2" }),
                json!({ "id": a, "end": true }),
            ] {
                let _ = ws.send(Message::Text(frame.to_string())).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let transport = Arc::new(WebSocketTransport::new());
        let ctx = CallContext::new();

        let mut alpha = transport
            .call_tool_stream(&ctx, "alpha", HashMap::new(), &prov)
            .await
            .unwrap();
        let mut beta = transport
            .call_tool_stream(&ctx, "beta", HashMap::new(), &prov)
            .await
            .unwrap();

        assert_eq!(alpha.next().await.unwrap(), Some(json!("a1")));
        assert_eq!(alpha.next().await.unwrap(), Some(json!("a2")));
        assert_eq!(alpha.next().await.unwrap(), None);

        assert_eq!(beta.next().await.unwrap(), Some(json!("b1")));
        assert_eq!(beta.next().await.unwrap(), Some(json!("b2")));
        assert_eq!(beta.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_frame_terminates_the_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let req = read_request(&mut ws).await.unwrap();
            let frame = json!({ "id": req["id"], "error": "tool exploded" });
            let _ = ws.send(Message::Text(frame.to_string())).await;
        });

        let prov = provider(&addr.to_string(), "ws");
        let transport = WebSocketTransport::new();
        let mut stream = transport
            .call_tool_stream(&CallContext::new(), "boom", HashMap::new(), &prov)
            .await
            .unwrap();

        let err = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::CallFailed { message, .. }) if message == "tool exploded"
        ));
        // Terminal error replays.
        let err = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::CallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn cancelling_the_context_unblocks_next() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Accept the request but never answer it.
            let _ = read_request(&mut ws).await;
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let transport = WebSocketTransport::new();
        let ctx = CallContext::new();
        let mut stream = transport
            .call_tool_stream(&ctx, "slow", HashMap::new(), &prov)
            .await
            .unwrap();

        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(as_utcp_error(&err), Some(UtcpError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(200));
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_socket_fails_call_and_next_call_redials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: read the request, then slam the socket.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = read_request(&mut ws).await;
            drop(ws);

            // Second connection: answer properly.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let req = read_request(&mut ws).await.unwrap();
            for frame in [
                json!({ "id": req["id"], "value": "ok" }),
                json!({ "id": req["id"], "end": true }),
            ] {
                let _ = ws.send(Message::Text(frame.to_string())).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let transport = WebSocketTransport::new();

        let mut stream = transport
            .call_tool_stream(&CallContext::new(), "first", HashMap::new(), &prov)
            .await
            .unwrap();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::TransportError { .. })
        ));

        let value = transport
            .call_tool(&CallContext::new(), "second", HashMap::new(), &prov, None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!("ok"));
    }

    #[tokio::test]
    async fn correlation_id_is_used_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let req = read_request(&mut ws).await.unwrap();
            assert_eq!(req["id"], json!("call-7"));
            for frame in [
                json!({ "id": "call-7", "value": 3 }),
                json!({ "id": "call-7", "end": true }),
            ] {
                let _ = ws.send(Message::Text(frame.to_string())).await;
            }
        });

        let prov = provider(&addr.to_string(), "ws");
        let value = WebSocketTransport::new()
            .call_tool(
                &CallContext::new(),
                "tagged",
                HashMap::new(),
                &prov,
                Some("call-7"),
            )
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, json!(3));
    }
}
