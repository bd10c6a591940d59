//! MCP server: JSON-RPC dispatch plus the Streamable HTTP and stdio
//! transports.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::registry::{tool_definitions, ToolRegistry};
use super::types::*;
use crate::auth::callback::{complete_redirect, loopback_target, outcome_page, CallbackError, RedirectParams};
use crate::errors::ToolError;

const INSTRUCTIONS: &str = "Call list_properties first to discover property IDs, then run_report. \
If a tool returns needs_authorization, open authorize_url in a browser and retry.";

/// JSON-RPC front end over the tool registry.
#[derive(Clone)]
pub struct McpServer {
    registry: ToolRegistry,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch one request. Notifications produce no response.
    pub async fn handle(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if req.is_notification() {
            tracing::debug!(method = %req.method, "notification received");
            return None;
        }
        let id = req.id.clone().unwrap_or(Value::Null);

        if req.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }

        let outcome = match req.method.as_str() {
            "initialize" => to_result(&InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: ToolsCapability { list_changed: false },
                },
                server_info: Implementation {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                instructions: Some(INSTRUCTIONS.to_string()),
            }),
            "ping" => Ok(json!({})),
            "tools/list" => to_result(&ListToolsResult {
                tools: tool_definitions(),
            }),
            "tools/call" => self.call_tool(req.params).await,
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            )),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!(method = %req.method, code = error.code, "JSON-RPC error");
                JsonRpcResponse::failure(id, error)
            }
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = params
            .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "tools/call requires params"))
            .and_then(|p| {
                serde_json::from_value(p)
                    .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid tools/call params: {}", e)))
            })?;

        let result = self.registry.call(&params.name, params.arguments).await?;
        to_result(&result)
    }

    /// Parse and dispatch one raw message. `None` when nothing should be sent
    /// back (a notification).
    pub async fn handle_message(&self, raw: &[u8]) -> Option<Value> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(error_value(
                    Value::Null,
                    JsonRpcError::new(PARSE_ERROR, format!("parse error: {}", e)),
                ));
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let req: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(error_value(
                    id,
                    JsonRpcError::new(INVALID_REQUEST, format!("invalid request: {}", e)),
                ));
            }
        };

        let response = self.handle(req).await?;
        match serde_json::to_value(&response) {
            Ok(v) => Some(v),
            Err(e) => Some(error_value(
                response.id,
                JsonRpcError::new(INTERNAL_ERROR, e.to_string()),
            )),
        }
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
}

fn error_value(id: Value, error: JsonRpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

// ── HTTP transport ─────────────────────────────────────────────

/// Routes: `POST /mcp`, `GET /healthz`, `GET /oauth/authorize`, and the
/// redirect path (normally `/oauth/callback`).
pub fn router(server: McpServer, callback_path: &str) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/mcp", post(mcp_handler))
        .route("/oauth/authorize", get(authorize_handler))
        .route(callback_path, get(callback_handler))
        .with_state(server)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
}

/// POST /mcp: one JSON-RPC message per request.
async fn mcp_handler(State(server): State<McpServer>, body: Bytes) -> Response {
    match server.handle_message(&body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// GET /oauth/authorize: redirect the browser to the consent screen.
async fn authorize_handler(State(server): State<McpServer>) -> Response {
    match server.registry().gateway().broker().begin_authorization() {
        Ok(request) => match HeaderValue::from_str(&request.url) {
            Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
            Err(e) => ToolError::Io(format!("unusable authorization URL: {}", e)).into_response(),
        },
        Err(e) => ToolError::from(e).into_response(),
    }
}

/// GET /oauth/callback?code&state
async fn callback_handler(State(server): State<McpServer>, Query(params): Query<RedirectParams>) -> Response {
    let broker = server.registry().gateway().broker().clone();
    let result = complete_redirect(&broker, params).await;
    if result.is_ok() {
        // Drop whatever was listed under the previous identity.
        server.registry().gateway().cache().invalidate();
    }
    outcome_page(&result)
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

/// Only the redirect route, for a listener on the redirect URI's own port.
pub fn redirect_router(server: McpServer, callback_path: &str) -> Router {
    Router::new()
        .route(callback_path, get(callback_handler))
        .with_state(server)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve the redirect URI for the life of the process. Used when no HTTP
/// transport owns it (stdio, or an HTTP server on another port).
pub async fn serve_redirect_listener(server: McpServer, redirect_uri: &str) -> Result<(), CallbackError> {
    let (addr, path) = loopback_target(redirect_uri)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| CallbackError::Bind { addr, source })?;

    tracing::info!(%addr, path = %path, "authorization redirect listener started");
    axum::serve(listener, redirect_router(server, &path))
        .await
        .map_err(|source| CallbackError::Bind { addr, source })
}

pub async fn serve_http(server: McpServer, addr: SocketAddr, callback_path: &str) -> std::io::Result<()> {
    let app = router(server, callback_path);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "GA4 gateway listening (POST /mcp)");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
}

// ── stdio transport ────────────────────────────────────────────

/// Newline-delimited JSON-RPC on stdin/stdout. Logs must go to stderr.
pub async fn serve_stdio(server: McpServer) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("GA4 gateway serving MCP on stdio");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = server.handle_message(line.as_bytes()).await {
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            stdout.write_all(&out).await?;
            stdout.flush().await?;
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FakeAdmin;
    use crate::cache::PropertyCache;
    use crate::gateway::tests::{broker_with, FakeData};
    use crate::gateway::ToolGateway;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server() -> McpServer {
        McpServer::new(ToolRegistry::new(ToolGateway::new(
            broker_with(None),
            PropertyCache::new(Arc::new(FakeAdmin::new(&["123456"]))),
            Arc::new(FakeData::new(Ok(vec![]))),
        )))
    }

    async fn post_mcp(app: Router, body: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::post("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_initialize_and_tools_list() {
        let app = router(server(), "/oauth/callback");

        let (status, init) = post_mcp(
            app.clone(),
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"t","version":"0"}}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(init["result"]["serverInfo"]["name"], "ga4-gateway");
        assert_eq!(init["result"]["capabilities"]["tools"]["listChanged"], false);

        let (_, list) = post_mcp(app, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await;
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"run_report"));
        assert!(names.contains(&"auth_status"));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let app = router(server(), "/oauth/callback");

        let (_, parse) = post_mcp(app.clone(), "{not json").await;
        assert_eq!(parse["error"]["code"], PARSE_ERROR);
        assert_eq!(parse["id"], Value::Null);

        let (_, unknown) = post_mcp(app.clone(), r#"{"jsonrpc":"2.0","id":"a","method":"resources/list"}"#).await;
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(unknown["id"], "a");

        let (_, no_params) = post_mcp(app.clone(), r#"{"jsonrpc":"2.0","id":3,"method":"tools/call"}"#).await;
        assert_eq!(no_params["error"]["code"], INVALID_PARAMS);

        let (_, bad_version) = post_mcp(app, r#"{"jsonrpc":"1.0","id":4,"method":"ping"}"#).await;
        assert_eq!(bad_version["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_body() {
        let app = router(server(), "/oauth/callback");
        let (status, body) = post_mcp(app, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_tool_error_is_successful_rpc_result() {
        let app = router(server(), "/oauth/callback");
        let (_, resp) = post_mcp(
            app,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"run_report","arguments":{}}}"#,
        )
        .await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["isError"], true);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["error"]["type"], "validation_error");
    }

    #[tokio::test]
    async fn test_authorize_redirects_and_callback_checks_state() {
        let app = router(server(), "/oauth/callback");

        let resp = app
            .clone()
            .oneshot(Request::get("/oauth/authorize").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(resp.headers().contains_key("x-request-id"));

        let resp = app
            .oneshot(
                Request::get("/oauth/callback?code=abc&state=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_healthz() {
        let resp = router(server(), "/oauth/callback")
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
