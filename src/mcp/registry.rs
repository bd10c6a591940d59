//! Tool registry: the MCP tool definitions the gateway advertises and the
//! routing of `tools/call` onto [`ToolGateway`] operations.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{CallToolResult, JsonRpcError, McpToolDef, INVALID_PARAMS};
use crate::errors::ToolError;
use crate::gateway::{ReportArgs, ToolGateway, DEFAULT_METRICS};

#[derive(Debug, Default, Deserialize)]
struct NoArgs {}

#[derive(Debug, Default, Deserialize)]
struct PropertyArgs {
    #[serde(default)]
    property_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CategoryArgs {
    #[serde(default)]
    category: Option<String>,
}

impl CategoryArgs {
    fn required(self) -> Result<String, ToolError> {
        self.category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::Validation("category is required".into()))
    }
}

fn decode<T: DeserializeOwned + Default>(arguments: Option<Value>) -> Result<T, ToolError> {
    match arguments {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v)
            .map_err(|e| ToolError::Validation(format!("invalid arguments: {}", e))),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Io(e.to_string()))
}

/// Every tool the gateway exposes, in `tools/list` order.
pub fn tool_definitions() -> Vec<McpToolDef> {
    let property_id = json!({
        "type": "string",
        "description": "GA4 property ID, e.g. \"123456789\" or \"properties/123456789\". Use list_properties to discover IDs."
    });
    let no_args = json!({"type": "object", "properties": {}});

    vec![
        McpToolDef {
            name: "list_properties",
            description: "List all GA4 properties the authorized user can access. The returned ids are required by run_report.",
            input_schema: no_args.clone(),
        },
        McpToolDef {
            name: "get_property_info",
            description: "Get details (display name, parent account, timestamps) for one GA4 property.",
            input_schema: json!({
                "type": "object",
                "properties": {"property_id": property_id},
                "required": ["property_id"]
            }),
        },
        McpToolDef {
            name: "run_report",
            description: "Retrieve GA4 metrics broken down by dimensions for a date range. Rows are objects keyed by dimension and metric name.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "property_id": property_id,
                    "dimensions": {
                        "type": "array", "items": {"type": "string"},
                        "default": ["date"],
                        "description": "GA4 dimension names, e.g. [\"date\", \"city\"]."
                    },
                    "metrics": {
                        "type": "array", "items": {"type": "string"},
                        "default": DEFAULT_METRICS,
                        "description": "GA4 metric names, e.g. [\"totalUsers\", \"sessions\"]."
                    },
                    "date_range_start": {
                        "type": "string", "default": "7daysAgo",
                        "description": "YYYY-MM-DD or a relative date such as 7daysAgo."
                    },
                    "date_range_end": {
                        "type": "string", "default": "yesterday",
                        "description": "YYYY-MM-DD or a relative date such as yesterday or today."
                    },
                    "dimension_filter": {
                        "type": "object",
                        "description": "GA4 FilterExpression (andGroup, orGroup, notExpression, filter with stringFilter or inListFilter)."
                    },
                    "limit": {"type": "integer", "minimum": 1, "description": "Maximum rows to return."}
                },
                "required": ["property_id"]
            }),
        },
        McpToolDef {
            name: "list_dimension_categories",
            description: "List GA4 dimension categories and the dimensions in each.",
            input_schema: no_args.clone(),
        },
        McpToolDef {
            name: "list_metric_categories",
            description: "List GA4 metric categories and the metrics in each.",
            input_schema: no_args.clone(),
        },
        McpToolDef {
            name: "get_dimensions_by_category",
            description: "Describe every dimension in one category (e.g. time, geography, ecommerce).",
            input_schema: json!({
                "type": "object",
                "properties": {"category": {"type": "string"}},
                "required": ["category"]
            }),
        },
        McpToolDef {
            name: "get_metrics_by_category",
            description: "Describe every metric in one category (e.g. user_metrics, session_metrics).",
            input_schema: json!({
                "type": "object",
                "properties": {"category": {"type": "string"}},
                "required": ["category"]
            }),
        },
        McpToolDef {
            name: "auth_status",
            description: "Report the OAuth state and, when authorization is pending, the URL to open.",
            input_schema: no_args,
        },
    ]
}

/// Routes `tools/call` requests to the gateway.
#[derive(Clone)]
pub struct ToolRegistry {
    gateway: ToolGateway,
}

impl ToolRegistry {
    pub fn new(gateway: ToolGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    /// Run a tool. Tool failures come back as `isError` results; only an
    /// unknown tool name is a protocol error.
    pub async fn call(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult, JsonRpcError> {
        let started = std::time::Instant::now();
        let outcome = match name {
            "list_properties" => self.list_properties(arguments).await,
            "get_property_info" => self.get_property_info(arguments).await,
            "run_report" => self.run_report(arguments).await,
            "list_dimension_categories" => decode::<NoArgs>(arguments).map(|_| self.gateway.list_dimension_categories()),
            "list_metric_categories" => decode::<NoArgs>(arguments).map(|_| self.gateway.list_metric_categories()),
            "get_dimensions_by_category" => decode::<CategoryArgs>(arguments)
                .and_then(CategoryArgs::required)
                .and_then(|c| self.gateway.get_dimensions_by_category(&c)),
            "get_metrics_by_category" => decode::<CategoryArgs>(arguments)
                .and_then(CategoryArgs::required)
                .and_then(|c| self.gateway.get_metrics_by_category(&c)),
            "auth_status" => decode::<NoArgs>(arguments).map(|_| self.gateway.auth_status()),
            other => {
                return Err(JsonRpcError::new(INVALID_PARAMS, format!("unknown tool: {}", other)));
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(match outcome {
            Ok(value) => {
                tracing::info!(tool = name, elapsed_ms, "tool call succeeded");
                CallToolResult::json(&value, false)
            }
            Err(e) => {
                tracing::info!(tool = name, elapsed_ms, error_type = e.kind(), code = e.code(), "tool call failed");
                CallToolResult::json(&e.to_payload(), true)
            }
        })
    }

    async fn list_properties(&self, arguments: Option<Value>) -> Result<Value, ToolError> {
        decode::<NoArgs>(arguments)?;
        to_value(self.gateway.list_properties().await?)
    }

    async fn get_property_info(&self, arguments: Option<Value>) -> Result<Value, ToolError> {
        let args: PropertyArgs = decode(arguments)?;
        to_value(self.gateway.get_property_info(args.property_id.as_ref()).await?)
    }

    async fn run_report(&self, arguments: Option<Value>) -> Result<Value, ToolError> {
        let args: ReportArgs = decode(arguments)?;
        to_value(self.gateway.run_report(args).await?)
    }
}
