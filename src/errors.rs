use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::auth::AuthError;
use crate::cache::CacheError;
use crate::ga4::ApiError;

/// Every failure a tool call can report. Tool calls never raise: the gateway
/// turns each of these into a structured payload.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("GA4 is unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid property ID: {property_id}")]
    InvalidProperty {
        property_id: String,
        valid_ids: Vec<String>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Auth(_) => "auth_failure",
            ToolError::UpstreamUnavailable(_) => "upstream_unavailable",
            ToolError::InvalidProperty { .. } => "invalid_property",
            ToolError::Validation(_) => "validation_error",
            ToolError::Io(_) => "io_failure",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Auth(e) => e.code(),
            ToolError::UpstreamUnavailable(_) => "upstream_unavailable",
            ToolError::InvalidProperty { .. } => "invalid_property_id",
            ToolError::Validation(_) => "invalid_arguments",
            ToolError::Io(_) => "io_failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ToolError::Auth(AuthError::NotConfigured(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ToolError::Auth(_) => StatusCode::UNAUTHORIZED,
            ToolError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ToolError::InvalidProperty { .. } => StatusCode::NOT_FOUND,
            ToolError::Validation(_) => StatusCode::BAD_REQUEST,
            ToolError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `{"error": {"type", "code", "message", ...details}}`
    pub fn to_payload(&self) -> Value {
        let mut error = Map::new();
        error.insert("type".into(), json!(self.kind()));
        error.insert("code".into(), json!(self.code()));

        match self {
            ToolError::Auth(AuthError::NeedsAuthorization { reason, authorize_url }) => {
                let message = match authorize_url {
                    Some(_) => format!(
                        "Authorization required ({}). Open authorize_url in a browser, then retry.",
                        reason
                    ),
                    None => format!("Authorization required ({}). Retry the call.", reason),
                };
                error.insert("message".into(), json!(message));
                if let Some(url) = authorize_url {
                    error.insert("authorize_url".into(), json!(url));
                }
            }
            ToolError::InvalidProperty { property_id, valid_ids } => {
                let message = if valid_ids.is_empty() {
                    format!(
                        "Invalid property ID: {}. Use list_properties to see available property IDs.",
                        property_id
                    )
                } else {
                    format!(
                        "Invalid property ID: {}. Available property IDs: {}",
                        property_id,
                        valid_ids.join(", ")
                    )
                };
                error.insert("message".into(), json!(message));
                error.insert("property_id".into(), json!(property_id));
                error.insert("valid_property_ids".into(), json!(valid_ids));
            }
            other => {
                error.insert("message".into(), json!(other.to_string()));
            }
        }

        json!({ "error": error })
    }
}

impl From<ApiError> for ToolError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => ToolError::Auth(AuthError::NeedsAuthorization {
                reason: "access token was rejected".into(),
                authorize_url: None,
            }),
            ApiError::Invalid(msg) => ToolError::Validation(msg),
            ApiError::PermissionDenied(msg) | ApiError::NotFound(msg) | ApiError::Unavailable(msg) => {
                ToolError::UpstreamUnavailable(msg)
            }
        }
    }
}

impl From<CacheError> for ToolError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Upstream(api) => api.into(),
        }
    }
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        if matches!(self, ToolError::Io(_) | ToolError::Auth(AuthError::NotConfigured(_))) {
            tracing::error!(error = %self, "request failed");
        }
        (self.status(), Json(self.to_payload())).into_response()
    }
}
