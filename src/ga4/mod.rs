//! GA4 Admin and Data API adapters.
//!
//! The gateway only talks to GA4 through the [`AdminApi`] and [`DataApi`]
//! traits; [`admin::AdminClient`] and [`data::DataClient`] are the REST
//! implementations.

pub mod admin;
pub mod catalog;
pub mod data;
pub mod types;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::auth::Credential;
pub use types::{FilterExpression, PropertyRecord, ReportRequest, ReportRow};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// 401: the access token was rejected.
    #[error("access token rejected by GA4")]
    Unauthorized,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 400: the request itself is wrong (unknown metric, bad date, ...).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Transport failure, timeout, 429 or 5xx after the retry.
    #[error("GA4 unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Every property visible to the credential, across all pages.
    async fn list_properties(&self, credential: &Credential) -> Result<Vec<PropertyRecord>, ApiError>;

    /// A single property; `None` when it does not exist or is not accessible.
    async fn get_property(
        &self,
        credential: &Credential,
        property_id: &str,
    ) -> Result<Option<PropertyRecord>, ApiError>;
}

#[async_trait]
pub trait DataApi: Send + Sync {
    async fn run_report(
        &self,
        credential: &Credential,
        request: &ReportRequest,
    ) -> Result<Vec<ReportRow>, ApiError>;
}

/// Google API error envelope.
#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
}

pub(crate) fn transport_error(e: reqwest::Error) -> ApiError {
    tracing::warn!(error = %e, "GA4 request failed");
    ApiError::Unavailable(e.without_url().to_string())
}

/// Pass 2xx responses through; classify everything else.
pub(crate) async fn check_status(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GoogleErrorBody>(&body)
        .map(|b| b.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    tracing::debug!(status = status.as_u16(), message = %message, "GA4 error response");

    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::PermissionDenied(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::BAD_REQUEST => ApiError::Invalid(message),
        _ => ApiError::Unavailable(message),
    })
}

/// Strip a `properties/` prefix from a resource name.
pub fn property_id_from_resource(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
