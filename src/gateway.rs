//! The tool gateway: every externally invocable operation, each behind the
//! same guard sequence (arguments, credential, property authorization, API).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{Credential, CredentialBroker};
use crate::cache::{CacheError, PropertyCache};
use crate::errors::ToolError;
use crate::ga4::catalog::{self, DIMENSIONS, METRICS};
use crate::ga4::{ApiError, DataApi, FilterExpression, PropertyRecord, ReportRequest, ReportRow};

pub const DEFAULT_DIMENSIONS: &[&str] = &["date"];
pub const DEFAULT_METRICS: &[&str] = &[
    "totalUsers",
    "newUsers",
    "bounceRate",
    "screenPageViewsPerSession",
    "averageSessionDuration",
];
pub const DEFAULT_START_DATE: &str = "7daysAgo";
pub const DEFAULT_END_DATE: &str = "yesterday";

/// Raw `run_report` arguments as the client sent them.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportArgs {
    #[serde(default)]
    pub property_id: Option<Value>,
    #[serde(default)]
    pub dimensions: Option<Vec<String>>,
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
    #[serde(default)]
    pub date_range_start: Option<String>,
    #[serde(default)]
    pub date_range_end: Option<String>,
    #[serde(default)]
    pub dimension_filter: Option<Value>,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Process-wide context shared by every tool call.
#[derive(Clone)]
pub struct ToolGateway {
    broker: CredentialBroker,
    cache: PropertyCache,
    data: Arc<dyn DataApi>,
}

impl ToolGateway {
    pub fn new(broker: CredentialBroker, cache: PropertyCache, data: Arc<dyn DataApi>) -> Self {
        Self { broker, cache, data }
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    pub fn cache(&self) -> &PropertyCache {
        &self.cache
    }

    async fn credential(&self) -> Result<Credential, ToolError> {
        Ok(self.broker.get_credential().await?)
    }

    /// A 401 means the access token is dead even if it has not expired yet.
    fn note_unauthorized(&self, e: &ApiError) {
        if matches!(e, ApiError::Unauthorized) {
            self.broker.invalidate_access_token();
        }
    }

    fn cache_failure(&self, e: CacheError) -> ToolError {
        let CacheError::Upstream(api) = &e;
        self.note_unauthorized(api);
        e.into()
    }

    pub async fn list_properties(&self) -> Result<Vec<PropertyRecord>, ToolError> {
        let credential = self.credential().await?;
        self.cache
            .list_properties(&credential)
            .await
            .map_err(|e| self.cache_failure(e))
    }

    pub async fn get_property_info(&self, property_id: Option<&Value>) -> Result<PropertyRecord, ToolError> {
        let property_id = normalize_property_id(property_id)?;
        let credential = self.credential().await?;

        match self.cache.get_property(&credential, &property_id).await {
            Ok(Some(property)) => Ok(property),
            Ok(None) => Err(ToolError::InvalidProperty {
                property_id,
                valid_ids: self.cache.known_ids(),
            }),
            Err(e) => Err(self.cache_failure(e)),
        }
    }

    pub async fn run_report(&self, args: ReportArgs) -> Result<Vec<ReportRow>, ToolError> {
        let request = build_report_request(args)?;
        let credential = self.credential().await?;

        let authorized = self
            .cache
            .validate(&credential, &request.property_id)
            .await
            .map_err(|e| self.cache_failure(e))?;
        if !authorized {
            tracing::info!(property_id = %request.property_id, "report for unknown property refused");
            return Err(ToolError::InvalidProperty {
                property_id: request.property_id,
                valid_ids: self.cache.known_ids(),
            });
        }

        match self.data.run_report(&credential, &request).await {
            Ok(rows) => Ok(rows),
            Err(ApiError::PermissionDenied(_)) | Err(ApiError::NotFound(_)) => {
                Err(ToolError::InvalidProperty {
                    property_id: request.property_id,
                    valid_ids: self.cache.known_ids(),
                })
            }
            Err(e) => {
                tracing::warn!(property_id = %request.property_id, error = %e, "report failed");
                self.note_unauthorized(&e);
                Err(e.into())
            }
        }
    }

    pub fn list_dimension_categories(&self) -> Value {
        catalog::summarize(DIMENSIONS, "dimensions")
    }

    pub fn list_metric_categories(&self) -> Value {
        catalog::summarize(METRICS, "metrics")
    }

    pub fn get_dimensions_by_category(&self, category: &str) -> Result<Value, ToolError> {
        lookup_category(DIMENSIONS, category)
    }

    pub fn get_metrics_by_category(&self, category: &str) -> Result<Value, ToolError> {
        lookup_category(METRICS, category)
    }

    /// Authentication state without touching the network.
    pub fn auth_status(&self) -> Value {
        let mut status = json!({
            "state": self.broker.state(),
            "cached_properties": self.cache.len(),
        });
        if let Some(url) = self.broker.pending_authorization() {
            status["authorize_url"] = json!(url);
        }
        if let Some(at) = self.cache.last_refreshed() {
            status["properties_refreshed_at"] = json!(at.to_rfc3339());
        }
        status
    }

    /// Check a configured default property at startup. Only ever warns.
    pub async fn verify_default_property(&self, property_id: &str) {
        let property_id = match normalize_property_id(Some(&json!(property_id))) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(property_id, error = %e, "configured GA4_PROPERTY_ID is malformed");
                return;
            }
        };

        let credential = match self.broker.get_credential().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "cannot verify GA4_PROPERTY_ID until authorized");
                return;
            }
        };

        match self.cache.validate(&credential, &property_id).await {
            Ok(true) => tracing::info!(property_id = %property_id, "default property verified"),
            Ok(false) => tracing::warn!(
                property_id = %property_id,
                known = ?self.cache.known_ids(),
                "configured GA4_PROPERTY_ID is not accessible"
            ),
            Err(e) => tracing::warn!(error = %e, "could not verify GA4_PROPERTY_ID"),
        }
    }
}

fn lookup_category(catalog: &[catalog::Category], category: &str) -> Result<Value, ToolError> {
    catalog::describe(catalog, category).ok_or_else(|| {
        ToolError::Validation(format!(
            "Category '{}' not found. Available categories: {}",
            category,
            catalog::category_names(catalog).join(", ")
        ))
    })
}

/// Accept `123456`, `"123456"` or `"properties/123456"`.
pub fn normalize_property_id(raw: Option<&Value>) -> Result<String, ToolError> {
    let required = || {
        ToolError::Validation(
            "property_id is required. Use list_properties to get available property IDs.".into(),
        )
    };

    let id = match raw {
        None | Some(Value::Null) => return Err(required()),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            trimmed.strip_prefix("properties/").unwrap_or(trimmed).to_string()
        }
        Some(_) => return Err(ToolError::Validation("property_id must be a string".into())),
    };

    if id.is_empty() {
        return Err(required());
    }
    if !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ToolError::Validation(format!(
            "property_id must be numeric, got '{}'",
            id
        )));
    }
    Ok(id)
}

fn name_list(field: &str, given: Option<Vec<String>>, default: &[&str]) -> Result<Vec<String>, ToolError> {
    let names: Vec<String> = match given {
        Some(list) => list.into_iter().map(|n| n.trim().to_string()).collect(),
        None => default.iter().map(|n| n.to_string()).collect(),
    };
    if names.is_empty() {
        return Err(ToolError::Validation(format!("{} cannot be empty", field)));
    }
    if names.iter().any(|n| n.is_empty()) {
        return Err(ToolError::Validation(format!("{} cannot contain blank names", field)));
    }
    Ok(names)
}

fn date_arg(given: Option<String>, default: &str) -> Result<String, ToolError> {
    match given {
        None => Ok(default.to_string()),
        Some(d) if d.trim().is_empty() => Err(ToolError::Validation("date range bounds cannot be blank".into())),
        Some(d) => Ok(d.trim().to_string()),
    }
}

/// Validate and default `run_report` arguments. No network.
pub fn build_report_request(args: ReportArgs) -> Result<ReportRequest, ToolError> {
    let property_id = normalize_property_id(args.property_id.as_ref())?;
    let dimensions = name_list("dimensions", args.dimensions, DEFAULT_DIMENSIONS)?;
    let metrics = name_list("metrics", args.metrics, DEFAULT_METRICS)?;

    let dimension_filter = match args.dimension_filter {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let expr = FilterExpression::from_value(&raw).map_err(ToolError::Validation)?;
            if let Some(unknown) = expr.field_names().into_iter().find(|f| !catalog::is_known_dimension(f)) {
                return Err(ToolError::Validation(format!(
                    "dimension_filter references unknown dimension '{}'",
                    unknown
                )));
            }
            Some(expr)
        }
    };

    if args.limit == Some(0) {
        return Err(ToolError::Validation("limit must be positive".into()));
    }

    Ok(ReportRequest {
        property_id,
        dimensions,
        metrics,
        date_range_start: date_arg(args.date_range_start, DEFAULT_START_DATE)?,
        date_range_end: date_arg(args.date_range_end, DEFAULT_END_DATE)?,
        dimension_filter,
        limit: args.limit,
    })
}
