use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::types::FilterExpression;
use super::{check_status, transport_error, ApiError, DataApi, ReportRequest, ReportRow};
use crate::auth::Credential;
use crate::retry::{send_with_retry, RetryPolicy};

/// REST client for `analyticsdata.googleapis.com/v1beta`.
pub struct DataClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl DataClient {
    pub fn new(http: Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[derive(Debug, Serialize)]
struct Named<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DateRange<'a> {
    start_date: &'a str,
    end_date: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReportBody<'a> {
    dimensions: Vec<Named<'a>>,
    metrics: Vec<Named<'a>>,
    date_ranges: Vec<DateRange<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

impl<'a> From<&'a ReportRequest> for RunReportBody<'a> {
    fn from(req: &'a ReportRequest) -> Self {
        Self {
            dimensions: req.dimensions.iter().map(|name| Named { name }).collect(),
            metrics: req.metrics.iter().map(|name| Named { name }).collect(),
            date_ranges: vec![DateRange {
                start_date: &req.date_range_start,
                end_date: &req.date_range_end,
            }],
            dimension_filter: req.dimension_filter.as_ref(),
            limit: req.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    dimension_headers: Vec<Header>,
    #[serde(default)]
    metric_headers: Vec<Header>,
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Row {
    #[serde(default)]
    dimension_values: Vec<Cell>,
    #[serde(default)]
    metric_values: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    #[serde(default)]
    value: Option<String>,
}

impl RunReportResponse {
    fn into_rows(self) -> Vec<ReportRow> {
        let (dimension_headers, metric_headers) = (self.dimension_headers, self.metric_headers);
        self.rows
            .into_iter()
            .map(|row| {
                let mut out = ReportRow::new();
                fill(&mut out, &dimension_headers, row.dimension_values);
                fill(&mut out, &metric_headers, row.metric_values);
                out
            })
            .collect()
    }
}

fn fill(out: &mut ReportRow, headers: &[Header], values: Vec<Cell>) {
    let mut values = values.into_iter();
    for header in headers {
        let value = values.next().and_then(|c| c.value);
        out.insert(header.name.clone(), value);
    }
}

#[async_trait]
impl DataApi for DataClient {
    async fn run_report(
        &self,
        credential: &Credential,
        request: &ReportRequest,
    ) -> Result<Vec<ReportRow>, ApiError> {
        let url = format!(
            "{}/v1beta/properties/{}:runReport",
            self.base_url, request.property_id
        );
        let body = RunReportBody::from(request);

        let resp = send_with_retry(
            || {
                self.http
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, credential.bearer())
                    .json(&body)
            },
            &self.retry,
        )
        .await
        .map_err(transport_error)?;

        let report: RunReportResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed report: {}", e)))?;

        let rows = report.into_rows();
        tracing::debug!(property_id = %request.property_id, rows = rows.len(), "report returned");
        Ok(rows)
    }
}
