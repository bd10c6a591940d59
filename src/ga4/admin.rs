use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{check_status, property_id_from_resource, transport_error, AdminApi, ApiError, PropertyRecord};
use crate::auth::Credential;
use crate::retry::{send_with_retry, RetryPolicy};

const PAGE_SIZE: &str = "200";
/// 200 properties per page; no real account list gets near this.
const MAX_PAGES: u32 = 500;

/// REST client for `analyticsadmin.googleapis.com/v1beta`.
pub struct AdminClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl AdminClient {
    pub fn new(http: Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAccountSummariesResponse {
    #[serde(default)]
    account_summaries: Vec<AccountSummary>,
    #[serde(default)]
    next_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    #[serde(default)]
    account: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    property_summaries: Vec<PropertySummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertySummary {
    property: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Property {
    name: String,
    #[serde(default)]
    display_name: String,
    create_time: Option<String>,
    update_time: Option<String>,
    #[serde(default)]
    parent: String,
}

#[async_trait]
impl AdminApi for AdminClient {
    async fn list_properties(&self, credential: &Credential) -> Result<Vec<PropertyRecord>, ApiError> {
        let url = format!("{}/v1beta/accountSummaries", self.base_url);
        let mut properties = Vec::new();
        let mut page_token = String::new();
        let mut pages = 0u32;
        let mut seen_tokens = HashSet::new();

        loop {
            let resp = send_with_retry(
                || {
                    let mut req = self
                        .http
                        .get(&url)
                        .header(reqwest::header::AUTHORIZATION, credential.bearer())
                        .query(&[("pageSize", PAGE_SIZE)]);
                    if !page_token.is_empty() {
                        req = req.query(&[("pageToken", page_token.as_str())]);
                    }
                    req
                },
                &self.retry,
            )
            .await
            .map_err(transport_error)?;

            let page: ListAccountSummariesResponse = check_status(resp)
                .await?
                .json()
                .await
                .map_err(|e| ApiError::Unavailable(format!("malformed account summaries: {}", e)))?;
            pages += 1;

            for account in page.account_summaries {
                for summary in account.property_summaries {
                    properties.push(PropertyRecord {
                        id: property_id_from_resource(&summary.property).to_string(),
                        display_name: summary.display_name,
                        // Summaries carry no timestamps.
                        create_time: None,
                        update_time: None,
                        parent: account.account.clone(),
                        account_name: Some(account.display_name.clone()),
                    });
                }
            }

            if page.next_page_token.is_empty() {
                break;
            }
            if !seen_tokens.insert(page.next_page_token.clone()) {
                return Err(ApiError::Unavailable(
                    "account summaries paging repeated a page token".into(),
                ));
            }
            if pages >= MAX_PAGES {
                return Err(ApiError::Unavailable(format!(
                    "account summaries exceeded {} pages",
                    MAX_PAGES
                )));
            }
            page_token = page.next_page_token;
        }

        tracing::debug!(count = properties.len(), pages, "listed GA4 properties");
        Ok(properties)
    }

    async fn get_property(
        &self,
        credential: &Credential,
        property_id: &str,
    ) -> Result<Option<PropertyRecord>, ApiError> {
        let url = format!("{}/v1beta/properties/{}", self.base_url, property_id);
        let resp = send_with_retry(
            || {
                self.http
                    .get(&url)
                    .header(reqwest::header::AUTHORIZATION, credential.bearer())
            },
            &self.retry,
        )
        .await
        .map_err(transport_error)?;

        let property: Property = match check_status(resp).await {
            Ok(resp) => resp
                .json()
                .await
                .map_err(|e| ApiError::Unavailable(format!("malformed property: {}", e)))?,
            Err(ApiError::NotFound(_)) | Err(ApiError::PermissionDenied(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(PropertyRecord {
            id: property_id_from_resource(&property.name).to_string(),
            display_name: property.display_name,
            create_time: property.create_time,
            update_time: property.update_time,
            parent: property.parent,
            account_name: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential {
            access_token: "ya29.token".into(),
            refresh_token: "1//r".into(),
            expiry: Utc::now() + Duration::hours(1),
            scopes: Default::default(),
        }
    }

    fn client(server: &MockServer) -> AdminClient {
        AdminClient::new(Client::new(), server.uri(), RetryPolicy::immediate())
    }

    #[tokio::test]
    async fn test_list_properties_follows_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accountSummaries": [{
                    "account": "accounts/2",
                    "displayName": "Second",
                    "propertySummaries": [{"property": "properties/789012", "displayName": "Shop"}]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .and(query_param("pageSize", "200"))
            .and(header("authorization", "Bearer ya29.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accountSummaries": [{
                    "account": "accounts/1",
                    "displayName": "First",
                    "propertySummaries": [{"property": "properties/123456", "displayName": "Blog"}]
                }],
                "nextPageToken": "page-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let properties = client(&server).list_properties(&credential()).await.unwrap();
        let ids: Vec<_> = properties.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["123456", "789012"]);
        assert_eq!(properties[0].parent, "accounts/1");
        assert_eq!(properties[0].account_name.as_deref(), Some("First"));
        assert!(properties[0].create_time.is_none());
    }

    #[tokio::test]
    async fn test_list_properties_stops_on_repeated_page_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accountSummaries": [],
                "nextPageToken": "same-again"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).list_properties(&credential()).await.unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(msg) if msg.contains("repeated")));
    }

    #[tokio::test]
    async fn test_get_property_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/properties/123456"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "properties/123456",
                "displayName": "Blog",
                "createTime": "2023-01-01T00:00:00Z",
                "updateTime": "2024-05-01T00:00:00Z",
                "parent": "accounts/1"
            })))
            .mount(&server)
            .await;

        let property = client(&server)
            .get_property(&credential(), "123456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(property.id, "123456");
        assert_eq!(property.create_time.as_deref(), Some("2023-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_get_property_absent_or_forbidden_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/properties/404"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1beta/properties/403"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"code": 403, "message": "The caller does not have permission", "status": "PERMISSION_DENIED"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let admin = client(&server);
        assert!(admin.get_property(&credential(), "404").await.unwrap().is_none());
        assert!(admin.get_property(&credential(), "403").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_and_outage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1beta/properties/1"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let admin = client(&server);
        assert_eq!(
            admin.list_properties(&credential()).await.unwrap_err(),
            ApiError::Unauthorized
        );
        assert!(matches!(
            admin.get_property(&credential(), "1").await.unwrap_err(),
            ApiError::Unavailable(_)
        ));
    }
}
