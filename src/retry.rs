use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry behaviour for upstream calls (token endpoint, Admin, Data).
///
/// Only transport failures and the status codes listed here are retried.
/// 400/401/403/404 are always final.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_backoff_ms: 250,
            max_backoff_ms: 2_000,
            jitter_ms: 100,
            status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// No backoff at all, for tests.
    pub fn immediate() -> Self {
        Self {
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_ms: 0,
            ..Self::default()
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.status_codes.contains(&status.as_u16())
    }
}

/// Send a request built by `build`, retrying per `policy`.
///
/// `build` is called once per attempt since a `RequestBuilder` is consumed by
/// `send`. When retries are exhausted on a retryable status the last response
/// is returned so callers can read its body.
pub async fn send_with_retry<F>(build: F, policy: &RetryPolicy) -> Result<Response, reqwest::Error>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if !policy.is_retryable_status(status) {
                    return Ok(response);
                }

                if attempt > policy.max_retries {
                    debug!(
                        "Exhausted {} retries for {}; last status: {}",
                        policy.max_retries,
                        response.url(),
                        status
                    );
                    return Ok(response);
                }

                let wait = wait_time(&response, policy, attempt);
                warn!(
                    "Attempt {}/{} failed with status {}. Retrying in {:?}...",
                    attempt,
                    policy.max_retries + 1,
                    status,
                    wait
                );
                sleep(wait).await;
            }
            Err(e) => {
                if !is_transient(&e) || attempt > policy.max_retries {
                    return Err(e);
                }

                let wait = backoff(policy, attempt);
                warn!(
                    "Attempt {}/{} failed with error: {}. Retrying in {:?}...",
                    attempt,
                    policy.max_retries + 1,
                    e,
                    wait
                );
                sleep(wait).await;
            }
        }
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

fn wait_time(response: &Response, policy: &RetryPolicy, attempt: u32) -> Duration {
    if let Some(retry_after) = response.headers().get(reqwest::header::RETRY_AFTER) {
        if let Some(seconds) = retry_after.to_str().ok().and_then(|v| v.parse::<u64>().ok()) {
            // Capped at the policy maximum.
            return Duration::from_secs(seconds).min(Duration::from_millis(policy.max_backoff_ms));
        }
    }
    backoff(policy, attempt)
}

fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_backoff_ms as f64;
    let max = policy.max_backoff_ms as f64;

    // Exponential: base * 2^(attempt - 1)
    let raw = base * 2_f64.powi((attempt as i32) - 1);
    let capped = raw.min(max);

    let jitter = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };

    Duration::from_millis((capped as u64) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_single_retry_on_503_succeeds() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1beta/accountSummaries"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = Client::new();
        let url = format!("{}/v1beta/accountSummaries", mock_server.uri());
        let res = send_with_retry(|| client.get(&url), &RetryPolicy::immediate())
            .await
            .unwrap();

        assert_eq!(res.status(), 200);
    }

    /// Authorization denials are final: exactly one request.
    #[tokio::test]
    async fn test_no_retry_on_401_or_403() {
        for status in [401u16, 403] {
            let mock_server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&mock_server)
                .await;

            let client = Client::new();
            let url = format!("{}/token", mock_server.uri());
            let res = send_with_retry(|| client.post(&url), &RetryPolicy::immediate())
                .await
                .unwrap();
            assert_eq!(res.status().as_u16(), status);
        }
    }

    /// With the default single retry, two failures return the last response.
    #[tokio::test]
    async fn test_retry_exhausted_returns_last_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/properties/1:runReport"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>502</html>"))
            .expect(2) // 1 original + 1 retry
            .mount(&mock_server)
            .await;

        let client = Client::new();
        let url = format!("{}/v1beta/properties/1:runReport", mock_server.uri());
        let res = send_with_retry(|| client.post(&url), &RetryPolicy::immediate())
            .await
            .unwrap();

        assert_eq!(res.status(), 502);
    }

    #[tokio::test]
    async fn test_connection_refused_is_error_after_retry() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new();
        let url = format!("http://{}/token", addr);
        let err = send_with_retry(|| client.post(&url), &RetryPolicy::immediate())
            .await
            .unwrap_err();
        assert!(err.is_connect() || err.is_request());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 300,
            jitter_ms: 0,
            status_codes: vec![500],
        };
        assert_eq!(backoff(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff(&policy, 5), Duration::from_millis(300));
    }
}
