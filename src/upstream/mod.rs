use crate::cache::key::CacheKeyGenerator;
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use rand::Rng;
use reqwest::{Client, ClientBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// Result of one upstream fetch
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub size: usize,
}

/// Abstraction over the upstream feed so the pipeline can be exercised
/// without the network.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(&self, path: &str, params: &HashMap<String, String>) -> Result<FetchedResponse>;
}

/// Shared pooled HTTP client; building a reqwest client is expensive and
/// one pool serves every request.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    ClientBuilder::new()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .use_rustls_tls()
        .build()
        .expect("Failed to create HTTP client")
});

/// HTTP client for the vendor feed with retry, exponential backoff, and
/// jitter. The API key is appended at request time and never appears in
/// logs or cache keys.
pub struct UpstreamClient {
    config: UpstreamConfig,
    http_client: Client,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            http_client: HTTP_CLIENT.clone(),
        }
    }

    /// Build the request URL: base + path, sorted params, then the key.
    /// Client-supplied credential-like params are dropped rather than
    /// forwarded.
    fn build_url(&self, path: &str, params: &HashMap<String, String>) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|e| ProxyError::BadRequest(format!("invalid upstream URL: {e}")))?;

        let mut sorted: Vec<(&String, &String)> = params
            .iter()
            .filter(|(k, _)| !CacheKeyGenerator::is_sensitive(k))
            .collect();
        sorted.sort_by_key(|(k, _)| *k);

        {
            let mut query = url.query_pairs_mut();
            for (k, v) in sorted {
                query.append_pair(k, v);
            }
            if let Some(key) = &self.config.api_key {
                query.append_pair("key", key);
            }
        }

        Ok(url)
    }

    /// Backoff before retry attempt `k+1`: base × 2^k plus uniform jitter
    /// in [0, base).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        Duration::from_millis(base.saturating_mul(1 << attempt) + jitter)
    }

    async fn execute_once(&self, url: Url) -> Result<FetchedResponse> {
        let response = self
            .http_client
            .get(url)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::UpstreamTimeout(self.config.timeout_seconds)
                } else {
                    ProxyError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(ProxyError::Network)?
            .to_vec();

        if (200..300).contains(&status) {
            let size = body.len();
            return Ok(FetchedResponse {
                status,
                body,
                content_type,
                size,
            });
        }

        if status >= 500 {
            Err(ProxyError::Upstream5xx { status })
        } else {
            Err(ProxyError::Upstream4xx {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

#[async_trait]
impl UpstreamFetcher for UpstreamClient {
    /// Fetch with retry. Network errors, timeouts, 5xx, and 429 are
    /// retried with backoff; other 4xx surface immediately.
    async fn fetch(&self, path: &str, params: &HashMap<String, String>) -> Result<FetchedResponse> {
        let url = self.build_url(path, params)?;
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt - 1);
                debug!("Retrying '{path}' (attempt {}) after {delay:?}", attempt + 1);
                sleep(delay).await;
            }

            match self.execute_once(url.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!("Upstream attempt {} for '{path}' failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Retryable failures exhausted the budget
        match last_error {
            Some(ProxyError::Upstream4xx { status: 429, body }) => {
                Err(ProxyError::Upstream4xx { status: 429, body })
            }
            _ => Err(ProxyError::UpstreamUnavailable { attempts }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> UpstreamClient {
        UpstreamClient::new(UpstreamConfig {
            base_url: base_url.to_string(),
            api_key: Some("secret-key".to_string()),
            timeout_seconds: 5,
            max_retries: 3,
            retry_base_delay_ms: 10,
        })
    }

    #[test]
    fn url_contains_sorted_params_and_key() {
        let c = client("https://feeds.example.com");
        let mut params = HashMap::new();
        params.insert("tour".to_string(), "pga".to_string());
        params.insert("season".to_string(), "2024".to_string());

        let url = c.build_url("get-schedule", &params).unwrap();
        assert_eq!(
            url.as_str(),
            "https://feeds.example.com/get-schedule?season=2024&tour=pga&key=secret-key"
        );
    }

    #[test]
    fn client_supplied_credentials_are_not_forwarded() {
        let c = client("https://feeds.example.com");
        let mut params = HashMap::new();
        params.insert("key".to_string(), "attacker".to_string());
        params.insert("token".to_string(), "attacker".to_string());
        params.insert("season".to_string(), "2024".to_string());

        let url = c.build_url("get-schedule", &params).unwrap();
        assert_eq!(
            url.as_str(),
            "https://feeds.example.com/get-schedule?season=2024&key=secret-key"
        );
    }

    #[test]
    fn path_slashes_are_normalized() {
        let c = client("https://feeds.example.com/");
        let url = c.build_url("/preds/get-dg-rankings", &HashMap::new()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://feeds.example.com/preds/get-dg-rankings?key=secret-key"
        );
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let c = client("https://feeds.example.com");

        for attempt in 0..3u32 {
            let delay = c.backoff_delay(attempt).as_millis() as u64;
            let base = 10u64 * (1 << attempt);
            assert!(delay >= base, "delay {delay} below base {base}");
            assert!(delay < base + 10, "delay {delay} exceeds base + jitter");
        }
    }

    #[tokio::test]
    async fn fetch_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/get-schedule")
            .match_query(mockito::Matcher::UrlEncoded("key".into(), "secret-key".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"schedule":[]}"#)
            .create_async()
            .await;

        let c = client(&server.url());
        let response = c.fetch("get-schedule", &HashMap::new()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/json");
        assert_eq!(response.body, br#"{"schedule":[]}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_exhausts_retries_into_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rankings")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let c = client(&server.url());
        let err = c.fetch("rankings", &HashMap::new()).await.unwrap_err();

        assert!(matches!(
            err,
            ProxyError::UpstreamUnavailable { attempts: 3 }
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let c = client(&server.url());
        let err = c.fetch("missing", &HashMap::new()).await.unwrap_err();

        assert!(matches!(err, ProxyError::Upstream4xx { status: 404, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_retries_429_until_exhaustion() {
        let mut server = mockito::Server::new_async().await;
        // Three hits prove 429 re-enters the retry loop instead of
        // surfacing immediately like other 4xx.
        let throttled = server
            .mock("GET", "/odds")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let c = client(&server.url());
        let err = c.fetch("odds", &HashMap::new()).await.unwrap_err();

        assert!(matches!(err, ProxyError::Upstream4xx { status: 429, .. }));
        throttled.assert_async().await;
    }
}
