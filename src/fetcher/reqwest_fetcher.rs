//! Convenience [`Fetcher`] backed by `reqwest`, for embedders who don't
//! want to write their own. Grounded on the client-builder conventions in
//! the teacher's `riptide-fetch::ReliableHttpClient` — connection pooling,
//! compression, and timeouts live on the `reqwest::Client`, not here; this
//! type only adapts responses onto [`FetchOutcome`]/[`FetchError`]. Retries
//! and circuit-breaking are the engine's job (spec §4.2), so this fetcher
//! makes exactly one HTTP request per `fetch` call.

use super::{tokio_util_cancel::CancelToken, FetchError, FetchOutcome, Fetcher};
use crate::types::Page;
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct ReqwestFetcherConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ReqwestFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "ariadne/0.1".to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(20),
        }
    }
}

pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(cfg: ReqwestFetcherConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(cfg.user_agent)
            .gzip(true)
            .brotli(true)
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

fn retry_after_from(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    #[instrument(skip(self, cancel), fields(url = %url))]
    async fn fetch(
        &self,
        url: &str,
        cancel: CancelToken,
    ) -> Result<(Page, FetchOutcome), FetchError> {
        let started = Instant::now();
        let response = tokio::select! {
            result = self.client.get(url).send() => result,
            _ = cancel.cancelled() => {
                return Err(FetchError {
                    message: "cancelled".to_string(),
                    status: None,
                    latency: started.elapsed(),
                    retry_after: None,
                });
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return Err(FetchError {
                    message: e.to_string(),
                    status: e.status().map(|s| s.as_u16()),
                    latency: started.elapsed(),
                    retry_after: None,
                });
            }
        };

        let status = response.status();
        let retry_after = retry_after_from(response.headers());
        let mut headers = std::collections::HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }

        if !status.is_success() {
            return Err(FetchError {
                message: format!("http status {status}"),
                status: Some(status.as_u16()),
                latency: started.elapsed(),
                retry_after,
            });
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return Err(FetchError {
                    message: e.to_string(),
                    status: Some(status.as_u16()),
                    latency: started.elapsed(),
                    retry_after,
                });
            }
        };

        let mut page = Page::new(url, body);
        page.headers = headers;
        Ok((
            page,
            FetchOutcome {
                status: Some(status.as_u16()),
                latency: started.elapsed(),
                retry_after,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tokio_util_cancel;

    #[tokio::test]
    async fn fetches_body_and_headers() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new(ReqwestFetcherConfig::default()).unwrap();
        let (_handle, cancel) = tokio_util_cancel::channel();
        let (page, outcome) = fetcher.fetch(&server.uri(), cancel).await.unwrap();
        assert_eq!(page.content, "hello");
        assert_eq!(outcome.status, Some(200));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new(ReqwestFetcherConfig::default()).unwrap();
        let (_handle, cancel) = tokio_util_cancel::channel();
        let err = fetcher.fetch(&server.uri(), cancel).await.unwrap_err();
        assert_eq!(err.status, Some(503));
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }
}
