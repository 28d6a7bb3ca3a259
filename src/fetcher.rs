//! The `Fetcher` capability: the one external collaborator Extraction
//! depends on. HTTP fetch details — connection pooling, TLS, robots.txt,
//! redirects — are explicitly out of scope for this crate (spec §1); we
//! only define the contract and, behind a feature flag, a thin convenience
//! implementation for embedders who don't want to write their own.

use crate::types::Page;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Outcome of a single *successful* fetch attempt, as reported back to the
/// adaptive rate limiter via `Feedback`.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: Option<u16>,
    pub latency: Duration,
    pub retry_after: Option<Duration>,
}

/// Outcome of a *failed* fetch attempt. Carries enough for the limiter's
/// feedback classification (status/err) even on failure, and for the retry
/// scheduler's Retry-After ratchet.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub message: String,
    pub status: Option<u16>,
    pub latency: Duration,
    pub retry_after: Option<Duration>,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchError {}

/// `fetch(ctx, url) -> (Page, error)` from spec §6. Implementors must
/// honour cancellation of the passed token and populate `Page::url` and
/// `Page::content` on success.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: tokio_util_cancel::CancelToken,
    ) -> Result<(Page, FetchOutcome), FetchError>;
}

/// Minimal cancellation token shared across the engine. A thin newtype over
/// `tokio::sync::watch` so every suspension point (queue recv, limiter
/// sleep, fetch call) can `select!` against the same signal, per spec §5.
pub mod tokio_util_cancel {
    use tokio::sync::watch;

    #[derive(Clone, Debug)]
    pub struct CancelToken {
        rx: watch::Receiver<bool>,
    }

    #[derive(Debug)]
    pub struct CancelHandle {
        tx: watch::Sender<bool>,
    }

    pub fn channel() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    impl CancelHandle {
        pub fn cancel(&self) {
            let _ = self.tx.send(true);
        }
    }

    impl CancelToken {
        pub fn is_cancelled(&self) -> bool {
            *self.rx.borrow()
        }

        /// Resolves once the token is cancelled. Intended for use inside
        /// `tokio::select!` alongside a real suspension point.
        pub async fn cancelled(&self) {
            let mut rx = self.rx.clone();
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

pub use tokio_util_cancel::{CancelHandle, CancelToken};

#[cfg(feature = "reqwest-fetcher")]
pub mod reqwest_fetcher;
#[cfg(feature = "reqwest-fetcher")]
pub use reqwest_fetcher::{ReqwestFetcher, ReqwestFetcherConfig};

/// In-memory `Fetcher` used by tests and as a documentation example of the
/// trait contract. Not part of the public ambient-fetch story — embedders
/// bring their own.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_double {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    pub enum Script {
        Success(Page),
        FailThenSucceed { fail_times: u32, status: u16 },
        AlwaysFail { status: u16 },
    }

    /// A scripted fetcher: each URL maps to a canned sequence of outcomes so
    /// scenario tests (retry-then-succeed, circuit-open, ...) can be written
    /// deterministically.
    pub struct ScriptedFetcher {
        scripts: Mutex<HashMap<String, (Script, u32)>>,
        latency: Duration,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                latency: Duration::from_millis(1),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn script(&self, url: impl Into<String>, script: Script) {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.into(), (script, 0));
        }
    }

    impl Default for ScriptedFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            url: &str,
            _cancel: CancelToken,
        ) -> Result<(Page, FetchOutcome), FetchError> {
            let started = Instant::now();
            tokio::time::sleep(self.latency).await;
            let mut guard = self.scripts.lock().unwrap();
            let entry = guard.get_mut(url).ok_or_else(|| FetchError {
                message: format!("no script for {url}"),
                status: None,
                latency: started.elapsed(),
                retry_after: None,
            })?;
            let (script, calls) = entry;
            *calls += 1;
            match script {
                Script::Success(page) => Ok((
                    page.clone(),
                    FetchOutcome {
                        status: Some(200),
                        latency: started.elapsed(),
                        retry_after: None,
                    },
                )),
                Script::FailThenSucceed { fail_times, status } => {
                    if *calls <= *fail_times {
                        Err(FetchError {
                            message: format!("status {status}"),
                            status: Some(*status),
                            latency: started.elapsed(),
                            retry_after: None,
                        })
                    } else {
                        Ok((
                            Page::new(url, format!("ok after {calls} attempts")),
                            FetchOutcome {
                                status: Some(200),
                                latency: started.elapsed(),
                                retry_after: None,
                            },
                        ))
                    }
                }
                Script::AlwaysFail { status } => Err(FetchError {
                    message: format!("status {status}"),
                    status: Some(*status),
                    latency: started.elapsed(),
                    retry_after: None,
                }),
            }
        }
    }
}
