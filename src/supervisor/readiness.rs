//! Health-endpoint polling with bounded attempts

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;

/// Fixed-interval retry: at most `max_attempts` tries, `interval` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetrySchedule {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Run `attempt` (given the 1-based attempt number) until it returns `true`.
    ///
    /// Sleeps only between attempts, so exhausting `N` tries takes at least `(N-1)×interval`.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        for n in 1..=self.max_attempts {
            if attempt(n).await {
                return true;
            }
            if n < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }
}

pub struct ReadinessProber {
    client: reqwest::Client,
    url: String,
}

impl ReadinessProber {
    pub fn new(url: impl Into<String>, probe_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET against the health endpoint; only `200` counts as ready
    pub async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!("readiness probe {} failed: {e}", self.url);
                false
            }
        }
    }

    pub async fn wait_until_ready(&self, max_attempts: u32, interval: Duration) -> bool {
        let schedule = RetrySchedule::new(max_attempts, interval);
        let ready = schedule
            .run(|n| async move {
                let ok = self.probe().await;
                if !ok {
                    debug!("companion not ready (attempt {n}/{max_attempts})");
                }
                ok
            })
            .await;
        if ready {
            info!("Companion service is ready at {}", self.url);
        } else {
            warn!(
                "Companion service not ready at {} after {max_attempts} attempts",
                self.url
            );
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_server::serve;
    use axum::{Router, http::StatusCode, routing::get};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn schedule_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let schedule = RetrySchedule::new(5, Duration::from_millis(1));
        let ok = schedule
            .run(|n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { n == 3 }
            })
            .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn schedule_never_exceeds_max_attempts() {
        let calls = AtomicU32::new(0);
        let schedule = RetrySchedule::new(4, Duration::from_millis(1));
        let ok = schedule
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { false }
            })
            .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn dead_endpoint_waits_between_attempts() {
        let prober =
            ReadinessProber::new("http://127.0.0.1:1/readiness", Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        assert!(!prober.wait_until_ready(3, Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn becomes_ready_once_endpoint_answers() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/readiness",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let base = serve(router).await;
        let prober = ReadinessProber::new(format!("{base}/readiness"), Duration::from_secs(1)).unwrap();
        assert!(prober.wait_until_ready(10, Duration::from_millis(10)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
