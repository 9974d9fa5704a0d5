use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::debug;

use vigil_core::traits::NetworkProbe;
use vigil_core::types::NetworkLatency;

/// Measures round-trip latency with an HTTP HEAD request.
pub struct HttpNetworkProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpNetworkProbe {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl NetworkProbe for HttpNetworkProbe {
    fn fetch(&self) -> BoxFuture<'_, NetworkLatency> {
        Box::pin(async move {
            let started = Instant::now();
            match self
                .client
                .head(&self.url)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(_) => NetworkLatency::Millis(started.elapsed().as_millis() as u64),
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Network probe failed");
                    NetworkLatency::Offline
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_target_is_offline() {
        // Port 9 on localhost is discard; nothing should be listening.
        let probe = HttpNetworkProbe::new("http://127.0.0.1:9", 500);
        assert_eq!(probe.fetch().await, NetworkLatency::Offline);
    }

    #[tokio::test]
    async fn test_invalid_url_is_offline() {
        let probe = HttpNetworkProbe::new("not a url", 100);
        assert_eq!(probe.fetch().await, NetworkLatency::Offline);
    }
}
