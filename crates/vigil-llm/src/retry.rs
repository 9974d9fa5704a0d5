use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::warn;

use vigil_core::config::RetryConfig;
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::Reasoner;
use vigil_core::types::Correlation;

/// Retries transient failures of the initial reasoner request.
///
/// Only opening the stream is retried; once fragments flow, errors pass through.
pub struct RetryingReasoner {
    inner: Box<dyn Reasoner>,
    retry_config: RetryConfig,
}

impl RetryingReasoner {
    pub fn new(inner: Box<dyn Reasoner>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &VigilError) -> bool {
    match e {
        VigilError::Reasoner(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // 0.8x to 1.2x jitter
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Reasoner for RetryingReasoner {
    fn generate_stream(
        &self,
        prompt: String,
        correlation: Correlation,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self
                    .inner
                    .generate_stream(prompt.clone(), correlation.clone())
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying reasoner request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
