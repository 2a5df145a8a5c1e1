use std::{future::Future, time::Duration};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use once_cell::sync::Lazy;
use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::errors::StorefrontError;

/// Shared connection pool for every platform callout.
pub(crate) static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Decodes the payload of a compact JWS (`header.payload.signature`), without
/// performing any signature verification.
pub(crate) fn decode_jws_payload<T: DeserializeOwned>(jws: &str) -> Result<T, StorefrontError> {
    let mut segments = jws.trim().split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) if segments.next().is_none() => payload,
        _ => {
            return Err(StorefrontError::invalid_jws(
                "expected three dot-separated segments",
            ))
        }
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(payload))
        .map_err(|e| StorefrontError::invalid_jws_with_debug("payload is not base64", &e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StorefrontError::invalid_jws_with_debug("failed to parse JWS payload", &e))
}

/// Backoff settings for idempotent reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    #[cfg(test)]
    pub(crate) fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(
                rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64),
            )
        };
        (exponential + jitter).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the policy's retries are used up.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: impl Fn(&StorefrontError) -> bool,
    mut op: F,
) -> Result<T, StorefrontError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorefrontError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient storefront error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
