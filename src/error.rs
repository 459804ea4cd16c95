//! Error taxonomy and retry policy shared by every capability-port call site.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// The kinds of failure the core can observe from an external collaborator
/// or from its own processing, per the propagation policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RagError {
    /// Network/5xx/timeout from Chat, Embedder, DocumentExtractor, or VectorIndex.
    #[error("transient failure in {port}: {detail}")]
    TransientExternal { port: &'static str, detail: String },

    /// A provider-identified rate-limit signal.
    #[error("rate limited by {port}: {detail}")]
    RateLimited { port: &'static str, detail: String },

    /// Unsupported MIME, oversize file, or missing blob.
    #[error("input rejected: {0}")]
    InputRejected(String),

    /// LLM output could not be parsed where required.
    #[error("schema violation in {port}: {detail}")]
    SchemaViolation { port: &'static str, detail: String },

    /// A vector upsert was acknowledged with fewer records than expected.
    #[error("storage postcondition failed: expected {expected}, got {actual}")]
    StoragePostcondition { expected: usize, actual: usize },

    /// A required capability was not configured.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl RagError {
    /// Whether the error's *kind* is eligible for retry by [`RetryPolicy`].
    ///
    /// `TransientExternal`/`RateLimited` are retried at the adapter boundary;
    /// everything else is a terminal failure for the calling stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::TransientExternal { .. } | RagError::RateLimited { .. }
        )
    }
}

/// A source of jitter for [`RetryPolicy`]. Production code uses
/// [`RandJitter`]; tests inject a fixed value to keep backoff deterministic.
pub trait JitterSource: Send + Sync {
    /// Returns a multiplier in `[1.0 - spread, 1.0 + spread]`.
    fn sample(&self, spread: f64) -> f64;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandJitter;

impl JitterSource for RandJitter {
    fn sample(&self, spread: f64) -> f64 {
        let offset = rand::rng().random_range(-spread..=spread);
        1.0 + offset
    }
}

/// A jitter source that always returns a fixed multiplier; used by tests that
/// need deterministic backoff delays.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self, _spread: f64) -> f64 {
        self.0
    }
}

/// Exponential backoff with jitter: 3 attempts, 1s initial delay, factor 2,
/// jitter +/-20%.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub jitter_spread: f64,
    jitter: std::sync::Arc<dyn JitterSource>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("factor", &self.factor)
            .field("jitter_spread", &self.jitter_spread)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter_spread: 0.2,
            jitter: std::sync::Arc::new(RandJitter),
        }
    }
}

impl RetryPolicy {
    /// A retry policy with no sleeping and a fixed jitter multiplier, for
    /// tests that want retry semantics without wall-clock delay.
    pub fn test_policy(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(0),
            factor: 2.0,
            jitter_spread: 0.0,
            jitter: std::sync::Arc::new(FixedJitter(1.0)),
        }
    }

    /// Runs `op`, retrying on [`RagError::is_retryable`] errors up to
    /// `max_attempts` total tries with exponential backoff. On exhaustion,
    /// returns the last error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RagError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RagError>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let jittered = delay.mul_f64(self.jitter.sample(self.jitter_spread).max(0.0));
                    if !jittered.is_zero() {
                        tokio::time::sleep(jittered).await;
                    }
                    delay = delay.mul_f64(self.factor);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::test_policy(3);
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RagError::TransientExternal {
                            port: "chat",
                            detail: "boom".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable() {
        let policy = RetryPolicy::test_policy(3);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RagError::InputRejected("bad mime".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let policy = RetryPolicy::test_policy(3);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RagError::RateLimited {
                        port: "embedder",
                        detail: "429".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
