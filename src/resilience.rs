use crate::error::{MeshError, MeshResult};
/// Resilience Module
///
/// Retry and timeout helpers shared by the bridge client and the transfer
/// orchestrators.
///
/// Key features:
/// - Configurable retry with exponential backoff, bounded by attempt count
/// - A transience predicate so permanent failures surface immediately
/// - Operation timeouts
///
/// The retry policy is owned by the call site: add-shard negotiation and peer
/// RPCs carry budgets, everything else fails on first error.
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Retry configuration for resilient operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A config that makes `budget + 1` attempts in total.
    pub fn with_budget(budget: u32) -> Self {
        Self {
            max_attempts: budget as usize + 1,
            ..Self::default()
        }
    }
}

/// Retry a future operation with exponential backoff.
///
/// `should_retry` decides whether a failure is worth another attempt;
/// permanent errors are returned immediately regardless of remaining budget.
pub async fn retry_async<F, Fut, T, P>(
    operation: F,
    config: RetryConfig,
    should_retry: P,
    operation_name: &str,
) -> MeshResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = MeshResult<T>>,
    P: Fn(&MeshError) -> bool,
{
    let mut delay = config.initial_delay;
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        debug!(
            "Attempting {} (attempt {}/{})",
            operation_name, attempt, config.max_attempts
        );

        let start = Instant::now();
        match operation().await {
            Ok(result) => {
                debug!(
                    "{} succeeded on attempt {} after {:?}",
                    operation_name,
                    attempt,
                    start.elapsed()
                );
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    error!("{} failed permanently: {}", operation_name, e);
                    return Err(e);
                }
                last_error = Some(e);
                if attempt < config.max_attempts {
                    warn!(
                        "{} failed on attempt {}, retrying in {:?}: {}",
                        operation_name,
                        attempt,
                        delay,
                        last_error.as_ref().unwrap()
                    );
                    sleep(delay).await;
                    delay = std::cmp::min(
                        Duration::from_millis(
                            (delay.as_millis() as f64 * config.backoff_multiplier) as u64,
                        ),
                        config.max_delay,
                    );
                } else {
                    error!(
                        "{} failed after {} attempts: {}",
                        operation_name,
                        config.max_attempts,
                        last_error.as_ref().unwrap()
                    );
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| MeshError::Fatal("Retry failed with no error".to_string())))
}

/// Bound a future by a deadline.
///
/// The data-channel client wraps every connect, frame send and frame receive
/// in this so a stalled farmer surfaces as an error instead of hanging its
/// shard task; callers on that path re-wrap the result as `Transfer` with
/// peer context.
pub async fn with_timeout<F>(future: F, limit: Duration, operation_name: &str) -> MeshResult<F::Output>
where
    F: std::future::Future,
{
    match tokio::time::timeout(limit, future).await {
        Ok(output) => Ok(output),
        Err(_) => {
            warn!("{} exceeded its {:?} deadline", operation_name, limit);
            Err(MeshError::Network(format!("{} timed out", operation_name)))
        }
    }
}
