//! Task runner with circuit breaker pattern.
//!
//! Wraps each background loop with automatic retry, exponential backoff and
//! failure tracking so no stage of the pipeline can degrade silently. Loops
//! observe a shutdown channel and exit at their next suspension point.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Circuit breaker configuration for background tasks
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum number of consecutive failures before panic
    pub max_consecutive_failures: u32,
    /// Initial delay between retries
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Internal state for circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl CircuitBreakerState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) {
        self.consecutive_failures += 1;
        // Exponential backoff with cap
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run a background task under circuit breaker protection until shutdown.
///
/// `task_fn` executes one iteration of the task (one tick plus its own
/// sleep). On failure the iteration is retried with exponential backoff;
/// after `max_consecutive_failures` consecutive failures the function
/// panics so the operator sees a dead critical task instead of silence.
///
/// # Panics
/// Panics after `max_consecutive_failures` consecutive failures.
pub async fn run_with_circuit_breaker<F, Fut>(
    task_name: &str,
    config: CircuitBreakerConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = CircuitBreakerState::new(config.initial_retry_delay);

    loop {
        if *shutdown.borrow() {
            info!("Task '{}' stopping on shutdown signal", task_name);
            return;
        }

        match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
            }
            Err(e) => {
                state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );

                if state.consecutive_failures >= config.max_consecutive_failures {
                    panic!(
                        "FATAL: Task '{}' exceeded maximum consecutive failures ({}). \
                         Last error: {}. System cannot continue with failed critical task.",
                        task_name, config.max_consecutive_failures, e
                    );
                }

                warn!(
                    "Task '{}' will retry in {:?}",
                    task_name, state.current_retry_delay
                );
                tokio::select! {
                    _ = sleep(state.current_retry_delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Sleep that wakes early when the shutdown flag flips.
pub async fn interruptible_sleep(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}
