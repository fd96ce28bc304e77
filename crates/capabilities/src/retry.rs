use std::{future::Future, time::Duration};

use diffcast_core::config::RetryConfig;
use tower::{
    ServiceBuilder, ServiceExt,
    retry::{
        Policy,
        backoff::{Backoff, ExponentialBackoff, ExponentialBackoffMaker, MakeBackoff},
    },
    service_fn,
    util::rng::HasherRng,
};

use crate::{CapResult, CapabilityError};

/// Fraction of each backoff delay added as random jitter.
const JITTER: f64 = 0.5;

/// Bounded retry with jittered exponential backoff. Each attempt runs under
/// its own timeout; only [`CapabilityError::Transient`] failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::from_config(&RetryConfig::default()) }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let base_delay = Duration::from_millis(config.base_delay_ms.max(1));
        Self {
            attempts: config.attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(config.max_delay_ms).max(base_delay),
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self { attempts: 1, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    fn backoff(&self) -> Option<ExponentialBackoff> {
        if self.attempts <= 1 {
            return None;
        }
        match ExponentialBackoffMaker::new(
            self.base_delay,
            self.max_delay,
            JITTER,
            HasherRng::default(),
        ) {
            Ok(mut maker) => Some(maker.make_backoff()),
            Err(e) => {
                tracing::warn!("Invalid retry backoff, retries disabled: {}", e);
                None
            }
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, timeout: Duration, mut f: F) -> CapResult<T>
    where
        F: FnMut() -> Fut + Clone,
        Fut: Future<Output = CapResult<T>>,
    {
        let policy = TransientOnly {
            operation: operation.to_string(),
            attempt: 1,
            attempts: self.attempts,
            backoff: self.backoff(),
        };
        let attempt = service_fn(move |()| {
            let call = f();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(CapabilityError::Timeout(timeout)),
                }
            }
        });
        ServiceBuilder::new().retry(policy).service(attempt).oneshot(()).await
    }
}

/// Retries transient failures until the attempt budget runs out.
#[derive(Clone)]
struct TransientOnly {
    operation: String,
    attempt: u32,
    attempts: u32,
    backoff: Option<ExponentialBackoff>,
}

impl<T> Policy<(), T, CapabilityError> for TransientOnly {
    type Future = <ExponentialBackoff as Backoff>::Future;

    fn retry(&mut self, _: &mut (), result: &mut CapResult<T>) -> Option<Self::Future> {
        let Err(err) = result else {
            return None;
        };
        match (&*err, self.backoff.as_mut()) {
            (CapabilityError::Transient(message), Some(backoff)) if self.attempt < self.attempts => {
                tracing::warn!(
                    operation = %self.operation,
                    attempt = self.attempt,
                    "Transient failure, retrying: {}",
                    message
                );
                self.attempt += 1;
                Some(backoff.next_backoff())
            }
            _ => {
                tracing::debug!(
                    operation = %self.operation,
                    attempt = self.attempt,
                    kind = err.kind(),
                    "Capability failed: {}",
                    err
                );
                None
            }
        }
    }

    fn clone_request(&mut self, _: &()) -> Option<()> { Some(()) }
}
