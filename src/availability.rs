use crate::{service::Service, Error, Result, ServiceId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Polls a freshly started service until its liveness probe succeeds
///
/// Bound to one service handle at creation and consumed by [`wait_for_startup`](Self::wait_for_startup).
pub struct AvailabilityChecker<S> {
    service_id: ServiceId,
    service: Arc<S>,
    polls: u32,
}

impl<S> fmt::Debug for AvailabilityChecker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailabilityChecker")
            .field("service_id", &self.service_id)
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}

impl<S: Service> AvailabilityChecker<S> {
    pub(crate) fn new(service_id: ServiceId, service: Arc<S>) -> Self {
        Self {
            service_id,
            service,
            polls: 0,
        }
    }

    /// ID of the service being checked
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Probe up to `max_attempts` times, sleeping `poll_interval` between failed probes.
    ///
    /// Returns on the first successful probe. No sleep follows the last attempt.
    /// `max_attempts == 0` fails without probing.
    pub async fn wait_for_startup(mut self, poll_interval: Duration, max_attempts: u32) -> Result<()> {
        for attempt in 1..=max_attempts {
            self.polls += 1;
            if self.service.is_available().await {
                tracing::debug!(
                    "Service '{}' available after {} attempt(s)",
                    self.service_id,
                    attempt
                );
                return Ok(());
            }

            tracing::trace!(
                "Service '{}' not available (attempt {}/{})",
                self.service_id,
                attempt,
                max_attempts
            );

            if attempt < max_attempts {
                tokio::time::sleep(poll_interval).await;
            }
        }

        Err(Error::AvailabilityTimeout {
            service_id: self.service_id,
            attempts: self.polls,
            interval: poll_interval,
        })
    }
}
