//! Readiness gate
//!
//! Polls a service until it reports ready. A process that answers but is
//! still loading keeps the gate waiting up to the warm-up ceiling; a host
//! that answers while the service does not fails the gate on that sample.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::http::health::HealthProbe;
use crate::models::health::{HealthEndpoint, HealthSignal, ReadinessPhase};

/// Polling policy. The warm-up ceiling is a knob: model servers need
/// anywhere from seconds to many minutes to load weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Outcome of a passed gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyResult {
    pub polls: u32,
    pub elapsed: Duration,
    pub signal: HealthSignal,
}

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    policy: ReadinessPolicy,
}

impl ReadinessGate {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    /// Wait until the endpoint reports ready
    pub async fn await_ready(
        &self,
        probe: &dyn HealthProbe,
        endpoint: &HealthEndpoint,
        cancel: &CancellationToken,
    ) -> Result<ReadyResult, DeployError> {
        let started = Instant::now();
        let mut polls = 0u32;
        let mut warming = false;
        let mut last_phase = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled(format!(
                    "waiting for {} to become ready",
                    endpoint.host()
                )));
            }

            polls += 1;
            let signal = probe.sample(endpoint).await;
            let phase = signal.phase();
            if last_phase != Some(phase) {
                info!("Service on {} is {:?} (poll {})", endpoint.host(), phase, polls);
                last_phase = Some(phase);
            }

            match phase {
                ReadinessPhase::Ready => {
                    return Ok(ReadyResult {
                        polls,
                        elapsed: started.elapsed(),
                        signal,
                    });
                }
                ReadinessPhase::Crashed => {
                    warn!("Service on {} stopped responding", endpoint.host());
                    return Err(DeployError::ServiceCrashed(format!(
                        "{} reachable but the service does not respond (poll {})",
                        endpoint.host(),
                        polls
                    )));
                }
                ReadinessPhase::Warming => warming = true,
                ReadinessPhase::Booting => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.policy.timeout {
                return Err(DeployError::ReadinessTimeout {
                    polls,
                    elapsed_secs: elapsed.as_secs(),
                    warming,
                });
            }

            let delay = self.policy.interval.min(self.policy.timeout - elapsed);
            debug!("Next readiness poll in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DeployError::Cancelled(format!(
                        "waiting for {} to become ready",
                        endpoint.host()
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
