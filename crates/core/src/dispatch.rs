use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use crate::audit::{AuditKind, EventRecord};
use crate::domain::instance::{ApprovalInstance, DispatchState};
use crate::registry::AdapterError;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Total bound on side-effect attempts, first call included.
    pub max_attempts: u32,
    pub base_delay_secs: i64,
    pub backoff_multiplier: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_attempts: 4, base_delay_secs: 5, backoff_multiplier: 2 }
    }
}

/// Result of claiming a dispatch attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The attempt counter was bumped; the caller must persist the claim
    /// before invoking the adapter, then report the result through
    /// [`ActionDispatcher::finish_attempt`].
    Claimed { attempt: u32 },
    NotDue { next_attempt_at: DateTime<Utc> },
    NotPending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { event: EventRecord },
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    Failed { event: EventRecord },
    NotPending,
}

/// Drives the terminal side effect for an instance. The dispatcher never
/// sleeps: retry timing is written into the instance's dispatch state and
/// a driver (the service, or a scheduled `retry_due_dispatches` call)
/// attempts again once due. Side-effect failure never touches the
/// approval outcome.
#[derive(Clone, Debug, Default)]
pub struct ActionDispatcher {
    config: DispatchConfig,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self { config }
    }

    /// Claim the next attempt. The claim bumps the attempt counter and
    /// advances `next_attempt_at` to the attempt's retry deadline, so a
    /// persisted claim occupies the slot: concurrent drivers polling the
    /// due list skip work that is already in flight, and a claimant that
    /// dies mid-call loses the slot once the deadline passes. The caller
    /// must persist the claim before invoking the adapter.
    pub fn begin_attempt(&self, instance: &mut ApprovalInstance, now: DateTime<Utc>) -> ClaimOutcome {
        match &instance.dispatch {
            DispatchState::Pending { attempts, next_attempt_at, last_error } => {
                if now < *next_attempt_at {
                    return ClaimOutcome::NotDue { next_attempt_at: *next_attempt_at };
                }
                let attempt = attempts + 1;
                instance.dispatch = DispatchState::Pending {
                    attempts: attempt,
                    next_attempt_at: now + Duration::seconds(self.backoff_secs(attempt)),
                    last_error: last_error.clone(),
                };
                instance.revision += 1;
                instance.updated_at = now;
                ClaimOutcome::Claimed { attempt }
            }
            _ => ClaimOutcome::NotPending,
        }
    }

    /// Record the adapter call's result on the claimed attempt.
    pub fn finish_attempt(
        &self,
        instance: &mut ApprovalInstance,
        result: Result<(), AdapterError>,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let DispatchState::Pending { attempts, .. } = instance.dispatch.clone() else {
            return DispatchOutcome::NotPending;
        };

        let outcome = match result {
            Ok(()) => {
                instance.dispatch = DispatchState::Dispatched { attempts, completed_at: now };
                DispatchOutcome::Dispatched {
                    event: EventRecord::new(AuditKind::ActionDispatched, "dispatcher", now)
                        .with_metadata("attempts", attempts.to_string())
                        .with_metadata("final_status", instance.status.as_str()),
                }
            }
            Err(err) if err.retryable && attempts < self.config.max_attempts => {
                let next_attempt_at = now + Duration::seconds(self.backoff_secs(attempts));
                warn!(
                    instance_id = %instance.id,
                    attempt = attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %err.message,
                    "terminal side effect failed, retry scheduled"
                );
                instance.dispatch = DispatchState::Pending {
                    attempts,
                    next_attempt_at,
                    last_error: Some(err.message),
                };
                DispatchOutcome::RetryScheduled { next_attempt_at }
            }
            Err(err) => {
                error!(
                    instance_id = %instance.id,
                    attempts,
                    error = %err.message,
                    "terminal side effect failed permanently"
                );
                instance.dispatch = DispatchState::Failed {
                    attempts,
                    last_error: err.message.clone(),
                    failed_at: now,
                };
                DispatchOutcome::Failed {
                    event: EventRecord::new(AuditKind::ActionFailed, "dispatcher", now)
                        .with_metadata("attempts", attempts.to_string())
                        .with_metadata("final_status", instance.status.as_str())
                        .with_metadata("error", err.message),
                }
            }
        };

        instance.revision += 1;
        instance.updated_at = now;
        outcome
    }

    fn backoff_secs(&self, completed_attempts: u32) -> i64 {
        let exponent = completed_attempts.saturating_sub(1);
        self.config.base_delay_secs
            * i64::from(self.config.backoff_multiplier.saturating_pow(exponent))
    }
}
