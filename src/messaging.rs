//! Serialized, retried, time-boxed dispatch to worker slots.
//!
//! [`Messenger::send`] holds a per-slot async mutex for the whole exchange,
//! retries [`DriverError::NotListening`] with the injected
//! [`RetryPolicy`], and wraps everything in a hard timeout. Driver errors are
//! mapped onto the engine's error classes:
//!
//! | Driver outcome                  | Error                          |
//! |---------------------------------|--------------------------------|
//! | `NotListening`, retries spent   | [`RelayError::StaleWorker`]    |
//! | `Closed`                        | [`RelayError::NonRecoverable`] |
//! | `Transport`, `Protocol`         | [`RelayError::StaleWorker`]    |
//! | `success = false` or empty text | [`RelayError::WorkerRejected`] |
//! | hard timeout                    | [`RelayError::DispatchTimeout`]|

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};
use crate::retry::RetryPolicy;
use crate::worker::{DriverError, SlotLease, WorkerRequest, WorkerResponse};

/// Sends prompts through leased slots.
#[derive(Debug, Default)]
pub struct Messenger {
    policy: RetryPolicy,
    slot_locks: DashMap<usize, Arc<Mutex<()>>>,
}

impl Messenger {
    /// Creates a messenger retrying with `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            slot_locks: DashMap::new(),
        }
    }

    fn slot_lock(&self, index: usize) -> Arc<Mutex<()>> {
        self.slot_locks.entry(index).or_default().clone()
    }

    /// Sends `request` to the session behind `lease` and waits at most
    /// `timeout` for a successful answer.
    pub async fn send(
        &self,
        lease: &SlotLease,
        request: &WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerResponse> {
        let slot = lease.index();
        let lock = self.slot_lock(slot);
        let _serialized = lock.lock().await;

        tracing::debug!(slot, task_id = %request.task_id, timeout_secs = timeout.as_secs(), "dispatching");
        let exchange = self.policy.run(
            None,
            |e: &DriverError| matches!(e, DriverError::NotListening(_)),
            move |attempt| {
                if attempt > 0 {
                    tracing::warn!(slot, attempt, task_id = %request.task_id, "session not listening, retrying");
                }
                lease.driver().execute(lease.handle(), request, timeout)
            },
        );

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(RelayError::DispatchTimeout {
                    task_id: request.task_id.clone(),
                    timeout,
                })
            }
        };

        match outcome {
            Ok(response) if response.success && !response.payload.trim().is_empty() => Ok(response),
            Ok(response) if response.success => Err(RelayError::WorkerRejected {
                task_id: request.task_id.clone(),
                message: "empty result".to_string(),
            }),
            Ok(response) => Err(RelayError::WorkerRejected {
                task_id: request.task_id.clone(),
                message: response.payload,
            }),
            Err(DriverError::Closed(message)) => Err(RelayError::NonRecoverable {
                slot: Some(slot),
                message,
            }),
            Err(e) => Err(RelayError::StaleWorker {
                slot,
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::task::{TaskId, TaskMode};
    use crate::worker::{DriverRegistry, ScriptedDriver, ScriptedReply, SlotOutcome, WorkerPool};

    fn request(prompt: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: "g1:C5".into(),
            prompt: prompt.into(),
            mode: TaskMode::Normal,
        }
    }

    fn pool(driver: ScriptedDriver) -> WorkerPool {
        let mut registry = DriverRegistry::new();
        registry.register("w", Arc::new(driver));
        WorkerPool::new(1, registry, PoolSettings::default())
    }

    async fn send_once(driver: ScriptedDriver, policy: RetryPolicy, timeout: Duration) -> Result<WorkerResponse> {
        let pool = pool(driver);
        let lease = pool
            .acquire("w", 0, &TaskId::new(1, &"C5".parse().unwrap()))
            .await
            .unwrap();
        let result = Messenger::new(policy).send(&lease, &request("p"), timeout).await;
        pool.release(lease, SlotOutcome::Healthy).await;
        result
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn not_listening_is_retried_then_succeeds() {
        let driver = ScriptedDriver::new().on_prompt(
            "p",
            [
                ScriptedReply::Error(DriverError::NotListening("boot".into())),
                ScriptedReply::Error(DriverError::NotListening("boot".into())),
                ScriptedReply::answer("ok"),
            ],
        );
        let response = send_once(driver, quick(3), Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.payload, "ok");
    }

    #[tokio::test]
    async fn exhausted_not_listening_becomes_stale_worker() {
        let driver = ScriptedDriver::new().with_default(ScriptedReply::Error(DriverError::NotListening("boot".into())));
        let err = send_once(driver, quick(2), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::StaleWorker { slot: 0, .. }));
    }

    #[tokio::test]
    async fn closed_is_non_recoverable_without_retry() {
        let driver = ScriptedDriver::new().on_prompt(
            "p",
            [
                ScriptedReply::Error(DriverError::Closed("window gone".into())),
                ScriptedReply::answer("never"),
            ],
        );
        let err = send_once(driver, quick(5), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::NonRecoverable { slot: Some(0), .. }));
    }

    #[tokio::test]
    async fn rejection_and_empty_results_are_worker_rejected() {
        let driver = ScriptedDriver::new().with_default(ScriptedReply::Reject("refused".into()));
        let err = send_once(driver, quick(1), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::WorkerRejected { ref message, .. } if message == "refused"));
        assert!(!err.poisons_slot());

        let driver = ScriptedDriver::new().with_default(ScriptedReply::answer("  "));
        let err = send_once(driver, quick(1), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::WorkerRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sessions_time_out() {
        let driver = ScriptedDriver::new().with_default(ScriptedReply::Hang);
        let err = send_once(driver, quick(1), Duration::from_secs(540)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.poisons_slot());
    }
}
