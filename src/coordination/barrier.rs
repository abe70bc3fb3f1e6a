use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use super::Coordinator;
use crate::error::{MusterError, Result};
use crate::events::OrchEvent;

#[derive(Debug, Clone, Serialize)]
pub struct BarrierOutcome {
    pub id: String,
    pub success: bool,
    pub arrived: Vec<String>,
}

pub(super) struct BarrierState {
    expected: HashSet<String>,
    arrived: HashSet<String>,
    resolved: Option<bool>,
    done_tx: Option<oneshot::Sender<BarrierOutcome>>,
}

impl BarrierState {
    fn arrived_sorted(&self) -> Vec<String> {
        let mut arrived: Vec<String> = self.arrived.iter().cloned().collect();
        arrived.sort();
        arrived
    }

    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.arrived)
    }
}

/// Awaitable barrier outcome. Dropping the handle does not cancel the
/// barrier; completion and timeout still publish events.
pub struct BarrierHandle {
    rx: oneshot::Receiver<BarrierOutcome>,
}

impl BarrierHandle {
    pub async fn wait(self) -> Result<BarrierOutcome> {
        self.rx
            .await
            .map_err(|_| MusterError::Internal("barrier state dropped".into()))
    }
}

impl Coordinator {
    /// Create a barrier over an expected participant set with a deadline.
    pub fn create_barrier(
        self: &Arc<Self>,
        id: &str,
        expected: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Result<BarrierHandle> {
        if self.barriers.contains_key(id) {
            return Err(MusterError::Conflict(format!("barrier {id} already exists")));
        }

        let (done_tx, rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(BarrierState {
            expected: expected.into_iter().collect(),
            arrived: HashSet::new(),
            resolved: None,
            done_tx: Some(done_tx),
        }));
        self.barriers.insert(id.to_string(), Arc::clone(&state));
        debug!(barrier_id = %id, "Barrier created");

        // Degenerate case: an empty expected set is complete on arrival.
        self.try_complete(id, &state);

        let coordinator = Arc::clone(self);
        let barrier_id = id.to_string();
        let timeout_state = state;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.expire_barrier(&barrier_id, &timeout_state);
        });

        Ok(BarrierHandle { rx })
    }

    /// Record a participant's arrival. Signaling twice is a no-op; signals
    /// after the barrier resolved are accepted but cannot flip the outcome.
    pub fn signal_barrier(self: &Arc<Self>, worker: &str, id: &str) -> Result<Vec<String>> {
        let state = self
            .barriers
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MusterError::NotFound(format!("barrier {id}")))?;

        let arrived = {
            let mut guard = state.lock();
            guard.arrived.insert(worker.to_string());
            guard.arrived_sorted()
        };

        self.events.emit(OrchEvent::BarrierSignal {
            id: id.to_string(),
            worker: worker.to_string(),
            arrived: arrived.clone(),
        });

        self.try_complete(id, &state);
        Ok(arrived)
    }

    fn try_complete(&self, id: &str, state: &Arc<Mutex<BarrierState>>) {
        let outcome = {
            let mut guard = state.lock();
            if guard.resolved.is_some() || !guard.is_complete() {
                None
            } else {
                guard.resolved = Some(true);
                let outcome = BarrierOutcome {
                    id: id.to_string(),
                    success: true,
                    arrived: guard.arrived_sorted(),
                };
                if let Some(tx) = guard.done_tx.take() {
                    let _ = tx.send(outcome.clone());
                }
                Some(outcome)
            }
        };

        if let Some(outcome) = outcome {
            debug!(barrier_id = %id, "Barrier complete");
            self.events.emit(OrchEvent::BarrierComplete {
                id: outcome.id,
                arrived: outcome.arrived,
            });
        }
    }

    fn expire_barrier(&self, id: &str, state: &Arc<Mutex<BarrierState>>) {
        let outcome = {
            let mut guard = state.lock();
            if guard.resolved.is_some() {
                None
            } else {
                guard.resolved = Some(false);
                let outcome = BarrierOutcome {
                    id: id.to_string(),
                    success: false,
                    arrived: guard.arrived_sorted(),
                };
                if let Some(tx) = guard.done_tx.take() {
                    let _ = tx.send(outcome.clone());
                }
                Some(outcome)
            }
        };

        if let Some(outcome) = outcome {
            debug!(barrier_id = %id, arrived = outcome.arrived.len(), "Barrier timed out");
            self.events.emit(OrchEvent::BarrierTimeout {
                id: outcome.id,
                arrived: outcome.arrived,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_barrier_completes_when_all_arrive() {
        let coord = coordinator();
        let handle = coord
            .create_barrier(
                "b-1",
                ["a".to_string(), "b".to_string()],
                Duration::from_secs(5),
            )
            .unwrap();

        coord.signal_barrier("a", "b-1").unwrap();
        coord.signal_barrier("b", "b-1").unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.arrived, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_barrier_timeout_with_partial_arrival() {
        let coord = coordinator();
        let handle = coord
            .create_barrier(
                "b-1",
                ["a".to_string(), "b".to_string(), "c".to_string()],
                Duration::from_millis(50),
            )
            .unwrap();

        coord.signal_barrier("a", "b-1").unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.arrived, vec!["a".to_string()]);

        // Late signals are accepted without flipping the outcome.
        let arrived = coord.signal_barrier("b", "b-1").unwrap();
        assert_eq!(arrived.len(), 2);
    }

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let coord = coordinator();
        let _handle = coord
            .create_barrier(
                "b-1",
                ["a".to_string(), "b".to_string()],
                Duration::from_secs(5),
            )
            .unwrap();

        let first = coord.signal_barrier("a", "b-1").unwrap();
        let second = coord.signal_barrier("a", "b-1").unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_duplicate_barrier_id_rejected() {
        let coord = coordinator();
        let _h = coord
            .create_barrier("b-1", ["a".to_string()], Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            coord.create_barrier("b-1", ["a".to_string()], Duration::from_secs(5)),
            Err(MusterError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_signal_unknown_barrier() {
        let coord = coordinator();
        assert!(matches!(
            coord.signal_barrier("a", "nope"),
            Err(MusterError::NotFound(_))
        ));
    }
}
