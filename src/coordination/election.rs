use std::collections::HashMap;
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
pub struct ElectionResult {
    pub id: String,
    pub winner: Option<String>,
    /// Vote count per candidate.
    pub votes: HashMap<String, usize>,
    pub timed_out: bool,
}

pub(super) struct ElectionState {
    candidates: Vec<String>,
    /// voter id → candidate id, one vote per voter.
    votes: HashMap<String, String>,
    resolved: bool,
    done_tx: Option<oneshot::Sender<ElectionResult>>,
}

impl ElectionState {
    fn tally(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for candidate in self.votes.values() {
            *counts.entry(candidate.clone()).or_default() += 1;
        }
        counts
    }

    /// Most votes wins; ties break to the lexicographically smallest
    /// candidate id.
    fn winner(&self) -> Option<String> {
        let counts = self.tally();
        counts
            .iter()
            .max_by(|(a_id, a_count), (b_id, b_count)| {
                a_count.cmp(b_count).then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone())
    }
}

pub struct ElectionHandle {
    rx: oneshot::Receiver<ElectionResult>,
}

impl ElectionHandle {
    pub async fn wait(self) -> Result<ElectionResult> {
        self.rx
            .await
            .map_err(|_| MusterError::Internal("election state dropped".into()))
    }
}

impl Coordinator {
    /// Start an election over a candidate set. Resolves when every
    /// candidate has voted, or at the deadline with whatever votes arrived.
    pub fn conduct_election(
        self: &Arc<Self>,
        id: &str,
        candidates: Vec<String>,
        timeout: Duration,
    ) -> Result<ElectionHandle> {
        if candidates.is_empty() {
            return Err(MusterError::Validation(
                "election requires at least one candidate".into(),
            ));
        }
        if self.elections.contains_key(id) {
            return Err(MusterError::Conflict(format!(
                "election {id} already exists"
            )));
        }

        let (done_tx, rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(ElectionState {
            candidates: candidates.clone(),
            votes: HashMap::new(),
            resolved: false,
            done_tx: Some(done_tx),
        }));
        self.elections.insert(id.to_string(), Arc::clone(&state));

        self.events.emit(OrchEvent::ElectionInProgress {
            id: id.to_string(),
            candidates,
        });
        debug!(election_id = %id, "Election started");

        let coordinator = Arc::clone(self);
        let election_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.resolve_election(&election_id, &state, true);
        });

        Ok(ElectionHandle { rx })
    }

    /// Record one vote per voter; a revote is rejected.
    pub fn cast_vote(self: &Arc<Self>, id: &str, voter: &str, candidate: &str) -> Result<()> {
        let state = self
            .elections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MusterError::NotFound(format!("election {id}")))?;

        let all_voted = {
            let mut guard = state.lock();
            if guard.resolved {
                return Err(MusterError::Conflict(format!(
                    "election {id} already resolved"
                )));
            }
            if !guard.candidates.iter().any(|c| c == candidate) {
                return Err(MusterError::Validation(format!(
                    "{candidate} is not a candidate in election {id}"
                )));
            }
            if guard.votes.contains_key(voter) {
                return Err(MusterError::Conflict(format!(
                    "{voter} already voted in election {id}"
                )));
            }
            guard.votes.insert(voter.to_string(), candidate.to_string());
            guard.votes.len() >= guard.candidates.len()
        };

        debug!(election_id = %id, voter, candidate, "Vote cast");
        if all_voted {
            self.resolve_election(id, &state, false);
        }
        Ok(())
    }

    fn resolve_election(&self, id: &str, state: &Arc<Mutex<ElectionState>>, timed_out: bool) {
        let result = {
            let mut guard = state.lock();
            if guard.resolved {
                None
            } else {
                guard.resolved = true;
                let result = ElectionResult {
                    id: id.to_string(),
                    winner: guard.winner(),
                    votes: guard.tally(),
                    timed_out,
                };
                if let Some(tx) = guard.done_tx.take() {
                    let _ = tx.send(result.clone());
                }
                Some(result)
            }
        };

        if let Some(result) = result {
            debug!(election_id = %id, winner = ?result.winner, timed_out, "Election resolved");
            let event = if timed_out {
                OrchEvent::ElectionTimeout {
                    id: result.id.clone(),
                    winner: result.winner.clone(),
                    votes: result.votes.clone(),
                }
            } else {
                OrchEvent::ElectionCompleted {
                    id: result.id.clone(),
                    winner: result.winner.clone(),
                    votes: result.votes.clone(),
                }
            };
            self.events.emit(event);
        }
    }
}
