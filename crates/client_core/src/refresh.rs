use reqwest::{Request, Response};
use tokio::sync::{oneshot, Mutex};

use crate::ClientError;

/// One blocked HTTP call waiting out an in-flight credential refresh: the
/// cloned request to replay and the channel that resumes the suspended
/// caller. Consumed exactly once, by replay or by rejection.
pub struct PendingRequest {
    pub request: Request,
    pub responder: oneshot::Sender<Result<Response, ClientError>>,
}

pub enum Admission {
    /// The caller observed the coordinator idle and must drive the refresh
    /// itself, then settle the queue.
    Leader { request: Request },
    /// A refresh is already in flight; the request has been queued and the
    /// receiver resolves when the leader settles.
    Queued {
        outcome: oneshot::Receiver<Result<Response, ClientError>>,
    },
}

struct RefreshState {
    in_progress: bool,
    queue: Vec<PendingRequest>,
}

/// Deduplicates concurrent credential-refresh attempts for one client
/// instance. `Idle -> Refreshing` on the first unauthorized response;
/// later arrivals enqueue instead of starting a second refresh.
///
/// Invariant: `in_progress == false` implies the queue is empty. Both
/// `admit` and `settle` hold the lock across their read-and-mutate, so no
/// two callers can race into leadership and no settle can leave strays.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefreshState {
                in_progress: false,
                queue: Vec::new(),
            }),
        }
    }

    pub async fn admit(&self, request: Request) -> Admission {
        let mut state = self.state.lock().await;
        if state.in_progress {
            let (responder, outcome) = oneshot::channel();
            state.queue.push(PendingRequest { request, responder });
            Admission::Queued { outcome }
        } else {
            state.in_progress = true;
            Admission::Leader { request }
        }
    }

    /// Returns to `Idle` and hands the drained queue (FIFO) to the leader.
    /// The flag clears and the queue empties under the same guard, so a
    /// request replayed afterwards can never observe a stale refresh.
    pub async fn settle(&self) -> Vec<PendingRequest> {
        let mut state = self.state.lock().await;
        state.in_progress = false;
        std::mem::take(&mut state.queue)
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_refreshing(&self) -> bool {
        self.state.lock().await.in_progress
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
