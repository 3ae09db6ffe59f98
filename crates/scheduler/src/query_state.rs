//! Query lifecycle state machine.
//!
//! Transitions: `Queued -> Running -> Finishing -> Finished`, with `Failed`
//! reachable from any non-terminal state. `Finishing` collapses into
//! `Finished` once the final result inputs have been published.

use std::sync::{Arc, Mutex};

use floq_common::{FloqError, QueryId};
use floq_exchange::SpoolingExchangeInput;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Accepted, scheduling not started.
    Queued,
    /// The scheduling loop is driving stages.
    Running,
    /// All stages finished; waiting for final results to publish.
    Finishing,
    /// Terminal success.
    Finished,
    /// Terminal failure; cause recorded.
    Failed,
}

impl QueryState {
    /// Whether the state is terminal.
    pub fn is_done(self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }
}

/// Callback fired on every query state change.
pub type QueryStateListener = Box<dyn Fn(QueryState) + Send + Sync>;

struct StateInner {
    state: QueryState,
    failure: Option<FloqError>,
    result_inputs: Option<Vec<SpoolingExchangeInput>>,
    listeners: Vec<Arc<QueryStateListener>>,
}

/// Thread-safe query state with change notification.
pub struct QueryStateMachine {
    query_id: QueryId,
    inner: Mutex<StateInner>,
    state_tx: watch::Sender<QueryState>,
}

impl QueryStateMachine {
    /// Construct in `Queued`.
    pub fn new(query_id: QueryId) -> Arc<Self> {
        let (state_tx, _) = watch::channel(QueryState::Queued);
        Arc::new(Self {
            query_id,
            inner: Mutex::new(StateInner {
                state: QueryState::Queued,
                failure: None,
                result_inputs: None,
                listeners: Vec::new(),
            }),
            state_tx,
        })
    }

    /// Query identity.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Current state.
    pub fn state(&self) -> QueryState {
        self.inner.lock().expect("query state lock").state
    }

    /// Whether the query reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether scheduling should stop driving stages.
    pub fn is_finishing_or_done(&self) -> bool {
        matches!(
            self.state(),
            QueryState::Finishing | QueryState::Finished | QueryState::Failed
        )
    }

    /// Terminal failure cause.
    pub fn failure(&self) -> Option<FloqError> {
        self.inner.lock().expect("query state lock").failure.clone()
    }

    /// Final result inputs, once published.
    pub fn query_results(&self) -> Option<Vec<SpoolingExchangeInput>> {
        self.inner
            .lock()
            .expect("query state lock")
            .result_inputs
            .clone()
    }

    /// Register a listener fired on every state change.
    pub fn add_state_change_listener(&self, listener: QueryStateListener) {
        self.inner
            .lock()
            .expect("query state lock")
            .listeners
            .push(Arc::new(listener));
    }

    /// `Queued -> Running`.
    pub fn transition_to_running(&self) -> bool {
        self.transition(|state| matches!(state, QueryState::Queued), QueryState::Running)
    }

    /// `Running -> Finishing`, collapsing to `Finished` when results are
    /// already published.
    pub fn transition_to_finishing(&self) -> bool {
        let moved = self.transition(
            |state| matches!(state, QueryState::Queued | QueryState::Running),
            QueryState::Finishing,
        );
        if moved {
            // Checked after the transition: a concurrent result publication
            // either sees Finishing and finishes, or is observed here.
            let results_ready = self
                .inner
                .lock()
                .expect("query state lock")
                .result_inputs
                .is_some();
            if results_ready {
                self.transition_to_finished();
            }
        }
        moved
    }

    /// Fail the query with a cause; first cause wins.
    pub fn transition_to_failed(&self, cause: FloqError) -> bool {
        let mut fired = Vec::new();
        let moved = {
            let mut inner = self.inner.lock().expect("query state lock");
            if inner.state.is_done() {
                false
            } else {
                inner.state = QueryState::Failed;
                inner.failure.get_or_insert(cause);
                fired = snapshot_listeners(&inner);
                true
            }
        };
        if moved {
            info!(
                query_id = %self.query_id,
                operator = "QueryStateMachine",
                "query transitioned to failed"
            );
            self.notify(QueryState::Failed, fired);
        }
        moved
    }

    /// Publish final result inputs; finishes the query if it was finishing.
    pub fn set_query_results(&self, inputs: Vec<SpoolingExchangeInput>) {
        let finishing = {
            let mut inner = self.inner.lock().expect("query state lock");
            if inner.result_inputs.is_some() {
                return;
            }
            inner.result_inputs = Some(inputs);
            inner.state == QueryState::Finishing
        };
        if finishing {
            self.transition_to_finished();
        }
    }

    /// Wait until the query reaches a terminal state.
    pub async fn wait_for_done(&self) -> QueryState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = self.state();
            if state.is_done() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    fn transition_to_finished(&self) -> bool {
        let moved = self.transition(
            |state| matches!(state, QueryState::Finishing),
            QueryState::Finished,
        );
        if moved {
            info!(
                query_id = %self.query_id,
                operator = "QueryStateMachine",
                "query transitioned to finished"
            );
        }
        moved
    }

    fn transition(&self, allowed: impl Fn(QueryState) -> bool, next: QueryState) -> bool {
        let mut fired = Vec::new();
        let moved = {
            let mut inner = self.inner.lock().expect("query state lock");
            if allowed(inner.state) {
                inner.state = next;
                fired = snapshot_listeners(&inner);
                true
            } else {
                false
            }
        };
        if moved {
            self.notify(next, fired);
        }
        moved
    }

    fn notify(&self, state: QueryState, listeners: Vec<Arc<QueryStateListener>>) {
        let _ = self.state_tx.send(state);
        for listener in listeners {
            listener(state);
        }
    }
}

fn snapshot_listeners(inner: &StateInner) -> Vec<Arc<QueryStateListener>> {
    inner.listeners.clone()
}

impl std::fmt::Debug for QueryStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStateMachine")
            .field("query_id", &self.query_id)
            .field("state", &self.state())
            .finish()
    }
}
