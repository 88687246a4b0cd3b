//! Task group with first-error propagation and sibling cancellation.
//!
//! Every task of a session is spawned here. The first task to fail records
//! its error and cancels the shared token; `wait` then drains the tracker so
//! no task outlives the session.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span};

use crate::error::BridgeError;

#[derive(Clone)]
pub(crate) struct TaskGroup {
    cancel: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<StdMutex<Option<BridgeError>>>,
    dispatch: Dispatch,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken, dispatch: Dispatch) -> Self {
        Self {
            cancel,
            tracker: TaskTracker::new(),
            first_error: Arc::new(StdMutex::new(None)),
            dispatch,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawn a task whose error ends the session. A clean return does not.
    pub fn spawn<S, F>(&self, span: S, task: F)
    where
        S: FnOnce() -> Span,
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        self.spawn_inner(span, task, false);
    }

    /// Spawn a task whose return, clean or not, ends the session.
    pub fn spawn_terminal<S, F>(&self, span: S, task: F)
    where
        S: FnOnce() -> Span,
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        self.spawn_inner(span, task, true);
    }

    fn spawn_inner<S, F>(&self, span: S, task: F, terminal: bool)
    where
        S: FnOnce() -> Span,
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let span = tracing::dispatcher::with_default(&self.dispatch, span);
        let group = self.clone();
        let task = async move {
            match task.await {
                Err(e) => group.fail(e),
                Ok(()) if terminal => group.cancel.cancel(),
                Ok(()) => {}
            }
        };
        self.tracker
            .spawn(task.instrument(span).with_subscriber(self.dispatch.clone()));
    }

    /// Record `error` if it is the first one and cancel every task.
    pub fn fail(&self, error: BridgeError) {
        let mut slot = match self.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            tracing::error!(error = %error, "Task failed, terminating session");
            *slot = Some(error);
        } else {
            tracing::debug!(error = %error, "Additional task failure after termination");
        }
        drop(slot);
        self.cancel.cancel();
    }

    /// Wait for cancellation, then for every spawned task to finish.
    pub async fn wait(&self) -> Result<(), BridgeError> {
        self.cancel.cancelled().await;
        self.tracker.close();
        self.tracker.wait().await;

        let mut slot = match self.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
