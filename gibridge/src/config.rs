use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;

/// Session settings. Defaults match the plain `gibridge` binary.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_line_length: usize,
    /// First delay after a temporary accept error; doubles on each consecutive one.
    pub accept_backoff_initial: Duration,
    pub accept_backoff_max: Duration,
    /// If true, a read error on any peer terminates the whole session.
    /// Otherwise only that connection is closed.
    pub strict_connection_errors: bool,
    /// Log sink for every task of the session. `None` captures the caller's
    /// default dispatcher when the bridge is constructed.
    pub dispatch: Option<Dispatch>,
    /// Cancelling this token ends the session cleanly.
    pub shutdown: Option<CancellationToken>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            accept_backoff_initial: Duration::from_millis(5),
            accept_backoff_max: Duration::from_secs(1),
            strict_connection_errors: false,
            dispatch: None,
            shutdown: None,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_length(mut self, n: usize) -> Self {
        self.max_line_length = n;
        self
    }

    pub fn with_accept_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.accept_backoff_initial = initial;
        self.accept_backoff_max = max.max(initial);
        self
    }

    pub fn with_strict_connection_errors(mut self, strict: bool) -> Self {
        self.strict_connection_errors = strict;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }
}
