//! Accept loop: register each connection, announce it, start its egress task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::bridge::protocol::{ConnId, Event};
use crate::egress::{self, EgressContext};
use crate::error::BridgeError;
use crate::task_group::TaskGroup;

/// Exponential delay between retries of temporary accept errors.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Errors the network layer reports for a single failed accept that leave the
/// listener usable.
pub(crate) fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => is_resource_exhaustion(err),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    use nix::errno::Errno;

    err.raw_os_error().is_some_and(|code| {
        matches!(
            Errno::from_raw(code),
            Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM
        )
    })
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

pub(crate) struct Acceptor {
    pub listener: TcpListener,
    pub egress: EgressContext,
    pub group: TaskGroup,
    pub backoff: Backoff,
}

impl Acceptor {
    /// Runs until cancelled or a non-temporary accept error.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        let cancel = self.group.token().clone();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Acceptor cancelled");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.backoff.reset();
                    self.on_accept(stream, peer).await?;
                }
                Err(e) if is_temporary(&e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Temporary accept error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(BridgeError::Accept(e)),
            }
        }
    }

    async fn on_accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let (reader, writer) = stream.into_split();
        let id = self
            .egress
            .registry
            .register(&ConnId::from_peer(&peer), Arc::new(Mutex::new(writer)));
        tracing::info!(conn_id = %id, %peer, "Connection accepted");

        if let Err(e) = self.egress.sink.send(Event::Connect(id.clone())).await {
            self.egress.registry.remove(&id);
            return Err(BridgeError::Output(e));
        }

        let task = egress::run(
            id.clone(),
            reader,
            self.egress.clone(),
            self.group.token().clone(),
        );
        self.group
            .spawn(|| tracing::info_span!("connection", conn_id = %id), task);
        Ok(())
    }
}
