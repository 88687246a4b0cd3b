//! Bridge orchestrator - owns one session from bind to termination.
//!
//! Flow:
//! 1. Bind the listener, write `a:<addr>` upstream (Starting)
//! 2. Spawn ingress and acceptor into one task group (Running)
//! 3. Acceptor spawns an egress task per connection into the same group
//! 4. First fatal error, upstream end-of-stream, or external shutdown
//!    cancels the group; wait for every task, return (Terminated)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};
use uuid::Uuid;

use crate::acceptor::{Acceptor, Backoff};
use crate::bridge::protocol::Event;
use crate::config::BridgeConfig;
use crate::egress::EgressContext;
use crate::error::BridgeError;
use crate::ingress;
use crate::registry::ConnectionRegistry;
use crate::sink::EventSink;
use crate::task_group::TaskGroup;

type Input = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Binding the listener and announcing its address.
    Starting,
    /// Listening on `addr`; ingress, acceptor and egress tasks are live.
    Running { addr: SocketAddr },
    /// Session ended; it cannot be restarted.
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// One bridge session over an exclusively owned input and output stream.
pub struct Bridge {
    input: Input,
    sink: EventSink,
    registry: Arc<ConnectionRegistry>,
    config: BridgeConfig,
    dispatch: Dispatch,
    session_id: Uuid,
    state_tx: watch::Sender<SessionState>,
}

impl Bridge {
    pub fn new<R, W>(input: R, output: W, config: BridgeConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let dispatch = config
            .dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        let (state_tx, _) = watch::channel(SessionState::Starting);

        Self {
            input: Box::new(input),
            sink: EventSink::new(output),
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            dispatch,
            session_id: Uuid::new_v4(),
            state_tx,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Live connections of this session.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Listen on `addr` (`host:port`, port 0 for ephemeral) and run until the
    /// upstream input closes (`Ok`) or a fatal error occurs (`Err`).
    pub async fn run(self, addr: &str) -> Result<(), BridgeError> {
        let dispatch = self.dispatch.clone();
        let span = tracing::dispatcher::with_default(&dispatch, || {
            tracing::info_span!("bridge", session_id = %self.session_id)
        });
        let state_tx = self.state_tx.clone();

        let result = self.run_session(addr).instrument(span).with_subscriber(dispatch).await;

        state_tx.send_replace(SessionState::Terminated);
        result
    }

    async fn run_session(self, addr: &str) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(BridgeError::LocalAddr)?;

        self.sink
            .send(Event::address(local_addr))
            .await
            .map_err(BridgeError::Output)?;
        tracing::info!(addr = %local_addr, "Listening");

        let cancel = match self.config.shutdown {
            Some(ref token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let group = TaskGroup::new(cancel, self.dispatch.clone());

        let egress = EgressContext {
            sink: self.sink.clone(),
            registry: Arc::clone(&self.registry),
            max_line_length: self.config.max_line_length,
            strict: self.config.strict_connection_errors,
        };

        group.spawn_terminal(
            || tracing::info_span!("ingress"),
            ingress::run(
                self.input,
                Arc::clone(&self.registry),
                self.config.max_line_length,
                group.token().clone(),
            ),
        );

        let acceptor = Acceptor {
            listener,
            egress,
            group: group.clone(),
            backoff: Backoff::new(
                self.config.accept_backoff_initial,
                self.config.accept_backoff_max,
            ),
        };
        group.spawn(|| tracing::info_span!("acceptor"), acceptor.run());

        self.state_tx
            .send_replace(SessionState::Running { addr: local_addr });

        let result = group.wait().await;
        match &result {
            Ok(()) => tracing::info!("Session finished"),
            Err(e) => tracing::error!(error = %e, "Session failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::FramedRead;

    use crate::bridge::codec::{Line, LineCodec};
    use crate::bridge::protocol::ConnId;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        upstream_in: DuplexStream,
        upstream_out: FramedRead<DuplexStream, LineCodec>,
        registry: Arc<ConnectionRegistry>,
        state: watch::Receiver<SessionState>,
        session: JoinHandle<Result<(), BridgeError>>,
        addr: SocketAddr,
    }

    impl Harness {
        async fn start(config: BridgeConfig) -> Self {
            let (upstream_in, input) = tokio::io::duplex(64 * 1024);
            let (output, upstream_out) = tokio::io::duplex(64 * 1024);
            let bridge = Bridge::new(input, output, config);
            let registry = bridge.registry();
            let state = bridge.state();
            let session = tokio::spawn(bridge.run("127.0.0.1:0"));

            let mut harness = Self {
                upstream_in,
                upstream_out: FramedRead::new(upstream_out, LineCodec::new()),
                registry,
                state,
                session,
                addr: "0.0.0.0:0".parse().unwrap(),
            };
            harness.addr = match harness.next_event().await {
                Event::Address(addr) => addr.parse().unwrap(),
                other => panic!("expected address event, got {other:?}"),
            };
            harness
        }

        async fn next_event(&mut self) -> Event {
            let line = tokio::time::timeout(WAIT, self.upstream_out.next())
                .await
                .expect("timed out waiting for an event")
                .expect("output closed")
                .unwrap();
            match line {
                Line::Complete(line) => Event::parse(&line).unwrap(),
                Line::TooLong => panic!("event line too long"),
            }
        }

        async fn command(&mut self, line: &str) {
            self.upstream_in.write_all(line.as_bytes()).await.unwrap();
        }

        /// Connect a peer and consume its `c:<id>` event.
        async fn connect(&mut self) -> (TcpStream, ConnId) {
            let peer = TcpStream::connect(self.addr).await.unwrap();
            let expected = ConnId::from_peer(&peer.local_addr().unwrap());
            assert_eq!(self.next_event().await, Event::Connect(expected.clone()));
            (peer, expected)
        }

        async fn finish(self) -> Result<(), BridgeError> {
            drop(self.upstream_in);
            tokio::time::timeout(WAIT, self.session)
                .await
                .expect("session did not terminate")
                .unwrap()
        }
    }

    fn receive(id: &ConnId, payload: &'static [u8]) -> Event {
        Event::Receive {
            id: id.clone(),
            payload: tokio_util::bytes::Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn announces_bound_address_first() {
        let harness = Harness::start(BridgeConfig::new()).await;
        assert_eq!(harness.addr.ip().to_string(), "127.0.0.1");
        assert!(harness.addr.port() > 0);

        let mut state = harness.state.clone();
        let running = *state
            .wait_for(|s| *s != SessionState::Starting)
            .await
            .unwrap();
        assert_eq!(
            running,
            SessionState::Running {
                addr: harness.addr
            }
        );
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn relays_in_both_directions() {
        let mut harness = Harness::start(BridgeConfig::new()).await;
        let (mut peer, id) = harness.connect().await;

        peer.write_all(b"hello\n").await.unwrap();
        assert_eq!(harness.next_event().await, receive(&id, b"hello"));

        harness.command(&format!("{id}:world\n")).await;
        harness.command(&format!("{id}:!\n")).await;

        // No newline is appended: the second payload follows the first directly.
        let mut buf = [0u8; 6];
        tokio::time::timeout(WAIT, peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"world!");

        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_identifier_and_garbage_produce_no_output() {
        let mut harness = Harness::start(BridgeConfig::new()).await;

        harness.command("1:nobody home\n").await;
        harness.command("no delimiter here\n").await;

        // The next line upstream sees is the connect of a fresh peer.
        let (_peer, _id) = harness.connect().await;
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_emits_single_disconnect() {
        let mut harness = Harness::start(BridgeConfig::new()).await;
        let (mut peer, id) = harness.connect().await;

        peer.write_all(b"bye\n").await.unwrap();
        peer.shutdown().await.unwrap();
        drop(peer);

        assert_eq!(harness.next_event().await, receive(&id, b"bye"));
        assert_eq!(harness.next_event().await, Event::Disconnect(id.clone()));
        assert!(!harness.registry.contains(&id));

        // A late command for the closed connection is dropped silently.
        harness.command(&format!("{id}:too late\n")).await;
        let (_peer, next) = harness.connect().await;
        assert_ne!(next, id);

        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn connections_are_independent() {
        let mut harness = Harness::start(BridgeConfig::new()).await;
        let (mut first, first_id) = harness.connect().await;
        let (mut second, second_id) = harness.connect().await;
        assert_ne!(first_id, second_id);

        second.write_all(b"from second\n").await.unwrap();
        assert_eq!(harness.next_event().await, receive(&second_id, b"from second"));
        first.write_all(b"from first\n").await.unwrap();
        assert_eq!(harness.next_event().await, receive(&first_id, b"from first"));

        harness.command(&format!("{second_id}:to second\n")).await;
        let mut buf = [0u8; 9];
        tokio::time::timeout(WAIT, second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"to second");

        drop(first);
        assert_eq!(harness.next_event().await, Event::Disconnect(first_id));
        assert!(harness.registry.contains(&second_id));

        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn input_end_closes_every_connection() {
        let mut harness = Harness::start(BridgeConfig::new()).await;
        let (mut peer, id) = harness.connect().await;
        let registry = Arc::clone(&harness.registry);
        let mut state = harness.state.clone();

        drop(harness.upstream_in);
        let mut disconnected = false;
        while let Some(Ok(Line::Complete(line))) =
            tokio::time::timeout(WAIT, harness.upstream_out.next())
                .await
                .unwrap()
        {
            assert_eq!(Event::parse(&line).unwrap(), Event::Disconnect(id.clone()));
            disconnected = true;
        }
        assert!(disconnected);

        tokio::time::timeout(WAIT, harness.session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
        state.wait_for(SessionState::is_terminal).await.unwrap();

        // The peer sees its socket closed.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn external_shutdown_ends_session_cleanly() {
        let shutdown = CancellationToken::new();
        let harness = Harness::start(BridgeConfig::new().with_shutdown(shutdown.clone())).await;

        shutdown.cancel();
        let result = tokio::time::timeout(WAIT, harness.session)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let (_upstream_in, input) = tokio::io::duplex(64);
        let (output, _upstream_out) = tokio::io::duplex(64);
        let bridge = Bridge::new(input, output, BridgeConfig::new());
        let mut state = bridge.state();

        let err = bridge.run("not-an-address").await.unwrap_err();
        assert!(matches!(err, BridgeError::Bind { .. }));
        assert!(state.wait_for(SessionState::is_terminal).await.is_ok());
    }
}
