//! Peer → upstream: relay each line from one connection as an `r:<id>:<line>` event.
//!
//! One task per accepted connection. Whatever ends the loop, the task removes
//! its registry entry, emits `d:<id>` and closes the socket.

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Line, LineCodec};
use crate::bridge::protocol::{ConnId, Event};
use crate::error::{BridgeError, is_end_of_stream};
use crate::registry::ConnectionRegistry;
use crate::sink::EventSink;

/// Shared by every egress task of a session.
#[derive(Clone)]
pub(crate) struct EgressContext {
    pub sink: EventSink,
    pub registry: Arc<ConnectionRegistry>,
    pub max_line_length: usize,
    pub strict: bool,
}

enum RelayError {
    /// Reading from the peer failed.
    Peer(io::Error),
    /// Writing the event upstream failed.
    Upstream(io::Error),
}

pub(crate) async fn run<R>(
    id: ConnId,
    reader: R,
    ctx: EgressContext,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let relayed = relay(&id, reader, &ctx, &cancel).await;

    // Remove first: once upstream sees `d:<id>` the id no longer resolves.
    let writer = ctx.registry.remove(&id);
    if let Err(e) = ctx.sink.send(Event::Disconnect(id.clone())).await {
        tracing::warn!(error = %e, "Failed to write disconnection");
    }
    if let Some(writer) = writer {
        // Held by ingress mid-write: the socket closes once it lets go.
        if let Ok(mut writer) = writer.try_lock()
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!(error = %e, "Failed to shut down connection");
        }
    }

    match relayed {
        Ok(()) => {
            tracing::info!("Connection closed");
            Ok(())
        }
        Err(RelayError::Upstream(e)) => Err(BridgeError::Output(e)),
        Err(RelayError::Peer(e)) if ctx.strict => Err(BridgeError::Connection { id, source: e }),
        Err(RelayError::Peer(e)) => {
            tracing::warn!(error = %e, "Failed to read from connection, closed it");
            Ok(())
        }
    }
}

async fn relay<R>(
    id: &ConnId,
    reader: R,
    ctx: &EgressContext,
    cancel: &CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LineCodec::with_max_length(ctx.max_line_length));

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = lines.next() => next,
        };

        let payload = match next {
            Some(Ok(Line::Complete(payload))) => payload,
            Some(Ok(Line::TooLong)) => {
                tracing::warn!(max_line_length = ctx.max_line_length, "Line too long, dropped");
                continue;
            }
            Some(Err(e)) if is_end_of_stream(&e) => return Ok(()),
            Some(Err(e)) => return Err(RelayError::Peer(e)),
            None => return Ok(()),
        };

        let event = Event::Receive {
            id: id.clone(),
            payload,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = ctx.sink.send(event) => sent.map_err(RelayError::Upstream)?,
        }
    }
}
