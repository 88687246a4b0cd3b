//! Upstream → peers: read `id:expr` commands and write `expr` to connection `id`.
//!
//! Only a read failure on the upstream stream is fatal. Malformed commands,
//! unknown identifiers, and failed peer writes are logged and skipped; the
//! egress task of a broken connection cleans it up on its own.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Line, LineCodec};
use crate::bridge::protocol::Command;
use crate::error::{BridgeError, is_end_of_stream};
use crate::registry::ConnectionRegistry;

/// Returns `Ok(())` on end-of-stream, closed pipe, or cancellation.
pub(crate) async fn run<R>(
    input: R,
    registry: Arc<ConnectionRegistry>,
    max_line_length: usize,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(input, LineCodec::with_max_length(max_line_length));

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Ingress cancelled");
                return Ok(());
            }
            next = reader.next() => next,
        };

        let line = match next {
            Some(Ok(Line::Complete(line))) => line,
            Some(Ok(Line::TooLong)) => {
                tracing::warn!(max_line_length, "Incoming line too long, dropped");
                continue;
            }
            Some(Err(e)) if is_end_of_stream(&e) => {
                tracing::info!(error = %e, "Upstream pipe closed");
                return Ok(());
            }
            Some(Err(e)) => return Err(BridgeError::Input(e)),
            None => {
                tracing::info!("Upstream input closed");
                return Ok(());
            }
        };

        if line.is_empty() {
            tracing::debug!("Ignoring empty line");
            continue;
        }

        let Command { id, expr } = match Command::parse(line.clone()) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(&line),
                    "Incoming data does not follow the syntax (id:expr)"
                );
                continue;
            }
        };

        let Some(conn) = registry.get(&id) else {
            tracing::warn!(conn_id = %id, "No connection exists");
            continue;
        };

        let write = async {
            let mut writer = conn.lock().await;
            writer.write_all(&expr).await
        };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            written = write => written,
        };

        match written {
            Ok(()) => tracing::trace!(conn_id = %id, bytes = expr.len(), "Forwarded"),
            Err(e) => tracing::warn!(
                conn_id = %id,
                bytes = expr.len(),
                error = %e,
                "Failed to write to connection"
            ),
        }
    }
}
