//! Single write path onto the upstream output stream.
//!
//! Every event is encoded and flushed while holding one async mutex, so lines
//! from the acceptor and from concurrent egress tasks never interleave.

use std::io;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::EventCodec;
use crate::bridge::protocol::Event;

type Output = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub struct EventSink {
    writer: Arc<Mutex<FramedWrite<Output, EventCodec>>>,
}

impl EventSink {
    pub fn new<W>(output: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let output: Output = Box::new(output);
        Self {
            writer: Arc::new(Mutex::new(FramedWrite::new(output, EventCodec))),
        }
    }

    /// Write one event line and flush it.
    pub async fn send(&self, event: Event) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ConnId;
    use tokio::io::AsyncReadExt;
    use tokio_util::bytes::Bytes;

    #[tokio::test]
    async fn concurrent_sends_keep_lines_whole() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let sink = EventSink::new(writer);

        let mut tasks = Vec::new();
        for n in 0..16 {
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                let id = ConnId::parse(&n.to_string()).unwrap();
                for _ in 0..8 {
                    let payload = Bytes::from("x".repeat(40 + n));
                    sink.send(Event::Receive {
                        id: id.clone(),
                        payload,
                    })
                    .await
                    .unwrap();
                }
            }));
        }

        let collect = tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            out
        });

        for task in tasks {
            task.await.unwrap();
        }
        drop(sink);

        let out = String::from_utf8(collect.await.unwrap()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 16 * 8);
        for line in lines {
            let mut fields = line.splitn(3, ':');
            assert_eq!(fields.next(), Some("r"));
            let n: usize = fields.next().unwrap().parse().unwrap();
            assert_eq!(fields.next().unwrap(), "x".repeat(40 + n));
        }
    }
}
