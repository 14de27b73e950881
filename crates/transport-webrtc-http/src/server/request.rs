use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::channel::Frame;
use crate::error::TransportError;

const BODY_QUEUE_DEPTH: usize = 16;

/// Request extension with the peer's preferred `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Streaming body of a request received over the data channel.
pub struct RequestBody {
    chunks: mpsc::Receiver<Result<Bytes, TransportError>>,
}

impl RequestBody {
    pub(crate) fn channel() -> (mpsc::Sender<Result<Bytes, TransportError>>, Self) {
        let (tx, chunks) = mpsc::channel(BODY_QUEUE_DEPTH);
        (tx, Self { chunks })
    }

    pub async fn chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.next().await
    }

    pub async fn collect(mut self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }
}

impl Stream for RequestBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

/// Forwards binary frames into the body until the terminating text frame.
/// Keeps draining after the handler drops the body.
pub(crate) async fn pump_body(
    frames: &mut mpsc::UnboundedReceiver<Frame>,
    body: mpsc::Sender<Result<Bytes, TransportError>>,
) -> Result<(), TransportError> {
    let mut body = Some(body);
    loop {
        match frames.recv().await {
            Some(Frame::Binary(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if let Some(tx) = &body {
                    if tx.send(Ok(chunk)).await.is_err() {
                        body = None;
                    }
                }
            }
            Some(Frame::Text(_)) => return Ok(()),
            None => {
                if let Some(tx) = body {
                    let _ = tx.try_send(Err(TransportError::ChannelClosed));
                }
                return Err(TransportError::ChannelClosed);
            }
        }
    }
}
