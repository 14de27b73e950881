use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::channel::Frame;
use crate::error::TransportError;
use crate::flow::FlowControlledWriter;
use crate::framing::encode_response_head;

/// Frames a handler's response onto the data channel.
///
/// The head goes out on the first body write (or at the end if the handler
/// never writes). Status and headers are frozen from then on.
pub struct ResponseWriter {
    writer: FlowControlledWriter,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
    body_written: bool,
    finished: bool,
}

impl ResponseWriter {
    pub(crate) fn new(writer: FlowControlledWriter) -> Self {
        Self {
            writer,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            body_written: false,
            finished: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.head_sent {
            tracing::debug!(target = "webrtc", %status, "status ignored after head was sent");
            return;
        }
        self.status = status;
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub async fn write_head(&mut self) -> Result<(), TransportError> {
        if self.head_sent {
            return Ok(());
        }
        let head = encode_response_head(self.status, &self.headers)?;
        self.writer.write_text(&head).await?;
        self.head_sent = true;
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.write_head().await?;
        if data.is_empty() {
            return Ok(0);
        }
        let written = self.writer.write_binary(data).await?;
        self.body_written = true;
        Ok(written)
    }

    /// Ends the response: head if still pending, an empty binary frame when
    /// no body was written, then the end-of-body text frame.
    pub(crate) async fn finish(&mut self) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        self.write_head().await?;
        if !self.body_written {
            self.writer.write(Frame::Binary(Bytes::new())).await?;
        }
        self.writer.write_eof().await?;
        self.finished = true;
        Ok(())
    }
}
