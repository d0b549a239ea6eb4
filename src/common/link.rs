//! Link - one direction pair of a forwarded connection
//!
//! A dispatched connection is represented by two Links built over two
//! pipes: the inbound link (downlink reader + uplink writer) stays with
//! the caller, the outbound link (uplink reader + downlink writer) moves
//! into the background dispatch task and is handed to the outbound
//! handler. Dropping a Link tears its pipe endpoints down.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A (reader, writer) byte-stream pair
pub struct Link {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Link {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Shut the write side down, then drop both endpoints.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
