//! Transport layer abstraction for the sync client.

use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::future::Future;
use ticksync_protocol::{LineDecoder, StreamMessage, SyncRoute};
use tokio::sync::mpsc;

/// A sync transport carries protocol requests to the central server.
///
/// Implementations map a route, an optional session id and a JSON body to
/// whatever the wire is (HTTP, an in-process handler, a test double).
pub trait SyncTransport: Send + Sync {
    /// Sends one request and returns the success body.
    ///
    /// Error statuses come back as [`ClientError::Server`].
    fn request(
        &self,
        route: SyncRoute,
        session_id: Option<&str>,
        body: Value,
    ) -> impl Future<Output = ClientResult<Value>> + Send;

    /// Opens a line-delimited stream on a route that supports one.
    fn open_stream(
        &self,
        route: SyncRoute,
        session_id: &str,
    ) -> impl Future<Output = ClientResult<ByteStream>> + Send;
}

/// Raw body chunks of a streamed response, in arrival order.
#[derive(Debug)]
pub struct ByteStream {
    rx: mpsc::Receiver<ClientResult<Vec<u8>>>,
}

impl ByteStream {
    /// Creates a stream and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ClientResult<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }

    /// A stream over a complete body.
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        let (tx, stream) = Self::channel(1);
        // The buffer holds the single chunk, so this cannot fail.
        let _ = tx.try_send(Ok(body.into()));
        stream
    }

    /// Next chunk, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> Option<ClientResult<Vec<u8>>> {
        self.rx.recv().await
    }

    /// Decodes messages, handing each to `on_message`, until `end`.
    ///
    /// Returns the number of messages seen, heartbeats included.
    pub async fn for_each_message(
        mut self,
        mut on_message: impl FnMut(StreamMessage) -> ClientResult<()>,
    ) -> ClientResult<usize> {
        let mut decoder = LineDecoder::new();
        let mut seen = 0;
        while let Some(chunk) = self.next_chunk().await {
            for message in decoder.push(&chunk?)? {
                seen += 1;
                if message.is_end() {
                    return Ok(seen);
                }
                on_message(message)?;
            }
        }
        decoder.finish()?;
        Err(ClientError::StreamClosed)
    }
}
