//! In-process transport.
//!
//! Routes requests straight into a [`RequestHandler`], with the same JSON
//! bodies and status codes a network transport would see. Useful for tests
//! and simulations without network overhead.

use crate::error::{ClientError, ClientResult};
use crate::transport::{ByteStream, SyncTransport};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ticksync_protocol::SyncRoute;
use ticksync_server::{HandlerResponse, RequestHandler, SyncServer};

const STREAM_BUFFER: usize = 16;

/// A transport that calls a request handler directly.
#[derive(Clone)]
pub struct LoopbackTransport {
    handler: RequestHandler,
    connected: Arc<AtomicBool>,
    chunk_size: Option<usize>,
}

impl LoopbackTransport {
    /// Creates a transport over `handler`.
    pub fn new(handler: RequestHandler) -> Self {
        Self {
            handler,
            connected: Arc::new(AtomicBool::new(true)),
            chunk_size: None,
        }
    }

    /// Creates a transport over a server's handler.
    pub fn from_server(server: &SyncServer) -> Self {
        Self::new(server.handler().clone())
    }

    /// Splits streamed bodies into chunks of `size` bytes, as a network
    /// would, instead of delivering one line per chunk.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Simulates losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns true while the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::transport_retryable("not connected to server"))
        }
    }
}

impl SyncTransport for LoopbackTransport {
    async fn request(
        &self,
        route: SyncRoute,
        session_id: Option<&str>,
        body: Value,
    ) -> ClientResult<Value> {
        self.ensure_connected()?;
        let HandlerResponse { status, body } = self.handler.handle(route, session_id, body).await;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(ClientError::from_response(status, &body))
        }
    }

    async fn open_stream(&self, route: SyncRoute, session_id: &str) -> ClientResult<ByteStream> {
        self.ensure_connected()?;
        let mut stream = self.handler.open_stream(route, session_id).map_err(|e| {
            ClientError::from_response(
                e.status_code(),
                &json!({"error": {"message": e.to_string(), "retryable": e.is_retryable()}}),
            )
        })?;

        let (tx, bytes) = ByteStream::channel(STREAM_BUFFER);
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            while let Some(line) = stream.next_line().await {
                let line = match line {
                    Ok(line) => line.into_bytes(),
                    Err(e) => {
                        // A broken connection is what a network peer would see.
                        let _ = tx.send(Err(ClientError::transport_retryable(e.to_string()))).await;
                        return;
                    }
                };
                let chunks: Vec<Vec<u8>> = match chunk_size {
                    Some(size) => line.chunks(size).map(<[u8]>::to_vec).collect(),
                    None => vec![line],
                };
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticksync_protocol::{StreamMessage, SyncDirection};
    use ticksync_server::{ModelRegistry, SimpleModel, SyncConfig, SyncManager};
    use ticksync_store::Database;

    fn transport() -> LoopbackTransport {
        let models = ModelRegistry::new()
            .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral));
        let manager = SyncManager::new(
            Database::new(),
            SyncConfig::new().with_await_preparation(true),
            models,
        )
        .unwrap();
        LoopbackTransport::new(RequestHandler::new(manager))
    }

    #[tokio::test]
    async fn requests_reach_the_handler() {
        let transport = transport();
        let body = transport
            .request(SyncRoute::CheckSyncRequest, None, json!({"deviceId": "dev"}))
            .await
            .unwrap();
        assert_eq!(body["status"], "goodToGo");
    }

    #[tokio::test]
    async fn error_statuses_become_server_errors() {
        let transport = transport();
        let err = transport
            .request(SyncRoute::PullReady, Some("missing"), Value::Null)
            .await
            .unwrap_err();
        match err {
            ClientError::Server { status, message, .. } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Sync session 'missing' not found");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn disconnected_transport_fails_retryably() {
        let transport = transport();
        transport.set_connected(false);
        let err = transport
            .request(SyncRoute::CheckSyncRequest, None, json!({"deviceId": "dev"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn streams_are_chunked() {
        let transport = transport().with_chunk_size(3);
        let body = transport
            .request(SyncRoute::CheckSyncRequest, None, json!({"deviceId": "dev"}))
            .await
            .unwrap();
        let session_id = body["sessionId"].as_str().unwrap();

        let mut kinds = Vec::new();
        transport
            .open_stream(SyncRoute::SessionReady, session_id)
            .await
            .unwrap()
            .for_each_message(|m| {
                kinds.push(m);
                Ok(())
            })
            .await
            .unwrap();
        assert!(kinds.iter().all(|m| *m == StreamMessage::Waiting));

        let err = transport
            .open_stream(SyncRoute::Push, session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 400, .. }));
    }
}
