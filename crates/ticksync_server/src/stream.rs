//! Line-delimited streaming of readiness and outgoing changes.
//!
//! A stream is fed by a background task over a bounded channel. While the
//! server is still working the task emits `waiting` heartbeats; it then
//! emits the payload and a final `end`. Dropping the stream stops the task
//! at its next send.

use crate::error::{SyncError, SyncResult};
use crate::manager::SyncManager;
use std::time::Duration;
use ticksync_protocol::{PageRequest, StreamMessage, SyncRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 64;

/// Receiving end of a server stream.
#[derive(Debug)]
pub struct SyncStream {
    rx: mpsc::Receiver<SyncResult<StreamMessage>>,
}

impl SyncStream {
    fn channel() -> (StreamSender, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (StreamSender { tx }, Self { rx })
    }

    /// Next message, or `None` once the stream is exhausted.
    pub async fn next_message(&mut self) -> Option<SyncResult<StreamMessage>> {
        self.rx.recv().await
    }

    /// Next message encoded as a newline-terminated JSON line.
    pub async fn next_line(&mut self) -> Option<SyncResult<String>> {
        let message = self.next_message().await?;
        Some(message.and_then(|m| m.to_line().map_err(SyncError::from)))
    }

    /// Drains the stream and returns every change it carried.
    pub async fn into_records(mut self) -> SyncResult<Vec<SyncRecord>> {
        let mut records = Vec::new();
        while let Some(message) = self.next_message().await {
            match message? {
                StreamMessage::Waiting => {}
                StreamMessage::Change(record) => records.push(*record),
                StreamMessage::End => return Ok(records),
            }
        }
        Err(SyncError::Internal("stream closed before its end message".into()))
    }

    /// Drains the stream into a single NDJSON body.
    pub async fn into_ndjson(mut self) -> SyncResult<String> {
        let mut body = String::new();
        while let Some(line) = self.next_line().await {
            body.push_str(&line?);
        }
        Ok(body)
    }
}

struct StreamSender {
    tx: mpsc::Sender<SyncResult<StreamMessage>>,
}

impl StreamSender {
    /// Returns false once the receiver is gone.
    async fn send(&self, message: StreamMessage) -> bool {
        self.tx.send(Ok(message)).await.is_ok()
    }

    async fn fail(&self, error: SyncError) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// Sends heartbeats until `ready` returns true. Returns false if the
    /// receiver went away first.
    async fn wait_until(
        &self,
        heartbeat: Duration,
        mut ready: impl FnMut() -> SyncResult<bool>,
    ) -> SyncResult<bool> {
        loop {
            if ready()? {
                return Ok(true);
            }
            if !self.send(StreamMessage::Waiting).await {
                return Ok(false);
            }
            tokio::time::sleep(heartbeat).await;
        }
    }
}

/// Streams heartbeats until the session is prepared.
pub(crate) fn session_ready(manager: SyncManager, session_id: String) -> SyncStream {
    let (tx, stream) = SyncStream::channel();
    tokio::spawn(async move {
        let heartbeat = manager.config().stream_heartbeat;
        match tx
            .wait_until(heartbeat, || manager.check_session_ready(&session_id))
            .await
        {
            Ok(true) => {
                tx.send(StreamMessage::End).await;
            }
            Ok(false) => debug!(session_id, "readiness stream dropped"),
            Err(e) => tx.fail(e).await,
        }
    });
    stream
}

/// Streams heartbeats until the snapshot is ready, then every outgoing change.
pub(crate) fn outgoing_changes(manager: SyncManager, session_id: String) -> SyncStream {
    let (tx, stream) = SyncStream::channel();
    tokio::spawn(async move {
        if let Err(e) = produce_outgoing(&manager, &session_id, &tx).await {
            warn!(session_id, error = %e, "outgoing stream failed");
            tx.fail(e).await;
        }
    });
    stream
}

async fn produce_outgoing(
    manager: &SyncManager,
    session_id: &str,
    tx: &StreamSender,
) -> SyncResult<()> {
    let heartbeat = manager.config().stream_heartbeat;
    if !tx
        .wait_until(heartbeat, || manager.check_pull_ready(session_id))
        .await?
    {
        return Ok(());
    }

    let page_size = manager.config().max_records_per_page;
    let mut from_id = None;
    let mut sent = 0usize;
    loop {
        let page = manager.get_outgoing_changes(session_id, PageRequest::new(from_id, page_size))?;
        let Some(next) = page.next_from_id() else {
            break;
        };
        from_id = Some(next);
        for record in page.records {
            if !tx.send(StreamMessage::Change(Box::new(record))).await {
                debug!(session_id, sent, "outgoing stream dropped");
                return Ok(());
            }
            sent += 1;
        }
    }
    tx.send(StreamMessage::End).await;
    debug!(session_id, sent, "outgoing stream finished");
    Ok(())
}
