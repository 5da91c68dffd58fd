//! Line-delimited JSON stream framing.
//!
//! A streamed response is a sequence of JSON objects, one per line, each
//! tagged with a `kind`. A client can decode it incrementally as bytes
//! arrive without buffering the whole body.

use crate::change::SyncRecord;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// A single framed stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum StreamMessage {
    /// The server is still working; keep the connection open.
    Waiting,
    /// One outgoing change.
    Change(Box<SyncRecord>),
    /// No more messages follow.
    End,
}

impl StreamMessage {
    /// Encodes the message as a single newline-terminated line.
    pub fn to_line(&self) -> ProtocolResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes one line (with or without its trailing newline).
    pub fn from_line(line: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
    }

    /// Returns true for the terminating message.
    pub fn is_end(&self) -> bool {
        matches!(self, StreamMessage::End)
    }
}

/// Incremental decoder for a line-delimited stream.
///
/// Bytes may arrive split at arbitrary points; complete lines are decoded
/// as soon as their newline is seen.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    lines_seen: usize,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every message completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> ProtocolResult<Vec<StreamMessage>> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.lines_seen += 1;
            let text = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidUtf8 {
                line: self.lines_seen,
            })?;
            if text.trim().is_empty() {
                continue;
            }
            messages.push(StreamMessage::from_line(text)?);
        }
        Ok(messages)
    }

    /// Checks that no partial line is left over.
    pub fn finish(self) -> ProtocolResult<()> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(ProtocolError::Truncated(self.buffer.len()))
        }
    }
}
