//! Protocol endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncRoute {
    /// Queue check and session start.
    CheckSyncRequest,
    /// Poll whether the session is prepared.
    SessionReady,
    /// Start the outgoing snapshot.
    InitiatePull,
    /// Poll whether the snapshot is complete.
    PullReady,
    /// Size and boundary of the snapshot.
    PullMetadata,
    /// A page of outgoing changes.
    OutgoingChanges,
    /// A batch of pushed changes.
    Push,
    /// Persist the staged push.
    CompletePush,
    /// Poll whether the push is persisted.
    PushComplete,
    /// End the session.
    EndSession,
}

impl SyncRoute {
    /// Every route.
    pub const ALL: [SyncRoute; 10] = [
        SyncRoute::CheckSyncRequest,
        SyncRoute::SessionReady,
        SyncRoute::InitiatePull,
        SyncRoute::PullReady,
        SyncRoute::PullMetadata,
        SyncRoute::OutgoingChanges,
        SyncRoute::Push,
        SyncRoute::CompletePush,
        SyncRoute::PushComplete,
        SyncRoute::EndSession,
    ];

    /// Wire name of the route.
    pub fn name(self) -> &'static str {
        match self {
            SyncRoute::CheckSyncRequest => "checkSyncRequest",
            SyncRoute::SessionReady => "sessionReady",
            SyncRoute::InitiatePull => "initiatePull",
            SyncRoute::PullReady => "pullReady",
            SyncRoute::PullMetadata => "pullMetadata",
            SyncRoute::OutgoingChanges => "outgoingChanges",
            SyncRoute::Push => "push",
            SyncRoute::CompletePush => "completePush",
            SyncRoute::PushComplete => "pushComplete",
            SyncRoute::EndSession => "endSession",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|route| route.name() == name)
    }

    /// Whether the route addresses an existing session.
    pub fn requires_session(self) -> bool {
        self != SyncRoute::CheckSyncRequest
    }

    /// Whether the route can answer with a line-delimited stream.
    pub fn can_stream(self) -> bool {
        matches!(self, SyncRoute::SessionReady | SyncRoute::OutgoingChanges)
    }
}

impl fmt::Display for SyncRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
