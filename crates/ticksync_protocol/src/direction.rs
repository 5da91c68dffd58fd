//! Sync direction classifications.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way records of a model are allowed to flow.
///
/// The classification is supplied by the deployment's model registry; the
/// engine only enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Never synced.
    DoNotSync,
    /// Clients push, the center never sends.
    PushToCentral,
    /// The center sends, clients never push.
    PullFromCentral,
    /// Both directions.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if clients may pull records of this direction.
    pub fn can_pull(&self) -> bool {
        matches!(
            self,
            SyncDirection::PullFromCentral | SyncDirection::Bidirectional
        )
    }

    /// Returns true if clients may push records of this direction.
    pub fn can_push(&self) -> bool {
        matches!(
            self,
            SyncDirection::PushToCentral | SyncDirection::Bidirectional
        )
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::DoNotSync => "do_not_sync",
            SyncDirection::PushToCentral => "push_to_central",
            SyncDirection::PullFromCentral => "pull_from_central",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a row within a session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDirection {
    /// Pushed by the client, waiting to be persisted.
    Incoming,
    /// Captured for the client to pull.
    Outgoing,
}

impl SessionDirection {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionDirection::Incoming => "incoming",
            SessionDirection::Outgoing => "outgoing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_and_push_permissions() {
        assert!(SyncDirection::Bidirectional.can_pull());
        assert!(SyncDirection::Bidirectional.can_push());
        assert!(SyncDirection::PullFromCentral.can_pull());
        assert!(!SyncDirection::PullFromCentral.can_push());
        assert!(SyncDirection::PushToCentral.can_push());
        assert!(!SyncDirection::PushToCentral.can_pull());
        assert!(!SyncDirection::DoNotSync.can_pull());
        assert!(!SyncDirection::DoNotSync.can_push());
    }

    #[test]
    fn serde_names_match_display() {
        for direction in [
            SyncDirection::DoNotSync,
            SyncDirection::PushToCentral,
            SyncDirection::PullFromCentral,
            SyncDirection::Bidirectional,
        ] {
            let json = serde_json::to_string(&direction).unwrap();
            assert_eq!(json, format!("\"{}\"", direction));
        }
    }
}
