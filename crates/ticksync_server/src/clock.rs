//! The global tick-tock sync clock.
//!
//! Every advance moves the clock by two. The lower value (`tick`) is a
//! boundary a reader can snapshot up to; the upper value (`tock`) is the
//! value new writes are stamped with. A write stamped with `tock` is
//! therefore always strictly newer than any `tick` handed out before it.

use crate::error::SyncResult;
use ticksync_store::{Database, Transaction, CURRENT_SYNC_TICK};
use tracing::debug;

/// The pair returned by one clock advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTock {
    /// Boundary below every subsequent write.
    pub tick: i64,
    /// Value the current clock now reads.
    pub tock: i64,
}

/// Handle on the persisted sync clock.
#[derive(Clone)]
pub struct SyncClock {
    db: Database,
}

impl SyncClock {
    /// Creates a clock over `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current clock value.
    pub fn current(&self) -> SyncResult<i64> {
        Ok(self.db.counter(CURRENT_SYNC_TICK).value()?)
    }

    /// Advances the clock by two.
    pub fn tick_tock(&self) -> SyncResult<TickTock> {
        let tock = self.db.increment_fact(CURRENT_SYNC_TICK, 2)?;
        debug!(tick = tock - 1, tock, "clock advanced");
        Ok(TickTock {
            tick: tock - 1,
            tock,
        })
    }

    /// Advances the clock and registers `txn` as a writer in flight at the
    /// new value, in one step.
    ///
    /// A snapshot that ticks after this call waits for `txn` to finish
    /// before reading.
    pub fn tick_tock_holding(&self, txn: &Transaction) -> SyncResult<TickTock> {
        let mut counter = self.db.counter(CURRENT_SYNC_TICK);
        let tock = counter.increment(2)?;
        counter.hold_pending_edit(tock, txn.id());
        debug!(tick = tock - 1, tock, txn = %txn.id(), "clock advanced for writer");
        Ok(TickTock {
            tick: tock - 1,
            tock,
        })
    }

    /// Waits until every writer registered below `tick` has finished.
    pub async fn wait_for_pending_edits(&self, tick: i64) {
        self.db.wait_for_pending_edits(tick).await;
    }
}
