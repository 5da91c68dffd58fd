//! Multi-version tables.
//!
//! Every key maps to a chain of versions ordered by commit sequence. A
//! reader with snapshot `s` sees, per key, the newest version committed at
//! or before `s`; a `None` value is a tombstone.

use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone)]
struct Version<V> {
    seq: u64,
    value: Option<V>,
}

/// A table holding every committed version of each row.
#[derive(Debug, Clone)]
pub(crate) struct VersionedTable<K, V> {
    rows: BTreeMap<K, Vec<Version<V>>>,
}

impl<K, V> Default for VersionedTable<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

fn visible<V>(chain: &[Version<V>], snapshot: u64) -> Option<&V> {
    chain
        .iter()
        .rev()
        .find(|v| v.seq <= snapshot)
        .and_then(|v| v.value.as_ref())
}

impl<K: Ord + Clone, V: Clone> VersionedTable<K, V> {
    /// Returns the value visible at `snapshot`.
    pub(crate) fn get(&self, key: &K, snapshot: u64) -> Option<&V> {
        self.rows.get(key).and_then(|chain| visible(chain, snapshot))
    }

    /// Returns the newest committed value regardless of snapshot.
    pub(crate) fn latest(&self, key: &K) -> Option<&V> {
        self.rows
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|v| v.value.as_ref())
    }

    /// Iterates rows visible at `snapshot` within the bounds, in key order.
    pub(crate) fn range(
        &self,
        bounds: (Bound<K>, Bound<K>),
        snapshot: u64,
    ) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.rows
            .range(bounds)
            .filter_map(move |(k, chain)| visible(chain, snapshot).map(|v| (k, v)))
    }

    /// Iterates the newest committed value of every live row.
    pub(crate) fn latest_rows(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.rows.iter().filter_map(|(k, chain)| {
            chain
                .last()
                .and_then(|v| v.value.as_ref())
                .map(|value| (k, value))
        })
    }

    /// Appends a version committed at `seq`.
    pub(crate) fn apply(&mut self, key: K, value: Option<V>, seq: u64) {
        self.rows
            .entry(key)
            .or_default()
            .push(Version { seq, value });
    }

    /// Drops versions no snapshot at or after `horizon` can observe.
    ///
    /// Returns the number of versions removed.
    pub(crate) fn prune(&mut self, bounds: (Bound<K>, Bound<K>), horizon: u64) -> usize {
        let mut removed = 0;
        let mut empty = Vec::new();
        for (key, chain) in self.rows.range_mut(bounds) {
            // Keep the newest version at or below the horizon and everything after it.
            let keep_from = chain
                .iter()
                .rposition(|v| v.seq <= horizon)
                .unwrap_or(0);
            if keep_from > 0 {
                chain.drain(..keep_from);
                removed += keep_from;
            }
            if chain.len() == 1 && chain[0].value.is_none() && chain[0].seq <= horizon {
                empty.push(key.clone());
            }
        }
        for key in empty {
            self.rows.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Prunes every key.
    pub(crate) fn prune_all(&mut self, horizon: u64) -> usize {
        self.prune((Bound::Unbounded, Bound::Unbounded), horizon)
    }

    /// Number of physical versions held, for diagnostics.
    pub(crate) fn version_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

/// Merges a committed range with a transaction's pending writes.
///
/// Pending entries shadow committed ones with the same key. Rows rejected
/// by `keep` do not count towards `limit`.
pub(crate) fn merge_range<'a, K, V>(
    committed: impl Iterator<Item = (&'a K, &'a V)>,
    pending: impl Iterator<Item = (&'a K, &'a Option<V>)>,
    limit: usize,
    mut keep: impl FnMut(&V) -> bool,
) -> Vec<V>
where
    K: Ord + 'a,
    V: Clone + 'a,
{
    enum Step {
        Committed,
        Pending,
        Both,
    }

    let mut committed = committed.peekable();
    let mut pending = pending.peekable();
    let mut out = Vec::new();
    while out.len() < limit {
        let step = match (committed.peek(), pending.peek()) {
            (None, None) => break,
            (Some(_), None) => Step::Committed,
            (None, Some(_)) => Step::Pending,
            (Some((ck, _)), Some((pk, _))) => match ck.cmp(pk) {
                std::cmp::Ordering::Less => Step::Committed,
                std::cmp::Ordering::Greater => Step::Pending,
                std::cmp::Ordering::Equal => Step::Both,
            },
        };
        let next = match step {
            Step::Committed => committed.next().map(|(_, v)| Some(v)),
            Step::Pending => pending.next().map(|(_, v)| v.as_ref()),
            Step::Both => {
                committed.next();
                pending.next().map(|(_, v)| v.as_ref())
            }
        };
        if let Some(Some(value)) = next {
            if keep(value) {
                out.push(value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> (Bound<u32>, Bound<u32>) {
        (Bound::Unbounded, Bound::Unbounded)
    }

    #[test]
    fn snapshot_reads_see_their_version() {
        let mut table = VersionedTable::default();
        table.apply(1u32, Some("a"), 1);
        table.apply(1u32, Some("b"), 3);
        table.apply(1u32, None, 5);

        assert_eq!(table.get(&1, 0), None);
        assert_eq!(table.get(&1, 2), Some(&"a"));
        assert_eq!(table.get(&1, 4), Some(&"b"));
        assert_eq!(table.get(&1, 5), None);
        assert_eq!(table.latest(&1), None);
    }

    #[test]
    fn prune_keeps_versions_visible_above_horizon() {
        let mut table = VersionedTable::default();
        table.apply(1u32, Some("a"), 1);
        table.apply(1u32, Some("b"), 3);
        table.apply(1u32, Some("c"), 6);
        table.apply(2u32, Some("x"), 1);
        table.apply(2u32, None, 2);

        let removed = table.prune(all(), 4);
        assert_eq!(removed, 3);
        assert_eq!(table.get(&1, 4), Some(&"b"));
        assert_eq!(table.get(&1, 6), Some(&"c"));
        assert_eq!(table.version_count(), 2);
    }

    #[test]
    fn merge_prefers_pending_and_respects_limit() {
        let mut table = VersionedTable::default();
        table.apply(1u32, Some(10), 1);
        table.apply(2u32, Some(20), 1);
        table.apply(4u32, Some(40), 1);

        let mut pending = BTreeMap::new();
        pending.insert(2u32, None);
        pending.insert(3u32, Some(30));
        pending.insert(4u32, Some(41));

        let merged = merge_range(table.range(all(), 1), pending.iter(), 10, |_| true);
        assert_eq!(merged, vec![10, 30, 41]);

        let limited = merge_range(table.range(all(), 1), pending.iter(), 2, |v| *v > 10);
        assert_eq!(limited, vec![30, 41]);
    }
}
