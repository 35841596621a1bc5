//! Fixed-capacity table of in-flight RPC requests, keyed by correlation id.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;
use heapless::Vec;

use super::MAX_CORRELATION_ID_LEN;
use crate::error::Error;
use crate::util::copy_bytes;

/// An owned correlation id.
pub type CorrelationId = Vec<u8, MAX_CORRELATION_ID_LEN>;

/// One in-flight request.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    pub correlation_id: CorrelationId,
    pub deadline: Instant,
    /// Distinguishes this entry from an earlier one with the same correlation id.
    sequence: u32,
    pub data: T,
}

/// Result of [`PendingRegistry::run_detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached<R> {
    /// The entry the callback saw is still pending.
    Current(R),
    /// The entry was removed or replaced while the callback ran.
    Vanished(R),
}

impl<R> Detached<R> {
    pub fn into_inner(self) -> R {
        match self {
            Detached::Current(value) | Detached::Vanished(value) => value,
        }
    }

    pub fn is_current(&self) -> bool {
        matches!(self, Detached::Current(_))
    }
}

struct Table<T, const N: usize> {
    entries: Vec<Pending<T>, N>,
    sequence: u32,
}

impl<T, const N: usize> Table<T, N> {
    fn position(&self, correlation_id: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.correlation_id.as_slice() == correlation_id)
    }
}

/// A table of at most `N` pending requests, guarded by its own mutex.
///
/// The lock is held only for the duration of each call. Callbacks passed to
/// [`sweep_expired`](Self::sweep_expired) and [`run_detached`](Self::run_detached)
/// run with the lock released, so the table may change while they run.
///
/// # Example
///
/// ```ignore
/// static PENDING: PendingRegistry<CriticalSectionRawMutex, ClientRequest, 4> =
///     PendingRegistry::new();
/// ```
pub struct PendingRegistry<M: RawMutex, T, const N: usize> {
    table: Mutex<M, RefCell<Table<T, N>>>,
}

impl<M: RawMutex, T, const N: usize> Default for PendingRegistry<M, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, T, const N: usize> PendingRegistry<M, T, N> {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(Table {
                entries: Vec::new(),
                sequence: 0,
            })),
        }
    }

    /// Adds an entry.
    ///
    /// Fails with [`Error::RegistryFull`] at capacity and with
    /// [`Error::DuplicateCorrelationId`] if the id is already pending. The table is
    /// unchanged on failure.
    pub fn add(&self, correlation_id: &[u8], deadline: Instant, data: T) -> Result<(), Error> {
        if correlation_id.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let correlation_id = copy_bytes(correlation_id)?;
        self.with_table(|table| {
            if table.entries.is_full() {
                return Err(Error::RegistryFull);
            }
            if table.position(&correlation_id).is_some() {
                return Err(Error::DuplicateCorrelationId);
            }
            table.sequence = table.sequence.wrapping_add(1);
            let entry = Pending {
                correlation_id,
                deadline,
                sequence: table.sequence,
                data,
            };
            table.entries.push(entry).map_err(|_| Error::RegistryFull)
        })
    }

    /// Removes the entry with exactly `correlation_id`.
    pub fn remove(&self, correlation_id: &[u8]) -> Result<Pending<T>, Error> {
        self.with_table(|table| {
            let index = table.position(correlation_id).ok_or(Error::NotFound)?;
            Ok(table.entries.remove(index))
        })
    }

    /// Removes the first entry `predicate` accepts.
    pub fn remove_where(
        &self,
        mut predicate: impl FnMut(&Pending<T>) -> bool,
    ) -> Option<Pending<T>> {
        self.with_table(|table| {
            let index = table.entries.iter().position(|entry| predicate(entry));
            Ok(index.map(|index| table.entries.remove(index)))
        })
        .ok()
        .flatten()
    }

    pub fn contains(&self, correlation_id: &[u8]) -> bool {
        self.with_table(|table| Ok(table.position(correlation_id).is_some()))
            .unwrap_or(false)
    }

    /// A copy of the data pending under `correlation_id`.
    pub fn get(&self, correlation_id: &[u8]) -> Option<T>
    where
        T: Clone,
    {
        self.with_table(|table| {
            Ok(table
                .position(correlation_id)
                .map(|index| table.entries[index].data.clone()))
        })
        .ok()
        .flatten()
    }

    /// Runs `f` on the data pending under `correlation_id`, under the lock.
    pub fn update<R>(
        &self,
        correlation_id: &[u8],
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Error> {
        self.with_table(|table| {
            let index = table.position(correlation_id).ok_or(Error::NotFound)?;
            Ok(f(&mut table.entries[index].data))
        })
    }

    pub fn len(&self) -> usize {
        self.with_table(|table| Ok(table.entries.len())).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// The correlation id of the expired entry with the earliest deadline.
    pub fn get_first_expired(&self, now: Instant) -> Option<CorrelationId> {
        self.with_table(|table| {
            Ok(Self::first_expired(table, now).map(|index| table.entries[index].correlation_id.clone()))
        })
        .ok()
        .flatten()
    }

    /// Removes every entry whose deadline is at or before `now`, earliest first, and
    /// passes each to `f` with the lock released. Returns the number removed.
    pub fn sweep_expired(&self, now: Instant, mut f: impl FnMut(Pending<T>)) -> usize {
        let mut removed = 0;
        while let Some(entry) = self
            .with_table(|table| {
                Ok(Self::first_expired(table, now).map(|index| table.entries.remove(index)))
            })
            .ok()
            .flatten()
        {
            removed += 1;
            f(entry);
        }
        removed
    }

    /// Runs `f` on a snapshot of the entry pending under `correlation_id` with the lock
    /// released, then checks whether that same entry is still pending.
    ///
    /// Fails with [`Error::NotFound`] if nothing is pending under the id when called.
    pub fn run_detached<R>(
        &self,
        correlation_id: &[u8],
        f: impl FnOnce(&Pending<T>) -> R,
    ) -> Result<Detached<R>, Error>
    where
        T: Clone,
    {
        let snapshot = self.with_table(|table| {
            let index = table.position(correlation_id).ok_or(Error::NotFound)?;
            Ok(table.entries[index].clone())
        })?;
        let result = f(&snapshot);
        let current = self.with_table(|table| {
            Ok(table
                .position(correlation_id)
                .is_some_and(|index| table.entries[index].sequence == snapshot.sequence))
        })?;
        if current {
            Ok(Detached::Current(result))
        } else {
            debug!("registry: entry vanished while detached");
            Ok(Detached::Vanished(result))
        }
    }

    fn first_expired(table: &Table<T, N>, now: Instant) -> Option<usize> {
        table
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(index, _)| index)
    }

    fn with_table<R>(
        &self,
        f: impl FnOnce(&mut Table<T, N>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.table.lock(|cell| {
            let mut table = cell.try_borrow_mut().map_err(|_| Error::Reentrant)?;
            f(&mut table)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    use super::*;

    type Registry<const N: usize> = PendingRegistry<CriticalSectionRawMutex, &'static str, N>;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn test_add_and_remove() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();
        assert!(registry.contains(b"a"));
        assert_eq!(registry.get(b"a"), Some("first"));
        assert_eq!(registry.len(), 1);

        let entry = registry.remove(b"a").unwrap();
        assert_eq!(entry.correlation_id.as_slice(), b"a");
        assert_eq!(entry.data, "first");
        assert_eq!(registry.remove(b"a").map(|_| ()), Err(Error::NotFound));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_to_full_table_leaves_it_unchanged() {
        let registry = Registry::<1>::new();
        registry.add(b"a", at(10), "first").unwrap();
        assert!(registry.is_full());

        assert_eq!(registry.add(b"b", at(5), "second"), Err(Error::RegistryFull));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(b"b"));
        assert_eq!(registry.get(b"a"), Some("first"));
    }

    #[test]
    fn test_add_rejects_bad_ids() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();
        assert_eq!(
            registry.add(b"a", at(10), "again"),
            Err(Error::DuplicateCorrelationId)
        );
        assert_eq!(registry.add(b"", at(10), "empty"), Err(Error::InvalidArgument));
        assert_eq!(
            registry.add(&[7; MAX_CORRELATION_ID_LEN + 1], at(10), "long"),
            Err(Error::BufferTooSmall)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_requires_exact_match() {
        let registry = Registry::<2>::new();
        registry.add(b"abc", at(10), "first").unwrap();
        assert_eq!(registry.remove(b"ab").map(|_| ()), Err(Error::NotFound));
        assert_eq!(registry.remove(b"abcd").map(|_| ()), Err(Error::NotFound));
        assert!(registry.remove(b"abc").is_ok());
    }

    #[test]
    fn test_update_and_remove_where() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();
        registry.add(b"b", at(20), "second").unwrap();

        registry.update(b"b", |data| *data = "changed").unwrap();
        assert_eq!(registry.get(b"b"), Some("changed"));
        assert_eq!(registry.update(b"c", |_| ()), Err(Error::NotFound));

        let removed = registry.remove_where(|entry| entry.data == "changed").unwrap();
        assert_eq!(removed.correlation_id.as_slice(), b"b");
        assert!(registry.remove_where(|entry| entry.data == "changed").is_none());
    }

    #[test]
    fn test_first_expired_is_earliest_deadline() {
        let registry = Registry::<3>::new();
        registry.add(b"late", at(30), "late").unwrap();
        registry.add(b"early", at(10), "early").unwrap();
        registry.add(b"mid", at(20), "mid").unwrap();

        assert_eq!(registry.get_first_expired(at(5)), None);
        assert_eq!(
            registry.get_first_expired(at(25)).as_deref(),
            Some(&b"early"[..])
        );
        assert_eq!(
            registry.get_first_expired(at(10)).as_deref(),
            Some(&b"early"[..])
        );
    }

    #[test]
    fn test_sweep_removes_expired_in_deadline_order() {
        let registry = Registry::<3>::new();
        registry.add(b"late", at(30), "late").unwrap();
        registry.add(b"early", at(10), "early").unwrap();
        registry.add(b"mid", at(20), "mid").unwrap();

        let mut swept = Vec::new();
        let count = registry.sweep_expired(at(20), |entry| {
            // The lock is released while the callback runs.
            assert!(registry.contains(b"late"));
            swept.push(entry.data);
        });

        assert_eq!(count, 2);
        assert_eq!(swept, ["early", "mid"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_run_detached_reports_current_entry() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();

        let outcome = registry.run_detached(b"a", |entry| entry.data.len()).unwrap();

        assert_eq!(outcome, Detached::Current(5));
        assert!(registry.contains(b"a"));
    }

    #[test]
    fn test_run_detached_detects_removal() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();

        let outcome = registry
            .run_detached(b"a", |_| {
                registry.remove(b"a").unwrap();
            })
            .unwrap();

        assert_eq!(outcome, Detached::Vanished(()));
    }

    #[test]
    fn test_run_detached_detects_replacement() {
        let registry = Registry::<2>::new();
        registry.add(b"a", at(10), "first").unwrap();

        let outcome = registry
            .run_detached(b"a", |_| {
                registry.remove(b"a").unwrap();
                registry.add(b"a", at(20), "second").unwrap();
            })
            .unwrap();

        assert!(!outcome.is_current());
        assert_eq!(registry.get(b"a"), Some("second"));
    }

    #[test]
    fn test_run_detached_on_missing_entry() {
        let registry = Registry::<2>::new();
        assert_eq!(
            registry.run_detached(b"a", |_| ()).map(|_| ()),
            Err(Error::NotFound)
        );
    }
}
