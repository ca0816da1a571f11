//! Concurrency-safe handle arena.
//!
//! # Responsibilities
//! - Issue monotonically increasing 32-bit handles
//! - Map handles to shared native objects
//! - Report live entry counts for introspection

use dashmap::DashMap;
use thiserror::Error;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque identifier issued by a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Rebuild a handle from the raw value a host carried around.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a table has issued every 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("handle space exhausted")]
pub struct HandlesExhausted;

/// Arena mapping handles to items.
///
/// The counter only moves forward and is only advanced by insertion, so a
/// handle is never handed out twice. Lookups of absent handles return `None`
/// rather than failing; callers decide whether absence is an error.
#[derive(Debug)]
pub struct HandleTable<T> {
    entries: DashMap<u32, T>,
    counter: AtomicU32,
}

impl<T: Clone> HandleTable<T> {
    /// Create an empty table. The first handle issued is 1.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            counter: AtomicU32::new(0),
        }
    }

    /// Store an item and return its handle.
    pub fn insert(&self, item: T) -> Result<Handle, HandlesExhausted> {
        let handle = self.allocate()?;
        self.entries.insert(handle.0, item);
        Ok(handle)
    }

    /// Allocate a handle, build the item from it, then store it.
    ///
    /// The builder runs without any table lock held, so it may block on the
    /// engine. If it fails the handle is burned, never stored.
    pub fn try_insert_with<E, F>(&self, build: F) -> Result<Handle, E>
    where
        E: From<HandlesExhausted>,
        F: FnOnce(Handle) -> Result<T, E>,
    {
        let handle = self.allocate()?;
        let item = build(handle)?;
        self.entries.insert(handle.0, item);
        Ok(handle)
    }

    /// Look up an item.
    pub fn get(&self, handle: Handle) -> Option<T> {
        self.entries.get(&handle.0).map(|entry| entry.value().clone())
    }

    /// Remove an item. The handle value is not recycled.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle.0).map(|(_, item)| item)
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of all live items.
    pub fn values(&self) -> Vec<T> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    fn allocate(&self) -> Result<Handle, HandlesExhausted> {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| current.checked_add(1))
            .map(|previous| Handle(previous + 1))
            .map_err(|_| HandlesExhausted)
    }

    #[cfg(test)]
    fn starting_at(counter: u32) -> Self {
        Self {
            entries: DashMap::new(),
            counter: AtomicU32::new(counter),
        }
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn handles_start_at_one_and_increase() {
        let table = HandleTable::new();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();
        assert_eq!(a.as_u32(), 1);
        assert!(b > a);
        assert_eq!(table.get(a), Some("a"));
        assert_eq!(table.get(b), Some("b"));
    }

    #[test]
    fn missing_handle_yields_none() {
        let table: HandleTable<Arc<String>> = HandleTable::new();
        assert!(table.get(Handle::from_raw(42)).is_none());
        assert!(table.remove(Handle::from_raw(42)).is_none());
    }

    #[test]
    fn removal_does_not_recycle_handles() {
        let table = HandleTable::new();
        let first = table.insert(1u8).unwrap();
        table.remove(first);
        let second = table.insert(2u8).unwrap();
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
    }

    #[test]
    fn count_reports_live_entries() {
        let table = HandleTable::new();
        let a = table.insert(1u8).unwrap();
        let _b = table.insert(2u8).unwrap();
        assert_eq!(table.count(), 2);
        table.remove(a);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn concurrent_inserts_are_unique_and_increasing() {
        let table = Arc::new(HandleTable::new());
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut issued = Vec::with_capacity(500);
                    for i in 0..500u32 {
                        issued.push(table.insert(worker * 1000 + i).unwrap());
                    }
                    issued
                })
            })
            .collect();

        let mut all = Vec::new();
        for worker in workers {
            let issued = worker.join().unwrap();
            assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
            all.extend(issued);
        }

        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8 * 500);
        assert_eq!(table.count(), 8 * 500);
    }

    #[test]
    fn exhausted_table_refuses_new_handles() {
        let table = HandleTable::starting_at(u32::MAX - 1);
        assert_eq!(table.insert(()).unwrap().as_u32(), u32::MAX);
        assert_eq!(table.insert(()), Err(HandlesExhausted));
        assert_eq!(HandlesExhausted.to_string(), "handle space exhausted");
    }

    #[test]
    fn failed_builder_burns_the_handle() {
        let table: HandleTable<u8> = HandleTable::new();
        let failed: Result<Handle, HandlesExhausted> = table.try_insert_with(|_| Err(HandlesExhausted));
        assert!(failed.is_err());
        assert_eq!(table.count(), 0);
        assert_eq!(table.insert(7).unwrap().as_u32(), 2);
    }
}
