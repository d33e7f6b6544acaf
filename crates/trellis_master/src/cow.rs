//! Copy-on-write metadata cells.
//!
//! Every table/tablet record lives in a [`CowCell`]. Readers take a cheap
//! shared snapshot of the committed value; a writer clones it into a dirty
//! copy, mutates the clone, and either commits (atomic swap) or drops the
//! guard to abort. Writers of the same cell serialize on an async mutex, so
//! a write guard may be held across the durable system-tablet write that
//! precedes every commit. Read guards are synchronous and must never live
//! across an await; commit blocks until concurrent readers release their
//! snapshots.

use std::sync::{RwLock, RwLockReadGuard};

#[derive(Debug)]
pub struct CowCell<T: Clone> {
    committed: RwLock<T>,
    writer: tokio::sync::Mutex<()>,
}

impl<T: Clone> CowCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            committed: RwLock::new(value),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Shared read access to the committed value.
    pub fn read(&self) -> CowReadGuard<'_, T> {
        CowReadGuard {
            guard: self.committed.read().unwrap(),
        }
    }

    /// Begin a mutation. Waits while another writer has this cell.
    pub async fn write(&self) -> CowWriteGuard<'_, T> {
        let serial = self.writer.lock().await;
        let clean = self.committed.read().unwrap().clone();
        let dirty = clean.clone();
        CowWriteGuard {
            cell: self,
            _serial: serial,
            clean,
            dirty,
        }
    }
}

pub struct CowReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

impl<T> std::ops::Deref for CowReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// An in-progress mutation of one cell.
///
/// `data()` is the committed value at acquisition time; `mutate()` is the
/// dirty copy. Dropping the guard without [`CowWriteGuard::commit`] discards
/// the dirty copy.
pub struct CowWriteGuard<'a, T: Clone> {
    cell: &'a CowCell<T>,
    _serial: tokio::sync::MutexGuard<'a, ()>,
    clean: T,
    dirty: T,
}

impl<T: Clone> CowWriteGuard<'_, T> {
    pub fn data(&self) -> &T {
        &self.clean
    }

    pub fn mutate(&mut self) -> &mut T {
        &mut self.dirty
    }

    /// The staged value as it would be committed.
    pub fn dirty(&self) -> &T {
        &self.dirty
    }

    pub fn commit(self) {
        let mut committed = self.cell.committed.write().unwrap();
        *committed = self.dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn readers_see_committed_value_until_commit() {
        let cell = CowCell::new(1u32);
        let mut guard = cell.write().await;
        *guard.mutate() = 2;
        assert_eq!(*cell.read(), 1);
        guard.commit();
        assert_eq!(*cell.read(), 2);
    }

    #[tokio::test]
    async fn dropping_guard_aborts() {
        let cell = CowCell::new("a".to_string());
        {
            let mut guard = cell.write().await;
            guard.mutate().push('b');
        }
        assert_eq!(*cell.read(), "a");
    }

    #[tokio::test]
    async fn clean_copy_is_stable_during_mutation() {
        let cell = CowCell::new(vec![1, 2]);
        let mut guard = cell.write().await;
        guard.mutate().push(3);
        assert_eq!(guard.data(), &vec![1, 2]);
        assert_eq!(guard.dirty(), &vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn writers_serialize() {
        let cell = Arc::new(CowCell::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut guard = cell.write().await;
                    *guard.mutate() += 1;
                    guard.commit();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*cell.read(), 800);
    }
}
