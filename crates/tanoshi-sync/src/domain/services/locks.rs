use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OwnedMutexGuard;

type Key = (i64, i32);

/// One async mutex per `(manga_id, tracker_id)` pair.
///
/// Entries nobody holds or waits for are dropped on the next acquire.
#[derive(Clone, Default)]
pub struct TrackLocks {
    locks: Arc<Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TrackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, manga_id: i64, tracker_id: i32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry((manga_id, tracker_id)).or_default().clone()
        };

        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
