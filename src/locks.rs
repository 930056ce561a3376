use dashmap::DashMap;
use std::sync::Arc;
use teloxide::types::UserId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One download at a time per user; other users proceed independently.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(user);
        lock.lock_owned().await
    }

    pub fn is_busy(&self, user: UserId) -> bool {
        let Some(lock) = self.inner.get(&user).map(|entry| entry.clone()) else {
            return false;
        };
        let busy = lock.try_lock().is_err();
        busy
    }

    fn lock_for(&self, user: UserId) -> Arc<Mutex<()>> {
        // Entries nobody holds or waits on only keep the map's own reference.
        self.inner.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.inner
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn same_user_bodies_never_overlap() {
        let locks = UserLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(UserId(7)).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_users_are_not_blocked() {
        let locks = UserLocks::new();
        let _held = locks.acquire(UserId(1)).await;
        assert!(locks.is_busy(UserId(1)));
        assert!(!locks.is_busy(UserId(2)));

        let other = tokio::time::timeout(Duration::from_millis(200), locks.acquire(UserId(2))).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire(UserId(1))).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn idle_entries_are_dropped_on_next_acquire() {
        let locks = UserLocks::new();
        drop(locks.acquire(UserId(4)).await);
        let held = locks.acquire(UserId(5)).await;
        let _other = locks.acquire(UserId(6)).await;
        assert!(!locks.inner.contains_key(&UserId(4)));
        assert!(locks.inner.contains_key(&UserId(5)));
        drop(held);
        assert!(!locks.is_busy(UserId(5)));
    }

    #[tokio::test]
    async fn released_lock_admits_next_request() {
        let locks = UserLocks::new();
        {
            let _guard = locks.acquire(UserId(3)).await;
        }
        assert!(!locks.is_busy(UserId(3)));
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire(UserId(3))).await;
        assert!(again.is_ok());
    }
}
