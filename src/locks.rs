//! Per-id serialization of lifecycle operations.
//!
//! A striped mutex table hashed by id: operations on the same pod or
//! container serialize, operations on different ids proceed in parallel
//! (modulo stripe collisions). Pods and containers use separate tables so a
//! pod operation may take a child container's lock without self-deadlock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Stripe count; a power of two comfortably above per-node pod counts.
const STRIPES: usize = 64;

pub struct KeyLocks {
    stripes: Vec<AsyncMutex<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        KeyLocks {
            stripes: (0..STRIPES).map(|_| AsyncMutex::new(())).collect(),
        }
    }

    /// Acquire the stripe owning `key`, holding it for the guard's lifetime.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        KeyLocks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyLocks::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let peak = peak.clone();
            let current = current.clone();
            tasks.push(tokio::task::spawn(async move {
                let _guard = locks.lock("same-id").await;
                let holders = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(holders, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyLocks::new();
        let _first = locks.lock("pod-a").await;

        // Find a key on a different stripe; holding the first must not block it.
        for candidate in 0..STRIPES * 4 {
            let key = format!("pod-{candidate}");
            if let Ok(_second) =
                tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock(&key)).await
            {
                return;
            }
        }
        panic!("every candidate key blocked behind an unrelated lock");
    }
}
