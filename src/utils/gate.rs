//! Serialization gate for repository-mutating operations.
//!
//! The snapshotter tolerates exactly one writer per repository, so every
//! snapshot, bulk run and retention pass must hold the gate for its full
//! duration. Waiters queue rather than fail.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Capacity-1 gate shared by all backup tasks.
#[derive(Clone)]
pub struct BackupGate {
    sem: Arc<Semaphore>,
}

/// RAII permit; the gate reopens when this is dropped.
pub struct BackupPermit {
    _permit: OwnedSemaphorePermit,
}

impl BackupGate {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the gate. Permits hand off in request order.
    pub async fn acquire(&self) -> BackupPermit {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("gate semaphore closed"));
        BackupPermit { _permit: permit }
    }

    /// Take the gate only if it is free right now.
    pub fn try_acquire(&self) -> Option<BackupPermit> {
        match self.sem.clone().try_acquire_owned() {
            Ok(permit) => Some(BackupPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => unreachable!("gate semaphore closed"),
        }
    }
}

impl Default for BackupGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_acquire_fails_while_held() {
        let gate = BackupGate::new();
        let permit = gate.acquire().await;
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_holder_under_contention() {
        let gate = BackupGate::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(gate.try_acquire().is_some());
    }
}
