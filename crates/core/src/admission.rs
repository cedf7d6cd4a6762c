use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Error, Result};

/// Bounds how many chunks may be on the wire at once, independent of the worker count.
///
/// The pool starts empty; capacity is granted and revoked by the parallelism manager.
#[derive(Debug, Clone)]
pub struct AdmissionSlotPool {
    semaphore: Arc<Semaphore>,
}

/// Held for the duration of one upload attempt; dropping it returns the slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl Default for AdmissionSlotPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionSlotPool {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
        }
    }

    pub async fn acquire(&self) -> Result<AdmissionSlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown {
                message: "admission slot pool closed".to_string(),
            })?;
        Ok(AdmissionSlot { _permit: permit })
    }

    pub fn grant(&self, slots: usize) {
        if slots > 0 {
            self.semaphore.add_permits(slots);
        }
    }

    /// Takes up to `slots` idle permits out of circulation and returns how many were
    /// taken. Slots held by in-flight attempts are never touched.
    pub fn try_revoke(&self, slots: usize) -> usize {
        let mut revoked = 0;
        while revoked < slots {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    revoked += 1;
                }
                Err(_) => break,
            }
        }
        revoked
    }

    pub fn idle(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn revoke_only_takes_idle_slots() {
        let pool = AdmissionSlotPool::new();
        pool.grant(3);

        let held_a = pool.acquire().await.unwrap();
        let held_b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle(), 1);

        assert_eq!(pool.try_revoke(2), 1);
        assert_eq!(pool.idle(), 0);

        drop(held_a);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.try_revoke(1), 1);
        drop(held_b);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_grant() {
        let pool = AdmissionSlotPool::new();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.grant(1);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let pool = AdmissionSlotPool::new();
        pool.close();
        assert!(matches!(pool.acquire().await, Err(Error::Shutdown { .. })));
    }
}
