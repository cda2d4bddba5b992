//! Admission gate bounding in-flight remote operations.
//!
//! Shared permits bound fan-out; an exclusive permit takes every slot so it
//! only proceeds once nothing else is in flight. Slots are returned when the
//! permit is dropped, including on early `?` returns and panics.

use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct Throttle {
    slots: Arc<Semaphore>,
    max_concurrent: u32,
}

/// Held for the duration of one throttled operation.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
    exclusive: bool,
}

impl ThrottlePermit {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Throttle {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, u32::MAX as usize) as u32;
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
        }
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent as usize - self.slots.available_permits()
    }

    /// Wait for one free slot.
    pub async fn acquire_shared(&self) -> SyncResult<ThrottlePermit> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::ThrottleClosed)?;
        Ok(ThrottlePermit {
            _permit: permit,
            exclusive: false,
        })
    }

    /// Wait until nothing else holds a slot, then hold all of them.
    pub async fn acquire_exclusive(&self) -> SyncResult<ThrottlePermit> {
        let permit = self
            .slots
            .clone()
            .acquire_many_owned(self.max_concurrent)
            .await
            .map_err(|_| SyncError::ThrottleClosed)?;
        Ok(ThrottlePermit {
            _permit: permit,
            exclusive: true,
        })
    }

    /// Refuse all further acquisitions; waiters get [`SyncError::ThrottleClosed`].
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shared_acquisitions_never_exceed_cap() {
        let throttle = Throttle::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let throttle = throttle.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let _permit = throttle.acquire_shared().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared_holders() {
        let throttle = Throttle::new(4);
        let shared = throttle.acquire_shared().await.unwrap();
        assert_eq!(throttle.in_flight(), 1);

        let pending = tokio::time::timeout(Duration::from_millis(20), throttle.acquire_exclusive());
        assert!(pending.await.is_err(), "exclusive must wait while shared is held");

        drop(shared);
        let exclusive = throttle.acquire_exclusive().await.unwrap();
        assert!(exclusive.is_exclusive());
        assert_eq!(throttle.in_flight(), 4);
    }

    #[tokio::test]
    async fn test_shared_waits_for_exclusive_holder() {
        let throttle = Throttle::new(2);
        let exclusive = throttle.acquire_exclusive().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), throttle.acquire_shared());
        assert!(pending.await.is_err(), "shared must wait while exclusive is held");

        drop(exclusive);
        let _shared = throttle.acquire_shared().await.unwrap();
        assert_eq!(throttle.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_slot_released_on_error_path() {
        async fn failing(throttle: &Throttle) -> SyncResult<()> {
            let _permit = throttle.acquire_shared().await?;
            Err(SyncError::Task("boom".to_string()))
        }

        let throttle = Throttle::new(1);
        assert!(failing(&throttle).await.is_err());
        assert_eq!(throttle.in_flight(), 0);
        let _permit = throttle.acquire_shared().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_throttle_rejects_waiters() {
        let throttle = Throttle::new(1);
        throttle.close();
        assert!(matches!(
            throttle.acquire_shared().await,
            Err(SyncError::ThrottleClosed)
        ));
    }
}
