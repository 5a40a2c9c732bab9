//! Memory reservations for in-flight messages.
//!
//! Every message read from the input holds a reservation sized to its
//! footprint until the pipeline is done with it. When the budget is
//! exhausted, input consumption suspends, which backpressures the source.

use crate::error::{SyncError, SyncResult};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// Semaphore permits are counted in u32 chunks of this many bytes.
const BYTES_PER_PERMIT: u64 = 1024;

/// Hands out reservations against a fixed byte budget.
#[derive(Debug, Clone)]
pub struct ReservationManager {
    semaphore: Arc<Semaphore>,
    total_permits: u32,
}

impl ReservationManager {
    /// Creates a manager with the given budget.
    pub fn new(budget_bytes: u64) -> Self {
        let total_permits = Self::permits_for(budget_bytes).max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(total_permits as usize)),
            total_permits,
        }
    }

    /// Reserves room for `bytes` and wraps `value` with the reservation.
    ///
    /// Requests larger than the whole budget are clamped to the budget so a
    /// single oversized message can still pass once everything else drained.
    pub async fn reserve<T>(&self, bytes: u64, value: T) -> SyncResult<Reserved<T>> {
        let permits = Self::permits_for(bytes).min(self.total_permits);
        let permit = if permits == 0 {
            None
        } else {
            Some(
                Arc::clone(&self.semaphore)
                    .acquire_many_owned(permits)
                    .await
                    .map_err(|_| SyncError::QueueClosed("memory reservations"))?,
            )
        };
        Ok(Reserved {
            value,
            bytes,
            _permit: permit,
        })
    }

    /// Bytes currently available.
    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * BYTES_PER_PERMIT
    }

    /// Total budget in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_permits as u64 * BYTES_PER_PERMIT
    }

    fn permits_for(bytes: u64) -> u32 {
        let permits = bytes.div_ceil(BYTES_PER_PERMIT);
        u32::try_from(permits).unwrap_or(u32::MAX)
    }
}

/// A value holding part of the memory budget. The reservation is released
/// when the value is dropped.
#[derive(Debug)]
pub struct Reserved<T> {
    value: T,
    bytes: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T> Reserved<T> {
    /// Wraps a value without reserving anything.
    pub fn unreserved(value: T) -> Self {
        Self {
            value,
            bytes: 0,
            _permit: None,
        }
    }

    /// Bytes this value accounts for.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Maps the value, keeping the reservation.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reserved<U> {
        Reserved {
            value: f(self.value),
            bytes: self.bytes,
            _permit: self._permit,
        }
    }

    /// Releases the reservation and returns the value.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Separates the value from its reservation.
    pub fn split(self) -> (T, Reserved<()>) {
        let reservation = Reserved {
            value: (),
            bytes: self.bytes,
            _permit: self._permit,
        };
        (self.value, reservation)
    }

    /// Moves another reservation into this one and returns its value.
    pub fn absorb<U>(&mut self, other: Reserved<U>) -> U {
        self.bytes += other.bytes;
        if let Some(more) = other._permit {
            if let Some(permit) = self._permit.as_mut() {
                permit.merge(more);
            } else {
                self._permit = Some(more);
            }
        }
        other.value
    }
}

impl<T> Deref for Reserved<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Reserved<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reservation_released_on_drop() {
        let manager = ReservationManager::new(4 * BYTES_PER_PERMIT);
        let reserved = manager.reserve(2 * BYTES_PER_PERMIT, "payload").await.unwrap();
        assert_eq!(*reserved, "payload");
        assert_eq!(manager.available_bytes(), 2 * BYTES_PER_PERMIT);

        drop(reserved);
        assert_eq!(manager.available_bytes(), 4 * BYTES_PER_PERMIT);
    }

    #[tokio::test]
    async fn exhausted_budget_suspends() {
        let manager = ReservationManager::new(BYTES_PER_PERMIT);
        let held = manager.reserve(BYTES_PER_PERMIT, ()).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), manager.reserve(1, ())).await;
        assert!(blocked.is_err());

        drop(held);
        let granted = tokio::time::timeout(Duration::from_millis(50), manager.reserve(1, ())).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn oversized_request_is_clamped() {
        let manager = ReservationManager::new(BYTES_PER_PERMIT);
        let reserved = manager.reserve(100 * BYTES_PER_PERMIT, 7u8).await.unwrap();
        assert_eq!(reserved.bytes(), 100 * BYTES_PER_PERMIT);
        assert_eq!(manager.available_bytes(), 0);
        assert_eq!(reserved.into_inner(), 7);
        assert_eq!(manager.available_bytes(), BYTES_PER_PERMIT);
    }

    #[tokio::test]
    async fn absorbed_reservations_release_together() {
        let manager = ReservationManager::new(4 * BYTES_PER_PERMIT);
        let mut batch = Reserved::unreserved(());
        for i in 0..3u8 {
            let (value, reservation) = manager.reserve(BYTES_PER_PERMIT, i).await.unwrap().split();
            assert_eq!(value, i);
            batch.absorb(reservation);
        }
        assert_eq!(batch.bytes(), 3 * BYTES_PER_PERMIT);
        assert_eq!(manager.available_bytes(), BYTES_PER_PERMIT);

        drop(batch);
        assert_eq!(manager.available_bytes(), 4 * BYTES_PER_PERMIT);
    }

    #[tokio::test]
    async fn map_keeps_reservation() {
        let manager = ReservationManager::new(2 * BYTES_PER_PERMIT);
        let mapped = manager.reserve(BYTES_PER_PERMIT, 1u32).await.unwrap().map(|v| v + 1);
        assert_eq!(*mapped, 2);
        assert_eq!(manager.available_bytes(), BYTES_PER_PERMIT);
    }
}
