use crate::group_store::{CreateOutcome, GroupRecord, GroupStatus, GroupStore, GroupStoreError};
use crate::retry::RetryPolicy;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Errors from group id allocation
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Every attempt drew an id that already existed. With 128-bit random
    /// ids this signals an entropy or storage fault, not bad luck.
    #[error("could not allocate a unique group id after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error(transparent)]
    Store(#[from] GroupStoreError),
}

/// Allocates collision-checked group ids with a bounded retry budget.
///
/// Each attempt is a fresh random draw inserted with a conditional write;
/// the store's uniqueness check is the only collision detection.
pub struct GroupIdAllocator {
    store: Arc<dyn GroupStore>,
    retry: RetryPolicy,
    ttl: Duration,
}

impl GroupIdAllocator {
    pub fn new(store: Arc<dyn GroupStore>, retry: RetryPolicy, ttl: Duration) -> Self {
        Self { store, retry, ttl }
    }

    /// Allocate a unique group id and create its PENDING record.
    ///
    /// Exactly one record is created on success, with `expiresAt` set to
    /// now + TTL so abandoned groups are reclaimed automatically.
    #[instrument(skip(self))]
    pub async fn allocate(&self) -> Result<String, AllocatorError> {
        for _ in 0..self.retry.max_attempts() {
            let group_id = Uuid::new_v4().to_string();
            let now = Utc::now();

            let record = GroupRecord {
                group_id: group_id.clone(),
                created_at: now,
                expires_at: now.timestamp() + self.ttl.as_secs() as i64,
                status: GroupStatus::Pending,
            };

            match self.store.create(&record).await? {
                CreateOutcome::Created => return Ok(group_id),
                CreateOutcome::AlreadyExists => {
                    warn!(group_id = %group_id, "Group id collision, drawing again");
                    metrics::counter!("allocator.collisions").increment(1);
                }
            }
        }

        Err(AllocatorError::Exhausted {
            attempts: self.retry.max_attempts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGroupStore;

    fn allocator(store: Arc<MemoryGroupStore>) -> GroupIdAllocator {
        GroupIdAllocator::new(store, RetryPolicy::immediate(5), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_allocate_creates_exactly_one_record() {
        let store = Arc::new(MemoryGroupStore::new());
        let group_id = allocator(store.clone()).allocate().await.unwrap();

        assert_eq!(store.len(), 1);
        let record = store.get(&group_id).await.unwrap().unwrap();
        assert_eq!(record.status, GroupStatus::Pending);
        assert!(record.expires_at > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_allocated_ids_are_distinct() {
        let store = Arc::new(MemoryGroupStore::new());
        let alloc = allocator(store.clone());

        let a = alloc.allocate().await.unwrap();
        let b = alloc.allocate().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_retries_through_collisions() {
        let store = Arc::new(MemoryGroupStore::new());
        store.reject_next_creates(4);

        // Four collisions then success on the fifth and final attempt
        let group_id = allocator(store.clone()).allocate().await.unwrap();
        assert!(store.get(&group_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_after_five_collisions() {
        let store = Arc::new(MemoryGroupStore::new());
        store.reject_next_creates(5);

        let err = allocator(store.clone()).allocate().await.unwrap_err();
        assert!(matches!(err, AllocatorError::Exhausted { attempts: 5 }));
        assert!(store.is_empty());
    }
}
