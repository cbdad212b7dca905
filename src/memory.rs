//! In-memory store implementations.
//!
//! Drop-in substitutes for the S3 and DynamoDB stores, used by the test
//! suites and handy for running the pipeline without any AWS dependency.
//! Behavior mirrors the real backends where it matters: conditional inserts,
//! listing order, and the phantom-record semantics of unconditional status
//! writes.

use crate::group_store::{CreateOutcome, GroupRecord, GroupStatus, GroupStore, GroupStoreError};
use crate::object_store::{ObjectInfo, ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// In-memory object store keyed by (bucket, key)
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
    denied_put_keys: RwLock<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit last-modified timestamp
    pub fn put_with_timestamp(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        last_modified: DateTime<Utc>,
    ) {
        let mut buckets = self.buckets.write().unwrap();
        buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: "application/octet-stream".to_string(),
                last_modified,
            },
        );
    }

    /// Make subsequent puts of this key fail (quarantine failure injection)
    pub fn deny_put(&self, key: &str) {
        self.denied_put_keys.write().unwrap().insert(key.to_string());
    }

    /// Whether an object exists
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.buckets
            .read()
            .unwrap()
            .get(bucket)
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }

    /// Content type recorded for an object
    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.buckets
            .read()
            .unwrap()
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.content_type.clone())
    }

    /// All keys in a bucket, in unspecified order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .unwrap()
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let buckets = self.buckets.read().unwrap();
        buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        if self.denied_put_keys.read().unwrap().contains(key) {
            return Err(ObjectStoreError::Access(format!(
                "put denied for key {key}"
            )));
        }

        let mut buckets = self.buckets.write().unwrap();
        buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: body,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let mut buckets = self.buckets.write().unwrap();
        if let Some(b) = buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, ObjectStoreError> {
        let buckets = self.buckets.read().unwrap();
        let mut infos: Vec<ObjectInfo> = buckets
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, obj)| ObjectInfo {
                        key: key.clone(),
                        last_modified: obj.last_modified,
                    })
                    .collect()
            })
            .unwrap_or_default();

        // S3 lists lexicographically; keep the fake deterministic the same way
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError> {
        if !self.contains(bucket, key) {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(format!(
            "memory://{bucket}/{key}?expires={}",
            expires.as_secs()
        ))
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError> {
        Ok(format!(
            "memory://{bucket}/{key}?upload&expires={}",
            expires.as_secs()
        ))
    }
}

/// In-memory group status store
#[derive(Default)]
pub struct MemoryGroupStore {
    records: RwLock<HashMap<String, GroupRecord>>,
    reject_creates: AtomicU32,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` creates report a collision (allocator retry tests)
    pub fn reject_next_creates(&self, n: u32) {
        self.reject_creates.store(n, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn create(&self, record: &GroupRecord) -> Result<CreateOutcome, GroupStoreError> {
        // Forced collisions take precedence, mimicking a conditional-write
        // failure regardless of the drawn id.
        if self
            .reject_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.group_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(record.group_id.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, group_id: &str) -> Result<Option<GroupRecord>, GroupStoreError> {
        Ok(self.records.read().unwrap().get(group_id).cloned())
    }

    async fn claim(&self, group_id: &str) -> Result<bool, GroupStoreError> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(group_id) {
            Some(record) if record.status == GroupStatus::Pending => {
                record.status = GroupStatus::InProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(
        &self,
        group_id: &str,
        status: GroupStatus,
    ) -> Result<(), GroupStoreError> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(group_id) {
            Some(record) => record.status = status,
            None => {
                // DynamoDB UpdateItem creates the item when absent; the fake
                // matches so last-write-wins behaves identically.
                records.insert(
                    group_id.to_string(),
                    GroupRecord {
                        group_id: group_id.to_string(),
                        created_at: Utc::now(),
                        expires_at: 0,
                        status,
                    },
                );
            }
        }
        Ok(())
    }
}
