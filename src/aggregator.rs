use crate::error::PipelineError;
use crate::object_store::{ObjectInfo, ObjectStore};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Object-created notification, in the S3 event notification shape
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectCreatedEvent {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventRecord {
    s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ObjectEntity {
    key: String,
}

/// Bucket and decoded key of the triggering object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectCreatedEvent {
    /// Parse a raw notification body
    pub fn parse(body: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(body)
            .map_err(|e| PipelineError::MalformedEvent(format!("invalid event JSON: {e}")))
    }

    /// Extract the triggering bucket and key.
    ///
    /// Event keys arrive URL-encoded with spaces as `+`.
    pub fn trigger(&self) -> Result<TriggerRef, PipelineError> {
        let record = self
            .records
            .first()
            .ok_or_else(|| PipelineError::MalformedEvent("event has no records".to_string()))?;

        if record.s3.bucket.name.is_empty() || record.s3.object.key.is_empty() {
            return Err(PipelineError::MalformedEvent(
                "event record has an empty bucket or key".to_string(),
            ));
        }

        let raw = record.s3.object.key.replace('+', " ");
        let key = percent_decode_str(&raw)
            .decode_utf8()
            .map_err(|e| PipelineError::MalformedEvent(format!("undecodable object key: {e}")))?
            .into_owned();

        Ok(TriggerRef {
            bucket: record.s3.bucket.name.clone(),
            key,
        })
    }
}

/// Manifest content: a flat JSON object naming the group
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "groupId")]
    group_id: String,
}

/// One merge unit of work, built per triggering event and discarded after
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub group_id: String,
    pub bucket: String,
    pub manifest_key: String,
    /// Input files in merge order: ascending last-modified, listing order
    /// breaking ties
    pub inputs: Vec<ObjectInfo>,
}

/// Turns an object-created event into an ordered merge job.
///
/// The triggering object is read as a manifest, its group id becomes the
/// listing prefix, and every sibling with the merge-target extension is
/// collected across listing pages.
pub struct FileAggregator {
    objects: Arc<dyn ObjectStore>,
    input_extension: String,
}

impl FileAggregator {
    pub fn new(objects: Arc<dyn ObjectStore>, input_extension: String) -> Self {
        Self {
            objects,
            input_extension,
        }
    }

    /// Resolve the group id from the triggering manifest
    pub async fn read_group_id(&self, trigger: &TriggerRef) -> Result<String, PipelineError> {
        let bytes = self.objects.get(&trigger.bucket, &trigger.key).await?;

        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::MissingGroupId {
                key: trigger.key.clone(),
                message: e.to_string(),
            })?;

        if manifest.group_id.is_empty() {
            return Err(PipelineError::MissingGroupId {
                key: trigger.key.clone(),
                message: "groupId is empty".to_string(),
            });
        }

        Ok(manifest.group_id)
    }

    /// List and order the sibling inputs for a group.
    ///
    /// Excludes the trigger key itself and anything without the merge-target
    /// extension. The sort is stable, so equal timestamps keep the backend's
    /// listing order and the result is reproducible for a fixed input set.
    #[instrument(skip(self, trigger))]
    pub async fn aggregate(
        &self,
        group_id: &str,
        trigger: &TriggerRef,
    ) -> Result<MergeJob, PipelineError> {
        let listed = self
            .objects
            .list_prefix(&trigger.bucket, group_id)
            .await?;

        let mut inputs: Vec<ObjectInfo> = listed
            .into_iter()
            .filter(|obj| obj.key != trigger.key && obj.key.ends_with(&self.input_extension))
            .collect();

        inputs.sort_by_key(|obj| obj.last_modified);

        debug!(
            group_id = %group_id,
            input_count = inputs.len(),
            "Aggregated merge inputs"
        );

        Ok(MergeJob {
            group_id: group_id.to_string(),
            bucket: trigger.bucket.clone(),
            manifest_key: trigger.key.clone(),
            inputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use chrono::{TimeZone, Utc};

    fn event_json(bucket: &str, key: &str) -> Vec<u8> {
        serde_json::json!({
            "Records": [{
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": key }
                }
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_trigger_extraction() {
        let event = ObjectCreatedEvent::parse(&event_json("uploads", "g-1/manifest.json")).unwrap();
        let trigger = event.trigger().unwrap();
        assert_eq!(trigger.bucket, "uploads");
        assert_eq!(trigger.key, "g-1/manifest.json");
    }

    #[test]
    fn test_trigger_key_is_url_decoded() {
        let event =
            ObjectCreatedEvent::parse(&event_json("uploads", "g-1/my+report%282%29.pdf")).unwrap();
        let trigger = event.trigger().unwrap();
        assert_eq!(trigger.key, "g-1/my report(2).pdf");
    }

    #[test]
    fn test_event_without_records_is_malformed() {
        let event = ObjectCreatedEvent::parse(b"{\"Records\": []}").unwrap();
        assert!(matches!(
            event.trigger(),
            Err(PipelineError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            ObjectCreatedEvent::parse(b"not json"),
            Err(PipelineError::MalformedEvent(_))
        ));
    }

    fn aggregator(store: Arc<MemoryObjectStore>) -> FileAggregator {
        FileAggregator::new(store, ".pdf".to_string())
    }

    fn trigger() -> TriggerRef {
        TriggerRef {
            bucket: "uploads".to_string(),
            key: "g-1/manifest.json".to_string(),
        }
    }

    #[tokio::test]
    async fn test_read_group_id() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put(
                "uploads",
                "g-1/manifest.json",
                br#"{"groupId": "g-1"}"#.to_vec(),
                "application/json",
            )
            .await
            .unwrap();

        let group_id = aggregator(store).read_group_id(&trigger()).await.unwrap();
        assert_eq!(group_id, "g-1");
    }

    #[tokio::test]
    async fn test_manifest_without_group_id_fails() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put(
                "uploads",
                "g-1/manifest.json",
                br#"{"other": "field"}"#.to_vec(),
                "application/json",
            )
            .await
            .unwrap();

        let err = aggregator(store)
            .read_group_id(&trigger())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingGroupId { .. }));
    }

    #[tokio::test]
    async fn test_aggregate_orders_by_last_modified() {
        let store = Arc::new(MemoryObjectStore::new());
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 9).unwrap();

        // Keys deliberately out of lexicographic order w.r.t. timestamps
        store.put_with_timestamp("uploads", "g-1/z-first.pdf", vec![1], t1);
        store.put_with_timestamp("uploads", "g-1/a-last.pdf", vec![3], t3);
        store.put_with_timestamp("uploads", "g-1/m-second.pdf", vec![2], t2);
        store.put_with_timestamp("uploads", "g-1/manifest.json", vec![0], t3);

        let job = aggregator(store).aggregate("g-1", &trigger()).await.unwrap();
        let keys: Vec<_> = job.inputs.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["g-1/z-first.pdf", "g-1/m-second.pdf", "g-1/a-last.pdf"]
        );
    }

    #[tokio::test]
    async fn test_aggregate_excludes_manifest_and_foreign_extensions() {
        let store = Arc::new(MemoryObjectStore::new());
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        store.put_with_timestamp("uploads", "g-1/doc.pdf", vec![1], t);
        store.put_with_timestamp("uploads", "g-1/manifest.json", vec![0], t);
        store.put_with_timestamp("uploads", "g-1/notes.txt", vec![2], t);
        store.put_with_timestamp("uploads", "g-2/other.pdf", vec![3], t);

        let job = aggregator(store).aggregate("g-1", &trigger()).await.unwrap();
        let keys: Vec<_> = job.inputs.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["g-1/doc.pdf"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_listing_order() {
        let store = Arc::new(MemoryObjectStore::new());
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        store.put_with_timestamp("uploads", "g-1/b.pdf", vec![1], t);
        store.put_with_timestamp("uploads", "g-1/a.pdf", vec![2], t);
        store.put_with_timestamp("uploads", "g-1/c.pdf", vec![3], t);

        // The memory fake lists lexicographically; a stable sort must not
        // disturb that order for equal timestamps.
        let job = aggregator(store).aggregate("g-1", &trigger()).await.unwrap();
        let keys: Vec<_> = job.inputs.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["g-1/a.pdf", "g-1/b.pdf", "g-1/c.pdf"]);
    }
}
