use crate::object_store::ObjectStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Preserves the inputs of a failed merge for diagnosis.
///
/// Copies each implicated file into the invalid bucket under
/// `{group_id}/{filename}`. Copies are independent and best-effort: a failed
/// copy is logged and the rest proceed. Originals are never deleted here.
pub struct Quarantine {
    objects: Arc<dyn ObjectStore>,
    invalid_bucket: String,
    concurrency: usize,
}

impl Quarantine {
    pub fn new(objects: Arc<dyn ObjectStore>, invalid_bucket: String, concurrency: usize) -> Self {
        Self {
            objects,
            invalid_bucket,
            concurrency: concurrency.max(1),
        }
    }

    /// Copy every listed key from the source bucket into the quarantine
    /// namespace. Returns the number of copies that succeeded.
    #[instrument(skip(self, keys), fields(file_count = keys.len()))]
    pub async fn quarantine(
        &self,
        source_bucket: &str,
        group_id: &str,
        keys: &[String],
    ) -> usize {
        let copied: Vec<bool> = stream::iter(keys.iter().cloned())
            .map(|key| {
                let objects = self.objects.clone();
                let source_bucket = source_bucket.to_string();
                let dest_bucket = self.invalid_bucket.clone();
                let group_id = group_id.to_string();

                async move {
                    let filename = key.rsplit('/').next().unwrap_or(&key);
                    let dest_key = format!("{group_id}/{filename}");

                    let result = async {
                        let bytes = objects.get(&source_bucket, &key).await?;
                        objects
                            .put(&dest_bucket, &dest_key, bytes, "application/octet-stream")
                            .await
                    }
                    .await;

                    match result {
                        Ok(()) => {
                            metrics::counter!("merge.files.quarantined").increment(1);
                            true
                        }
                        Err(e) => {
                            // Already in failure mode; skip this file and keep
                            // quarantining the rest
                            warn!(
                                key = %key,
                                dest_key = %dest_key,
                                error = %e,
                                "Failed to quarantine file"
                            );
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        copied.iter().filter(|ok| **ok).count()
    }
}
