use crate::aggregator::{FileAggregator, MergeJob, ObjectCreatedEvent};
use crate::error::PipelineError;
use crate::group_store::{GroupStatus, GroupStore};
use crate::merger::merge_documents;
use crate::object_store::ObjectStore;
use crate::quarantine::Quarantine;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Result of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Merge completed and the output was published
    Merged {
        group_id: String,
        output_key: String,
        input_count: usize,
    },
    /// Another invocation already claimed this group (or it was never
    /// allocated); nothing was done
    ClaimLost { group_id: String },
}

/// The event-driven merge pipeline.
///
/// One invocation per object-created trigger; invocations for different
/// groups run fully in parallel with no shared in-process state. The group
/// store's conditional claim serializes concurrent triggers for one group,
/// which also makes re-runs under at-least-once delivery harmless.
pub struct MergePipeline {
    aggregator: FileAggregator,
    objects: Arc<dyn ObjectStore>,
    groups: Arc<dyn GroupStore>,
    quarantine: Quarantine,
    output_bucket: String,
    delete_inputs_after_merge: bool,
}

impl MergePipeline {
    pub fn new(
        aggregator: FileAggregator,
        objects: Arc<dyn ObjectStore>,
        groups: Arc<dyn GroupStore>,
        quarantine: Quarantine,
        output_bucket: String,
        delete_inputs_after_merge: bool,
    ) -> Self {
        Self {
            aggregator,
            objects,
            groups,
            quarantine,
            output_bucket,
            delete_inputs_after_merge,
        }
    }

    /// Process one object-created event end to end.
    ///
    /// A group is only marked FAILED once a group id has been resolved;
    /// malformed events and manifests fail the invocation alone.
    #[instrument(skip(self, event))]
    pub async fn handle_event(
        &self,
        event: &ObjectCreatedEvent,
    ) -> Result<PipelineOutcome, PipelineError> {
        let trigger = event.trigger()?;
        let group_id = self.aggregator.read_group_id(&trigger).await?;

        if !self.groups.claim(&group_id).await? {
            info!(group_id = %group_id, "Group already claimed or unknown, skipping");
            return Ok(PipelineOutcome::ClaimLost { group_id });
        }

        let started = Instant::now();

        match self.run_merge(&group_id, &trigger).await {
            Ok(outcome) => {
                self.groups
                    .set_status(&group_id, GroupStatus::Success)
                    .await?;
                metrics::counter!("merge.groups.succeeded").increment(1);
                metrics::histogram!("merge.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(e) => {
                // The terminal status write must not mask the original error
                if let Err(status_err) = self
                    .groups
                    .set_status(&group_id, GroupStatus::Failed)
                    .await
                {
                    error!(
                        group_id = %group_id,
                        error = %status_err,
                        "Failed to record FAILED status"
                    );
                }
                metrics::counter!("merge.groups.failed").increment(1);
                Err(e)
            }
        }
    }

    async fn run_merge(
        &self,
        group_id: &str,
        trigger: &crate::aggregator::TriggerRef,
    ) -> Result<PipelineOutcome, PipelineError> {
        let job = self.aggregator.aggregate(group_id, trigger).await?;

        // Download and merge as one quarantine-guarded unit: a file that
        // vanished or won't parse implicates the whole batch either way.
        let merged = match self.download_and_merge(&job).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut keys: Vec<String> = job.inputs.iter().map(|o| o.key.clone()).collect();
                keys.push(job.manifest_key.clone());

                let copied = self
                    .quarantine
                    .quarantine(&job.bucket, &job.group_id, &keys)
                    .await;

                warn!(
                    group_id = %job.group_id,
                    quarantined = copied,
                    of = keys.len(),
                    error = %e,
                    "Merge failed, inputs quarantined"
                );
                return Err(e);
            }
        };

        let output_key = format!("{}/merged_output.pdf", job.group_id);
        self.objects
            .put(&self.output_bucket, &output_key, merged, "application/pdf")
            .await?;

        info!(
            group_id = %job.group_id,
            output_key = %output_key,
            input_count = job.inputs.len(),
            "Merged output published"
        );

        if self.delete_inputs_after_merge {
            self.cleanup_inputs(&job).await;
        }

        Ok(PipelineOutcome::Merged {
            group_id: job.group_id,
            output_key,
            input_count: job.inputs.len(),
        })
    }

    async fn download_and_merge(&self, job: &MergeJob) -> Result<Vec<u8>, PipelineError> {
        let mut inputs = Vec::with_capacity(job.inputs.len());
        for obj in &job.inputs {
            inputs.push(self.objects.get(&job.bucket, &obj.key).await?);
        }

        Ok(merge_documents(&inputs)?)
    }

    /// Delete the source files of a successfully merged group.
    ///
    /// Runs strictly after the output is published and the status recorded;
    /// a partial deletion is logged, never reported as a merge failure.
    pub async fn cleanup_inputs(&self, job: &MergeJob) {
        let keys = job
            .inputs
            .iter()
            .map(|o| o.key.as_str())
            .chain(std::iter::once(job.manifest_key.as_str()));

        for key in keys {
            if let Err(e) = self.objects.delete(&job.bucket, key).await {
                warn!(key = %key, error = %e, "Failed to delete merged input");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group_store::{CreateOutcome, GroupRecord};
    use crate::memory::{MemoryGroupStore, MemoryObjectStore};
    use crate::merger::one_page_pdf;
    use chrono::{TimeZone, Utc};

    const VALID: &str = "valid-files";
    const INVALID: &str = "invalid-files";

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        groups: Arc<MemoryGroupStore>,
        pipeline: MergePipeline,
    }

    fn fixture(delete_inputs: bool) -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let groups = Arc::new(MemoryGroupStore::new());

        let pipeline = MergePipeline::new(
            FileAggregator::new(objects.clone(), ".pdf".to_string()),
            objects.clone(),
            groups.clone(),
            Quarantine::new(objects.clone(), INVALID.to_string(), 2),
            VALID.to_string(),
            delete_inputs,
        );

        Fixture {
            objects,
            groups,
            pipeline,
        }
    }

    async fn allocate(groups: &MemoryGroupStore, group_id: &str) {
        let outcome = groups
            .create(&GroupRecord {
                group_id: group_id.to_string(),
                created_at: Utc::now(),
                expires_at: Utc::now().timestamp() + 3600,
                status: GroupStatus::Pending,
            })
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
    }

    fn upload_group(objects: &MemoryObjectStore, group_id: &str, files: &[(&str, Vec<u8>)]) {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for (i, (name, data)) in files.iter().enumerate() {
            objects.put_with_timestamp(
                VALID,
                &format!("{group_id}/{name}"),
                data.clone(),
                base + chrono::Duration::seconds(i as i64),
            );
        }
        objects.put_with_timestamp(
            VALID,
            &format!("{group_id}/manifest.json"),
            format!(r#"{{"groupId": "{group_id}"}}"#).into_bytes(),
            base + chrono::Duration::seconds(100),
        );
    }

    fn manifest_event(group_id: &str) -> ObjectCreatedEvent {
        let body = serde_json::json!({
            "Records": [{
                "s3": {
                    "bucket": { "name": VALID },
                    "object": { "key": format!("{group_id}/manifest.json") }
                }
            }]
        })
        .to_string();
        ObjectCreatedEvent::parse(body.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_successful_merge_publishes_output_and_status() {
        let f = fixture(false);
        allocate(&f.groups, "g-1").await;
        upload_group(
            &f.objects,
            "g-1",
            &[("a.pdf", one_page_pdf("one")), ("b.pdf", one_page_pdf("two"))],
        );

        let outcome = f.pipeline.handle_event(&manifest_event("g-1")).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Merged {
                group_id: "g-1".to_string(),
                output_key: "g-1/merged_output.pdf".to_string(),
                input_count: 2,
            }
        );

        assert!(f.objects.contains(VALID, "g-1/merged_output.pdf"));
        let record = f.groups.get("g-1").await.unwrap().unwrap();
        assert_eq!(record.status, GroupStatus::Success);

        // Inputs survive by default
        assert!(f.objects.contains(VALID, "g-1/a.pdf"));
        assert!(f.objects.contains(VALID, "g-1/manifest.json"));
    }

    #[tokio::test]
    async fn test_corrupt_input_quarantines_whole_batch() {
        let f = fixture(false);
        allocate(&f.groups, "g-2").await;
        upload_group(
            &f.objects,
            "g-2",
            &[
                ("a.pdf", one_page_pdf("fine")),
                ("b.pdf", b"corrupt".to_vec()),
                ("c.pdf", one_page_pdf("also fine")),
            ],
        );

        let err = f
            .pipeline
            .handle_event(&manifest_event("g-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Merge(_)));

        // No output, FAILED status, all inputs plus manifest quarantined
        assert!(!f.objects.contains(VALID, "g-2/merged_output.pdf"));
        let record = f.groups.get("g-2").await.unwrap().unwrap();
        assert_eq!(record.status, GroupStatus::Failed);

        for name in ["a.pdf", "b.pdf", "c.pdf", "manifest.json"] {
            assert!(f.objects.contains(INVALID, &format!("g-2/{name}")));
            assert!(f.objects.contains(VALID, &format!("g-2/{name}")));
        }
    }

    #[tokio::test]
    async fn test_empty_group_fails_deterministically() {
        let f = fixture(false);
        allocate(&f.groups, "g-3").await;
        // Manifest only, no inputs
        f.objects.put_with_timestamp(
            VALID,
            "g-3/manifest.json",
            br#"{"groupId": "g-3"}"#.to_vec(),
            Utc::now(),
        );

        let err = f
            .pipeline
            .handle_event(&manifest_event("g-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Merge(_)));

        let record = f.groups.get("g-3").await.unwrap().unwrap();
        assert_eq!(record.status, GroupStatus::Failed);
    }

    #[tokio::test]
    async fn test_second_trigger_loses_the_claim() {
        let f = fixture(false);
        allocate(&f.groups, "g-4").await;
        upload_group(&f.objects, "g-4", &[("a.pdf", one_page_pdf("once"))]);

        let first = f.pipeline.handle_event(&manifest_event("g-4")).await.unwrap();
        assert!(matches!(first, PipelineOutcome::Merged { .. }));

        let second = f.pipeline.handle_event(&manifest_event("g-4")).await.unwrap();
        assert_eq!(
            second,
            PipelineOutcome::ClaimLost {
                group_id: "g-4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unallocated_group_is_skipped() {
        let f = fixture(false);
        upload_group(&f.objects, "g-5", &[("a.pdf", one_page_pdf("orphan"))]);

        let outcome = f.pipeline.handle_event(&manifest_event("g-5")).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::ClaimLost { .. }));
        assert!(!f.objects.contains(VALID, "g-5/merged_output.pdf"));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_inputs_when_enabled() {
        let f = fixture(true);
        allocate(&f.groups, "g-6").await;
        upload_group(
            &f.objects,
            "g-6",
            &[("a.pdf", one_page_pdf("x")), ("b.pdf", one_page_pdf("y"))],
        );

        f.pipeline.handle_event(&manifest_event("g-6")).await.unwrap();

        assert!(f.objects.contains(VALID, "g-6/merged_output.pdf"));
        assert!(!f.objects.contains(VALID, "g-6/a.pdf"));
        assert!(!f.objects.contains(VALID, "g-6/b.pdf"));
        assert!(!f.objects.contains(VALID, "g-6/manifest.json"));
    }

    #[tokio::test]
    async fn test_missing_group_id_leaves_status_untouched() {
        let f = fixture(false);
        allocate(&f.groups, "g-7").await;
        f.objects.put_with_timestamp(
            VALID,
            "g-7/manifest.json",
            br#"{"note": "no group id here"}"#.to_vec(),
            Utc::now(),
        );

        let err = f
            .pipeline
            .handle_event(&manifest_event("g-7"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingGroupId { .. }));

        let record = f.groups.get("g-7").await.unwrap().unwrap();
        assert_eq!(record.status, GroupStatus::Pending);
    }
}
