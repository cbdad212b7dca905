//! Merge Service
//!
//! Group-coordinated PDF merge service. Clients allocate a group id, upload
//! their PDF inputs under that id, then drop a manifest to signal the group is
//! complete. An object-created notification on the manifest drives the
//! pipeline: it lists the group's inputs in upload order, merges them into a
//! single document, and publishes the result for polling clients. Unreadable
//! inputs send the whole batch to a quarantine bucket and mark the group
//! FAILED.
//!
//! ## Architecture
//!
//! ```text
//! Client                     Valid Bucket              DynamoDB
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ POST /groups │─────────▶│ {group}/     │          │ groups       │
//! │ PUT uploads  │          │   a.pdf      │          │  PENDING     │
//! │ PUT manifest │          │   b.pdf      │          │  IN_PROGRESS │
//! └──────────────┘          │   manifest   │          │  SUCCESS     │
//!        │                  └──────────────┘          │  FAILED      │
//!        │                         │                  └──────────────┘
//!        ▼                         ▼ object-created          ▲
//! ┌──────────────┐          ┌──────────────┐                │
//! │ GET /status  │          │ Aggregator   │                │
//! │ (presigned   │          │ + Merger     │────────────────┘
//! │  download)   │          └──────────────┘
//! └──────────────┘            │          │
//!                    success  ▼          ▼  failure
//!             ┌──────────────────┐  ┌──────────────────┐
//!             │ Output Bucket    │  │ Invalid Bucket   │
//!             │ merged_output.pdf│  │ (quarantine)     │
//!             └──────────────────┘  └──────────────────┘
//! ```

pub mod aggregator;
pub mod allocator;
pub mod api;
pub mod config;
pub mod error;
pub mod group_store;
pub mod memory;
pub mod merger;
pub mod object_store;
pub mod pipeline;
pub mod quarantine;
pub mod retry;

pub use aggregator::{FileAggregator, MergeJob, ObjectCreatedEvent};
pub use allocator::GroupIdAllocator;
pub use api::{build_state, create_router, start_api_server, AppState};
pub use config::Config;
pub use error::PipelineError;
pub use group_store::{DynamoGroupStore, GroupRecord, GroupStatus, GroupStore};
pub use merger::{merge_documents, MergeError};
pub use object_store::{ObjectInfo, ObjectStore, S3ObjectStore};
pub use pipeline::{MergePipeline, PipelineOutcome};
pub use quarantine::Quarantine;
pub use retry::RetryPolicy;

use tokio::signal;
use tracing::info;

/// Wait for shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
