use crate::config::DynamoDbConfig;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// Attribute names in the group status table
const ATTR_GROUP_ID: &str = "groupId";
const ATTR_CREATED_AT: &str = "createdAt";
const ATTR_EXPIRES_AT: &str = "expiresAt";
const ATTR_STATUS: &str = "status";

/// Errors from the group status store
#[derive(Debug, Error)]
pub enum GroupStoreError {
    #[error("group status store error: {0}")]
    Storage(String),
}

/// Lifecycle status of a merge group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    /// Record created, manifest not yet processed
    Pending,
    /// A pipeline invocation has claimed this group
    InProgress,
    /// Merged output published (terminal)
    Success,
    /// Merge failed, inputs quarantined (terminal)
    Failed,
}

impl GroupStatus {
    /// Stored string form of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "PENDING",
            GroupStatus::InProgress => "IN_PROGRESS",
            GroupStatus::Success => "SUCCESS",
            GroupStatus::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(GroupStatus::Pending),
            "IN_PROGRESS" => Some(GroupStatus::InProgress),
            "SUCCESS" => Some(GroupStatus::Success),
            "FAILED" => Some(GroupStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Success | GroupStatus::Failed)
    }
}

/// One record per merge group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Unique group identifier
    pub group_id: String,
    /// Creation time, never mutated after the conditional insert
    pub created_at: DateTime<Utc>,
    /// TTL horizon as epoch seconds; the table reclaims expired records
    pub expires_at: i64,
    /// Lifecycle status; a record stored without a status reads as Pending
    pub status: GroupStatus,
}

/// Outcome of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Record created, group id is globally unique
    Created,
    /// A record with this group id already exists
    AlreadyExists,
}

/// Key-value store holding one lifecycle record per group id.
///
/// `create` is the only operation requiring linearizable semantics: it is the
/// uniqueness guard for allocated ids. `set_status` is an unconditional
/// overwrite (last write wins); `claim` adds the conditional
/// PENDING -> IN_PROGRESS transition that serializes concurrent triggers for
/// one group.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Insert a record, failing if the group id is already present
    async fn create(&self, record: &GroupRecord) -> Result<CreateOutcome, GroupStoreError>;

    /// Fetch the record for a group id, if any
    async fn get(&self, group_id: &str) -> Result<Option<GroupRecord>, GroupStoreError>;

    /// Atomically transition an unclaimed record to IN_PROGRESS.
    ///
    /// Returns `false` when the record does not exist, is already claimed, or
    /// has reached a terminal state.
    async fn claim(&self, group_id: &str) -> Result<bool, GroupStoreError>;

    /// Overwrite the status unconditionally
    async fn set_status(&self, group_id: &str, status: GroupStatus) -> Result<(), GroupStoreError>;
}

/// DynamoDB-backed group status store
#[derive(Clone)]
pub struct DynamoGroupStore {
    client: DynamoClient,
    table_name: String,
}

impl std::fmt::Debug for DynamoGroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoGroupStore")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoGroupStore {
    /// Create a store backed by the configured DynamoDB table
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &DynamoDbConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        // Endpoint override for LocalStack/dynamodb-local
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        let client = DynamoClient::from_conf(builder.build());

        info!(table = %config.table_name, "Group status store initialized");

        Self {
            client,
            table_name: config.table_name.clone(),
        }
    }

    /// Create from a pre-built client (for testing)
    pub fn from_client(client: DynamoClient, table_name: String) -> Self {
        Self { client, table_name }
    }

    fn item_to_record(
        item: &std::collections::HashMap<String, AttributeValue>,
    ) -> Option<GroupRecord> {
        let group_id = item.get(ATTR_GROUP_ID)?.as_s().ok()?.clone();
        let created_at = item
            .get(ATTR_CREATED_AT)
            .and_then(|v| v.as_s().ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let expires_at = item
            .get(ATTR_EXPIRES_AT)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        // Absent status means the pipeline never touched this group
        let status = item
            .get(ATTR_STATUS)
            .and_then(|v| v.as_s().ok())
            .and_then(|s| GroupStatus::parse(s))
            .unwrap_or(GroupStatus::Pending);

        Some(GroupRecord {
            group_id,
            created_at,
            expires_at,
            status,
        })
    }

    fn is_put_conditional_check_failed(
        err: &aws_sdk_dynamodb::error::SdkError<
            aws_sdk_dynamodb::operation::put_item::PutItemError,
        >,
    ) -> bool {
        use aws_sdk_dynamodb::error::SdkError;
        use aws_sdk_dynamodb::operation::put_item::PutItemError;

        match err {
            SdkError::ServiceError(service_err) => matches!(
                service_err.err(),
                PutItemError::ConditionalCheckFailedException(_)
            ),
            _ => false,
        }
    }

    fn is_update_conditional_check_failed(
        err: &aws_sdk_dynamodb::error::SdkError<
            aws_sdk_dynamodb::operation::update_item::UpdateItemError,
        >,
    ) -> bool {
        use aws_sdk_dynamodb::error::SdkError;
        use aws_sdk_dynamodb::operation::update_item::UpdateItemError;

        match err {
            SdkError::ServiceError(service_err) => matches!(
                service_err.err(),
                UpdateItemError::ConditionalCheckFailedException(_)
            ),
            _ => false,
        }
    }
}

#[async_trait]
impl GroupStore for DynamoGroupStore {
    async fn create(&self, record: &GroupRecord) -> Result<CreateOutcome, GroupStoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(ATTR_GROUP_ID, AttributeValue::S(record.group_id.clone()))
            .item(
                ATTR_CREATED_AT,
                AttributeValue::S(record.created_at.to_rfc3339()),
            )
            .item(
                ATTR_EXPIRES_AT,
                AttributeValue::N(record.expires_at.to_string()),
            )
            .condition_expression("attribute_not_exists(#pk)")
            .expression_attribute_names("#pk", ATTR_GROUP_ID)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(group_id = %record.group_id, "Group record created");
                Ok(CreateOutcome::Created)
            }
            Err(e) if Self::is_put_conditional_check_failed(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(GroupStoreError::Storage(format!(
                "DynamoDB PutItem failed: {e}"
            ))),
        }
    }

    async fn get(&self, group_id: &str) -> Result<Option<GroupRecord>, GroupStoreError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_GROUP_ID, AttributeValue::S(group_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| GroupStoreError::Storage(format!("DynamoDB GetItem failed: {e}")))?;

        Ok(response.item().and_then(Self::item_to_record))
    }

    async fn claim(&self, group_id: &str) -> Result<bool, GroupStoreError> {
        // attribute_exists(#pk) keeps UpdateItem from minting a phantom record
        // for an unknown group id.
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(ATTR_GROUP_ID, AttributeValue::S(group_id.to_string()))
            .update_expression("SET #st = :in_progress")
            .condition_expression(
                "attribute_exists(#pk) AND (attribute_not_exists(#st) OR #st = :pending)",
            )
            .expression_attribute_names("#pk", ATTR_GROUP_ID)
            .expression_attribute_names("#st", ATTR_STATUS)
            .expression_attribute_values(
                ":in_progress",
                AttributeValue::S(GroupStatus::InProgress.as_str().to_string()),
            )
            .expression_attribute_values(
                ":pending",
                AttributeValue::S(GroupStatus::Pending.as_str().to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if Self::is_update_conditional_check_failed(&e) => Ok(false),
            Err(e) => Err(GroupStoreError::Storage(format!(
                "DynamoDB UpdateItem failed: {e}"
            ))),
        }
    }

    async fn set_status(
        &self,
        group_id: &str,
        status: GroupStatus,
    ) -> Result<(), GroupStoreError> {
        // "status" is a DynamoDB reserved word, hence the attribute name alias
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(ATTR_GROUP_ID, AttributeValue::S(group_id.to_string()))
            .update_expression("SET #st = :s")
            .expression_attribute_names("#st", ATTR_STATUS)
            .expression_attribute_values(
                ":s",
                AttributeValue::S(status.as_str().to_string()),
            )
            .send()
            .await
            .map_err(|e| GroupStoreError::Storage(format!("DynamoDB UpdateItem failed: {e}")))?;

        debug!(group_id = %group_id, status = status.as_str(), "Group status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            GroupStatus::Pending,
            GroupStatus::InProgress,
            GroupStatus::Success,
            GroupStatus::Failed,
        ] {
            assert_eq!(GroupStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(GroupStatus::parse("BOGUS"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(GroupStatus::Success.is_terminal());
        assert!(GroupStatus::Failed.is_terminal());
        assert!(!GroupStatus::Pending.is_terminal());
        assert!(!GroupStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_item_without_status_reads_as_pending() {
        let mut item = std::collections::HashMap::new();
        item.insert(
            ATTR_GROUP_ID.to_string(),
            AttributeValue::S("g-1".to_string()),
        );
        item.insert(
            ATTR_CREATED_AT.to_string(),
            AttributeValue::S(Utc::now().to_rfc3339()),
        );
        item.insert(
            ATTR_EXPIRES_AT.to_string(),
            AttributeValue::N("1700000000".to_string()),
        );

        let record = DynamoGroupStore::item_to_record(&item).unwrap();
        assert_eq!(record.status, GroupStatus::Pending);
        assert_eq!(record.expires_at, 1_700_000_000);
    }
}
