//! Async operation tracking (SPEC_FULL.md §4.8).
//!
//! Every retain/consolidation/refresh job is wrapped in an
//! `async_operations` row (`storage::OperationRow`) so a caller can
//! poll progress and so a batch that splits into children carries a
//! traceable parent/child relationship. Parent/child linkage isn't a
//! schema column — it's folded into the opaque `result_metadata_json`
//! blob the storage layer already carries, queried back out with
//! `json_extract` the same way tag filters reach into tag JSON arrays
//! (§4.1). This module owns the typed shape of that blob, one struct
//! per operation `kind`, so call sites never hand-build JSON.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{OperationRow, Storage};

/// Discriminates the closed set of `result_metadata` shapes. Stored
/// alongside the row's `kind` column so a reader can pick the right
/// variant to deserialize into without re-deriving it from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Retain,
    BatchRetainParent,
    BatchRetainChild,
    Consolidation,
    RefreshMentalModel,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Retain => "retain",
            OperationKind::BatchRetainParent => "batch_retain_parent",
            OperationKind::BatchRetainChild => "batch_retain_child",
            OperationKind::Consolidation => "consolidation",
            OperationKind::RefreshMentalModel => "refresh_mental_model",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainMetadata {
    pub items_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRetainParentMetadata {
    pub items_count: usize,
    pub total_tokens: usize,
    pub num_sub_batches: usize,
    pub is_parent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRetainChildMetadata {
    pub items_count: usize,
    pub parent_operation_id: String,
    pub sub_batch_index: usize,
    pub total_sub_batches: usize,
}

/// Reserved for future consolidation-run statistics; presently empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationMetadata {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshMentalModelMetadata {
    pub mental_model_id: String,
}

/// Create a `pending` operation row of the given kind with no metadata
/// yet attached (metadata is only known once the job completes).
pub fn start(storage: &Storage, bank_id: &str, kind: OperationKind, created_at: chrono::DateTime<chrono::Utc>) -> Result<String> {
    let id = crate::memory::new_id();
    storage.create_operation(&id, bank_id, kind.as_str(), created_at)?;
    Ok(id)
}

/// Mark an operation complete, attaching its typed metadata payload.
pub fn finish<M: Serialize>(storage: &Storage, operation_id: &str, completed_at: chrono::DateTime<chrono::Utc>, metadata: &M) -> Result<()> {
    let json = serde_json::to_string(metadata)
        .map_err(|e| crate::error::EngineError::Fatal(format!("operation metadata serialization failed: {e}")))?;
    storage.complete_operation(operation_id, completed_at, &json)
}

pub fn fail(storage: &Storage, operation_id: &str, completed_at: chrono::DateTime<chrono::Utc>, error: &str) -> Result<()> {
    storage.fail_operation(operation_id, completed_at, error)
}

/// Deserialize a completed operation's metadata into a caller-chosen
/// shape. Returns `None` if the operation has no metadata yet (still
/// running, or failed before completion).
pub fn metadata_of<M: for<'de> Deserialize<'de>>(row: &OperationRow) -> Option<M> {
    row.result_metadata_json.as_ref().and_then(|json| serde_json::from_str(json).ok())
}

/// Find every child of a `batch_retain` parent operation by scanning
/// the bank's operations for `BatchRetainChildMetadata.parent_operation_id
/// == parent_id`. A real deployment would push this filter into SQL via
/// `json_extract(result_metadata, '$.parent_operation_id')`; expressed
/// here as a decode-then-filter pass over the already-fetched bank
/// operation list, since `list_operations_by_bank` already issues that
/// query and a second bespoke SQL path would duplicate it for no gain
/// at the row counts a single bank's operations log holds.
pub fn children_of(storage: &Storage, bank_id: &str, parent_operation_id: &str) -> Result<Vec<OperationRow>> {
    let all = storage.list_operations_by_bank(bank_id, None)?;
    Ok(all
        .into_iter()
        .filter(|row| {
            row.kind == OperationKind::BatchRetainChild.as_str()
                && metadata_of::<BatchRetainChildMetadata>(row)
                    .is_some_and(|m| m.parent_operation_id == parent_operation_id)
        })
        .collect())
}
