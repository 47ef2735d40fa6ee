//! Notebook sync engine
//!
//! One request per round: upload local notebook changes made since the
//! last round and download everything the service has since our server
//! cursor. Remote changes are applied in a single sync transaction, each
//! inside its own savepoint so a change that fails to apply is reported
//! and skipped.
//! The per-notebook annotation order found in the response is handed to
//! the annotation engine.

use super::summary::{ChangeError, SyncSummary};
use super::token::{whole_seconds, SyncToken};
use super::transport::{Endpoint, SyncTransport};
use super::wire::{parse_change, FolderChange, FolderPayload, SyncRequest, SyncResponse};
use crate::config::NOT_DELETED_SYNC_STATUS;
use crate::database::{
    now, ChangedEntity, Notebook, Repository, Status, StoreTransaction, TransactionKind,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Authoritative annotation order per notebook unique id
pub type NotebookOrder = HashMap<String, Vec<String>>;

/// Result of the notebook phase
#[derive(Debug, Clone)]
pub struct NotebookRound {
    /// Upper bound of the local upload window
    pub local_boundary: DateTime<Utc>,
    /// Server cursor returned by the service
    pub server_before: DateTime<Utc>,
    pub order: NotebookOrder,
    pub summary: SyncSummary,
}

/// Notebook sync engine
#[derive(Clone)]
pub struct NotebookSyncEngine {
    repo: Repository,
    transport: Arc<dyn SyncTransport>,
}

impl NotebookSyncEngine {
    pub fn new(repo: Repository, transport: Arc<dyn SyncTransport>) -> Self {
        Self { repo, transport }
    }

    /// Run the notebook phase of a round.
    pub async fn run(&self, token: &SyncToken) -> Result<NotebookRound> {
        let local_boundary = whole_seconds(now());
        let mut summary = SyncSummary::default();

        let changes = self
            .collect_local_changes(token.local_notebooks, local_boundary)
            .await?;
        tracing::info!("Notebook sync: uploading {} changes", changes.len());

        let mut request = SyncRequest::new(token.server_notebooks, now());
        if token.is_first_notebook_sync() {
            request.sync_status = Some(NOT_DELETED_SYNC_STATUS.to_string());
        }
        let uploaded = changes.len() as u64;
        request.changes = changes;

        let raw = self
            .transport
            .put(Endpoint::Notebooks, serde_json::to_value(&request)?)
            .await?;
        let response: SyncResponse = serde_json::from_value(raw)?;
        summary.uploaded.notebooks = uploaded;

        for error in &response.errors {
            tracing::warn!("Service rejected notebook change: {}", error);
            summary.errors.push(ChangeError::new(
                ChangedEntity::Notebooks,
                error.id.clone(),
                error.to_string(),
            ));
        }

        let mut parsed = Vec::with_capacity(response.changes.len());
        for raw in response.changes {
            match parse_change::<FolderChange>(raw, "folderId") {
                Ok(change) => parsed.push(change),
                Err((unique_id, error)) => {
                    tracing::warn!(
                        "Skipping malformed notebook change {:?}: {}",
                        unique_id,
                        error
                    );
                    summary.errors.push(ChangeError::new(
                        ChangedEntity::Notebooks,
                        unique_id,
                        error.to_string(),
                    ));
                }
            }
        }

        let order = self
            .apply_remote_changes(parsed, local_boundary, &mut summary)
            .await?;

        tracing::info!(
            "Notebook sync finished: {} uploaded, {} downloaded",
            summary.uploaded.notebooks,
            summary.downloaded.notebooks
        );

        Ok(NotebookRound {
            local_boundary,
            server_before: response.before,
            order,
            summary,
        })
    }

    /// Notebooks modified in `(after, up_to]` as change records.
    async fn collect_local_changes(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<FolderChange>> {
        let mut tx = self.repo.begin(TransactionKind::Sync).await?;

        let notebooks = tx.notebooks_modified_between(after, up_to).await?;
        let mut changes = Vec::with_capacity(notebooks.len());
        for notebook in &notebooks {
            let order = if notebook.status.is_active() {
                tx.notebook_order(notebook.id).await?
            } else {
                Vec::new()
            };
            changes.push(FolderChange::from_local(notebook, order));
        }

        tx.commit().await?;
        Ok(changes)
    }

    async fn apply_remote_changes(
        &self,
        changes: Vec<FolderChange>,
        local_boundary: DateTime<Utc>,
        summary: &mut SyncSummary,
    ) -> Result<NotebookOrder> {
        let mut order = NotebookOrder::new();
        let mut tx = self.repo.begin(TransactionKind::Sync).await?;

        for change in changes {
            let folder_id = change.folder_id().to_string();

            tx.savepoint(TransactionKind::Sync).await?;
            match apply_change(&mut tx, change).await {
                Ok(annotation_ids) => {
                    tx.release_savepoint().await?;
                    if let Some(annotation_ids) = annotation_ids {
                        order.insert(folder_id, annotation_ids);
                    }
                    summary.downloaded.notebooks += 1;
                }
                Err(e) => {
                    tx.rollback_savepoint().await?;
                    tracing::warn!("Failed to apply notebook {}: {}", folder_id, e);
                    summary.errors.push(ChangeError::new(
                        ChangedEntity::Notebooks,
                        Some(folder_id),
                        e.to_string(),
                    ));
                }
            }
        }

        replay_order(&mut tx, &order).await?;
        tx.purge_inactive_notebooks(local_boundary).await?;
        tx.commit().await?;

        Ok(order)
    }
}

/// Apply one remote change. Returns the notebook's annotation order for
/// a `new` change.
async fn apply_change(
    tx: &mut StoreTransaction,
    change: FolderChange,
) -> Result<Option<Vec<String>>> {
    match change {
        FolderChange::New {
            folder_id,
            timestamp,
            folder,
        } => {
            let annotation_ids = folder.annotation_ids.clone();
            upsert_notebook(tx, &folder_id, timestamp, folder).await?;
            Ok(Some(annotation_ids))
        }
        FolderChange::Trash { folder_id, .. } | FolderChange::Delete { folder_id, .. } => {
            if let Some(notebook) = tx.notebook_by_unique_id(&folder_id).await? {
                tx.delete_notebook(notebook.id).await?;
            }
            Ok(None)
        }
    }
}

async fn upsert_notebook(
    tx: &mut StoreTransaction,
    unique_id: &str,
    timestamp: DateTime<Utc>,
    folder: FolderPayload,
) -> Result<Notebook> {
    match tx.notebook_by_unique_id(unique_id).await? {
        Some(existing) => {
            let updated = Notebook {
                name: folder.name,
                description: folder.description,
                status: Status::Active,
                last_modified: timestamp,
                ..existing
            };
            tx.update_notebook(&updated).await
        }
        None => {
            let notebook = Notebook {
                id: 0,
                unique_id: unique_id.to_string(),
                name: folder.name,
                description: folder.description,
                status: Status::Active,
                last_modified: timestamp,
            };
            tx.insert_notebook(&notebook).await
        }
    }
}

/// Apply the authoritative order to memberships that already exist locally.
async fn replay_order(tx: &mut StoreTransaction, order: &NotebookOrder) -> Result<()> {
    for (folder_id, annotation_ids) in order {
        let Some(notebook) = tx.notebook_by_unique_id(folder_id).await? else {
            continue;
        };
        let members: HashMap<i64, i64> = tx
            .memberships_for_notebook(notebook.id)
            .await?
            .into_iter()
            .map(|m| (m.annotation_id, m.display_order))
            .collect();

        for (position, annotation_uid) in annotation_ids.iter().enumerate() {
            let Some(annotation) = tx.annotation_by_unique_id(annotation_uid).await? else {
                continue;
            };
            let position = position as i64;
            if members.get(&annotation.id).is_some_and(|current| *current != position) {
                tx.set_membership(annotation.id, notebook.id, position).await?;
            }
        }
    }
    Ok(())
}
