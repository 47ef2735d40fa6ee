//! Lifecycle policy
//!
//! The active/trashed/deleted state machine shared by every local
//! mutation path:
//! - trash is allowed from active (or already trashed, a no-op)
//! - delete is allowed from trashed (or already deleted, a no-op)
//! - restore always returns to active
//!
//! Batch operations validate every input before mutating any of them.
//! An annotation that still has a highlight, note, bookmark, link or tag
//! is never trashed: the request leaves its status unchanged.
//!
//! All helpers participate in the caller's local transaction.

use crate::database::{Annotation, Notebook, Status, StoreTransaction, TransactionKind};
use crate::database::models::now;
use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};

/// Next `last_modified` value: now, but strictly after `previous`.
pub(crate) fn bumped(previous: DateTime<Utc>) -> DateTime<Utc> {
    let ts = now();
    if ts > previous {
        ts
    } else {
        previous + Duration::milliseconds(1)
    }
}

fn check_all(
    entity: &str,
    statuses: impl IntoIterator<Item = Status>,
    allowed: &[Status],
    to: Status,
) -> Result<()> {
    for from in statuses {
        if !allowed.contains(&from) {
            return Err(AppError::InvalidStateTransition {
                entity: entity.to_string(),
                from,
                to,
            });
        }
    }
    Ok(())
}

/// Trash the annotation if nothing keeps it alive any more.
///
/// Returns whether the status changed. Called after every child removal.
pub async fn trash_if_empty(tx: &mut StoreTransaction, annotation_id: i64) -> Result<bool> {
    tx.join(TransactionKind::Local)?;

    let annotation = tx.require_annotation(annotation_id).await?;
    if annotation.status != Status::Active || tx.has_children(annotation_id).await? {
        return Ok(false);
    }

    let trashed = annotation.with_status(Status::Trashed, bumped(annotation.last_modified));
    tx.update_annotation(&trashed).await?;

    tracing::debug!("Auto-trashed empty annotation {}", annotation_id);
    Ok(true)
}

async fn load_annotations(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Annotation>> {
    let mut annotations = Vec::with_capacity(ids.len());
    for id in ids {
        annotations.push(tx.require_annotation(*id).await?);
    }
    Ok(annotations)
}

async fn load_notebooks(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Notebook>> {
    let mut notebooks = Vec::with_capacity(ids.len());
    for id in ids {
        notebooks.push(tx.require_notebook(*id).await?);
    }
    Ok(notebooks)
}

/// Trash annotations. Ones with children keep their status.
pub async fn trash_annotations(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Annotation>> {
    tx.join(TransactionKind::Local)?;

    let annotations = load_annotations(tx, ids).await?;
    check_all(
        "annotation",
        annotations.iter().map(|a| a.status),
        &[Status::Active, Status::Trashed],
        Status::Trashed,
    )?;

    let mut result = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        if annotation.status == Status::Active && !tx.has_children(annotation.id).await? {
            let trashed =
                annotation.with_status(Status::Trashed, bumped(annotation.last_modified));
            result.push(tx.update_annotation(&trashed).await?);
        } else {
            result.push(annotation);
        }
    }
    Ok(result)
}

pub async fn delete_annotations(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Annotation>> {
    tx.join(TransactionKind::Local)?;

    let annotations = load_annotations(tx, ids).await?;
    check_all(
        "annotation",
        annotations.iter().map(|a| a.status),
        &[Status::Trashed, Status::Deleted],
        Status::Deleted,
    )?;

    let mut result = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        if annotation.status == Status::Trashed {
            let deleted =
                annotation.with_status(Status::Deleted, bumped(annotation.last_modified));
            result.push(tx.update_annotation(&deleted).await?);
        } else {
            result.push(annotation);
        }
    }
    Ok(result)
}

pub async fn restore_annotations(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Annotation>> {
    tx.join(TransactionKind::Local)?;

    let annotations = load_annotations(tx, ids).await?;
    let mut result = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        let restored = annotation.with_status(Status::Active, bumped(annotation.last_modified));
        result.push(tx.update_annotation(&restored).await?);
    }
    Ok(result)
}

pub async fn trash_notebooks(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Notebook>> {
    tx.join(TransactionKind::Local)?;

    let notebooks = load_notebooks(tx, ids).await?;
    check_all(
        "notebook",
        notebooks.iter().map(|n| n.status),
        &[Status::Active, Status::Trashed],
        Status::Trashed,
    )?;

    let mut result = Vec::with_capacity(notebooks.len());
    for notebook in notebooks {
        if notebook.status == Status::Active {
            let trashed = notebook.with_status(Status::Trashed, bumped(notebook.last_modified));
            result.push(tx.update_notebook(&trashed).await?);
        } else {
            result.push(notebook);
        }
    }
    Ok(result)
}

pub async fn delete_notebooks(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Notebook>> {
    tx.join(TransactionKind::Local)?;

    let notebooks = load_notebooks(tx, ids).await?;
    check_all(
        "notebook",
        notebooks.iter().map(|n| n.status),
        &[Status::Trashed, Status::Deleted],
        Status::Deleted,
    )?;

    let mut result = Vec::with_capacity(notebooks.len());
    for notebook in notebooks {
        if notebook.status == Status::Trashed {
            let deleted = notebook.with_status(Status::Deleted, bumped(notebook.last_modified));
            result.push(tx.update_notebook(&deleted).await?);
        } else {
            result.push(notebook);
        }
    }
    Ok(result)
}

pub async fn restore_notebooks(tx: &mut StoreTransaction, ids: &[i64]) -> Result<Vec<Notebook>> {
    tx.join(TransactionKind::Local)?;

    let notebooks = load_notebooks(tx, ids).await?;
    let mut result = Vec::with_capacity(notebooks.len());
    for notebook in notebooks {
        let restored = notebook.with_status(Status::Active, bumped(notebook.last_modified));
        result.push(tx.update_notebook(&restored).await?);
    }
    Ok(result)
}
