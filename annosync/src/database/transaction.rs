//! Store transactions and change notification batching
//!
//! A [`StoreTransaction`] is the explicit transaction context: it owns the
//! database transaction, knows which kind of work it belongs to (local API
//! call or sync application) and accumulates the ids of every annotation
//! and notebook touched underneath it. Nothing about the transaction lives
//! in global or thread-local state, so several stores can coexist.
//!
//! Nesting works in two ways, both of which require the same kind as the
//! outer transaction:
//! - [`StoreTransaction::join`] simply participates in the outer work.
//! - [`StoreTransaction::savepoint`] opens a nested sub-transaction that can
//!   be rolled back on its own, discarding its writes and change ids.
//!
//! Observers are told about changes once, when the outermost transaction
//! commits. A rolled back transaction notifies nobody.

use crate::error::{AppError, Result};
use serde::Serialize;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::broadcast;

/// Which kind of work a transaction performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Mutations requested through the local API
    Local,
    /// Application of remote changes during a sync round
    Sync,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionKind::Local => "local",
            TransactionKind::Sync => "sync",
        })
    }
}

/// Entity family a notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangedEntity {
    Annotations,
    Notebooks,
}

/// Delivered to observers after the outermost transaction commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeNotification {
    pub source: TransactionKind,
    pub entity: ChangedEntity,
    pub ids: BTreeSet<i64>,
}

/// Ids touched inside a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub annotations: BTreeSet<i64>,
    pub notebooks: BTreeSet<i64>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.notebooks.is_empty()
    }
}

/// Open transaction against the entity store
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
    kind: TransactionKind,
    changes: ChangeSet,
    /// Change set as it was when each open savepoint started
    savepoints: Vec<ChangeSet>,
    notifier: broadcast::Sender<ChangeNotification>,
}

impl StoreTransaction {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        kind: TransactionKind,
        notifier: broadcast::Sender<ChangeNotification>,
    ) -> Self {
        Self {
            tx,
            kind,
            changes: ChangeSet::default(),
            savepoints: Vec::new(),
            notifier,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Nesting depth: 1 for the outermost transaction.
    pub fn depth(&self) -> usize {
        self.savepoints.len() + 1
    }

    /// Ids accumulated so far.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Participate in this transaction as a nested unit of the given kind.
    pub fn join(&self, kind: TransactionKind) -> Result<()> {
        if kind != self.kind {
            return Err(AppError::TransactionConflict {
                active: self.kind,
                requested: kind,
            });
        }
        Ok(())
    }

    /// Open a nested sub-transaction of the given kind.
    pub async fn savepoint(&mut self, kind: TransactionKind) -> Result<()> {
        self.join(kind)?;

        let name = savepoint_name(self.savepoints.len() + 1);
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;

        self.savepoints.push(self.changes.clone());
        Ok(())
    }

    /// Keep the writes of the innermost sub-transaction.
    pub async fn release_savepoint(&mut self) -> Result<()> {
        let name = savepoint_name(self.savepoints.len());
        if self.savepoints.pop().is_none() {
            return Err(AppError::Generic("no savepoint to release".into()));
        }

        sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Undo the writes of the innermost sub-transaction.
    pub async fn rollback_savepoint(&mut self) -> Result<()> {
        let name = savepoint_name(self.savepoints.len());
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| AppError::Generic("no savepoint to roll back".into()))?;

        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;

        self.changes = snapshot;
        Ok(())
    }

    /// Commit and notify observers of everything that changed.
    pub async fn commit(mut self) -> Result<ChangeSet> {
        while !self.savepoints.is_empty() {
            self.release_savepoint().await?;
        }

        let StoreTransaction {
            tx,
            kind,
            changes,
            notifier,
            ..
        } = self;

        tx.commit().await?;

        tracing::debug!(
            "Committed {} transaction: {} annotations, {} notebooks changed",
            kind,
            changes.annotations.len(),
            changes.notebooks.len()
        );

        notify(&notifier, kind, &changes);
        Ok(changes)
    }

    /// Discard every write made in this transaction.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        tracing::debug!("Rolled back {} transaction", self.kind);
        Ok(())
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub(crate) fn mark_annotation(&mut self, id: i64) {
        self.changes.annotations.insert(id);
    }

    pub(crate) fn mark_notebook(&mut self, id: i64) {
        self.changes.notebooks.insert(id);
    }
}

fn notify(
    notifier: &broadcast::Sender<ChangeNotification>,
    source: TransactionKind,
    changes: &ChangeSet,
) {
    let batches = [
        (ChangedEntity::Annotations, &changes.annotations),
        (ChangedEntity::Notebooks, &changes.notebooks),
    ];

    for (entity, ids) in batches {
        if ids.is_empty() {
            continue;
        }
        // Sending only fails when nobody is subscribed.
        let _ = notifier.send(ChangeNotification {
            source,
            entity,
            ids: ids.clone(),
        });
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("sp_{}", depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Annotation, Repository};

    async fn insert_one(tx: &mut StoreTransaction) -> i64 {
        let annotation = Annotation::new(Some("doc".into()), Some(1));
        tx.insert_annotation(&annotation).await.unwrap().id
    }

    #[tokio::test]
    async fn test_nested_same_kind_is_allowed() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();

        tx.join(TransactionKind::Local).unwrap();
        tx.savepoint(TransactionKind::Local).await.unwrap();
        assert_eq!(tx.depth(), 2);
        insert_one(&mut tx).await;
        tx.release_savepoint().await.unwrap();

        let changes = tx.commit().await.unwrap();
        assert_eq!(changes.annotations.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_kind_is_rejected() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Sync).await.unwrap();

        let err = tx.savepoint(TransactionKind::Local).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::TransactionConflict {
                active: TransactionKind::Sync,
                requested: TransactionKind::Local
            }
        ));
        assert!(tx.join(TransactionKind::Local).is_err());
    }

    #[tokio::test]
    async fn test_notifications_fire_once_on_outer_commit() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut events = repo.subscribe();

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let first = insert_one(&mut tx).await;
        tx.savepoint(TransactionKind::Local).await.unwrap();
        let second = insert_one(&mut tx).await;
        tx.release_savepoint().await.unwrap();

        assert!(events.try_recv().is_err(), "nothing before commit");

        tx.commit().await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.source, TransactionKind::Local);
        assert_eq!(event.entity, ChangedEntity::Annotations);
        assert_eq!(event.ids, BTreeSet::from([first, second]));
        assert!(events.try_recv().is_err(), "exactly one event per entity family");
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_notifications() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut events = repo.subscribe();

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let id = insert_one(&mut tx).await;
        tx.rollback().await.unwrap();

        assert!(events.try_recv().is_err());
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        assert!(tx.annotation_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_work() {
        let repo = Repository::open_in_memory().await.unwrap();

        let mut tx = repo.begin(TransactionKind::Sync).await.unwrap();
        let kept = insert_one(&mut tx).await;

        tx.savepoint(TransactionKind::Sync).await.unwrap();
        let discarded = insert_one(&mut tx).await;
        tx.rollback_savepoint().await.unwrap();

        assert!(tx.annotation_by_id(discarded).await.unwrap().is_none());
        let changes = tx.commit().await.unwrap();
        assert_eq!(changes.annotations, BTreeSet::from([kept]));
    }
}
