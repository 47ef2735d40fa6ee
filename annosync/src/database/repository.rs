//! Repository layer for database operations
//!
//! [`Repository`] is the entity store handle: it owns the connection pool
//! and the change notifier and hands out [`StoreTransaction`]s. Every
//! read and write happens on a transaction so that all mutations are
//! batched into one notification per outermost commit.
//!
//! This file holds the queries for the two root entities (annotations
//! and notebooks) plus the key/value settings table. Child and junction
//! queries live in `children.rs`.

use super::models::*;
use super::transaction::{ChangeNotification, StoreTransaction, TransactionKind};
use super::{connect_in_memory, create_pool};
use crate::config::{NOTIFICATION_CHANNEL_CAPACITY, SYNC_TOKEN_SETTING_KEY};
use crate::error::{AppError, Result};
use crate::sync::SyncToken;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use tokio::sync::broadcast;

/// Handle to the entity store
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
    notifier: broadcast::Sender<ChangeNotification>,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self { pool, notifier }
    }

    /// Open (and migrate) the store at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(create_pool(db_path).await?))
    }

    /// Open a private, migrated in-memory store
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(connect_in_memory().await?))
    }

    /// Receive one notification per entity family for every commit.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifier.subscribe()
    }

    /// Begin an outermost transaction.
    ///
    /// The store has a single writer connection, so this waits while
    /// another task holds a transaction.
    pub async fn begin(&self, kind: TransactionKind) -> Result<StoreTransaction> {
        let tx = self.pool.begin().await?;
        tracing::debug!("Began {} transaction", kind);
        Ok(StoreTransaction::new(tx, kind, self.notifier.clone()))
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Set setting: {}", key);
        Ok(())
    }

    /// Last committed cursor, or the zero cursor before the first sync.
    /// An unreadable stored value is treated as no cursor at all.
    pub async fn load_sync_token(&self) -> Result<SyncToken> {
        let stored = self.get_setting(SYNC_TOKEN_SETTING_KEY).await?;

        Ok(match stored.as_deref().map(SyncToken::decode) {
            Some(Some(token)) => token,
            Some(None) => {
                tracing::warn!("Stored sync token is malformed, starting from scratch");
                SyncToken::default()
            }
            None => SyncToken::default(),
        })
    }

    pub async fn save_sync_token(&self, token: &SyncToken) -> Result<()> {
        self.set_setting(SYNC_TOKEN_SETTING_KEY, &token.encode()).await
    }
}

impl StoreTransaction {
    // ===== Annotations =====

    pub async fn insert_annotation(&mut self, annotation: &Annotation) -> Result<Annotation> {
        annotation.validate()?;

        let inserted = sqlx::query_as::<_, Annotation>(
            r#"
            INSERT INTO annotation
                (unique_id, doc_id, doc_version, status, created, last_modified, source, device)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&annotation.unique_id)
        .bind(&annotation.doc_id)
        .bind(annotation.doc_version)
        .bind(annotation.status.as_db_str())
        .bind(to_millis(annotation.created))
        .bind(to_millis(annotation.last_modified))
        .bind(&annotation.source)
        .bind(&annotation.device)
        .fetch_one(self.conn())
        .await?;

        self.mark_annotation(inserted.id);
        tracing::debug!("Inserted annotation {} ({})", inserted.id, inserted.unique_id);
        Ok(inserted)
    }

    /// Save every field of an existing annotation.
    pub async fn update_annotation(&mut self, annotation: &Annotation) -> Result<Annotation> {
        annotation.validate()?;

        let rows = sqlx::query(
            r#"
            UPDATE annotation
            SET unique_id = ?, doc_id = ?, doc_version = ?, status = ?,
                created = ?, last_modified = ?, source = ?, device = ?
            WHERE id = ?
            "#,
        )
        .bind(&annotation.unique_id)
        .bind(&annotation.doc_id)
        .bind(annotation.doc_version)
        .bind(annotation.status.as_db_str())
        .bind(to_millis(annotation.created))
        .bind(to_millis(annotation.last_modified))
        .bind(&annotation.source)
        .bind(&annotation.device)
        .bind(annotation.id)
        .execute(self.conn())
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(AppError::AnnotationNotFound(annotation.id.to_string()));
        }

        self.mark_annotation(annotation.id);
        Ok(annotation.clone())
    }

    /// Bump `last_modified` so the annotation is picked up by the next upload.
    pub async fn touch_annotation(&mut self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let rows = sqlx::query("UPDATE annotation SET last_modified = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::AnnotationNotFound(id.to_string()));
        }

        self.mark_annotation(id);
        Ok(())
    }

    pub async fn annotation_by_id(&mut self, id: i64) -> Result<Option<Annotation>> {
        let annotation = sqlx::query_as::<_, Annotation>("SELECT * FROM annotation WHERE id = ?")
            .bind(id)
            .fetch_optional(self.conn())
            .await?;

        Ok(annotation)
    }

    pub async fn require_annotation(&mut self, id: i64) -> Result<Annotation> {
        self.annotation_by_id(id)
            .await?
            .ok_or_else(|| AppError::AnnotationNotFound(id.to_string()))
    }

    pub async fn annotation_by_unique_id(&mut self, unique_id: &str) -> Result<Option<Annotation>> {
        let annotation =
            sqlx::query_as::<_, Annotation>("SELECT * FROM annotation WHERE unique_id = ?")
                .bind(unique_id)
                .fetch_optional(self.conn())
                .await?;

        Ok(annotation)
    }

    pub async fn annotations_with_status(&mut self, status: Status) -> Result<Vec<Annotation>> {
        let annotations = sqlx::query_as::<_, Annotation>(
            r#"
            SELECT * FROM annotation
            WHERE status = ?
            ORDER BY last_modified DESC, id DESC
            "#,
        )
        .bind(status.as_db_str())
        .fetch_all(self.conn())
        .await?;

        Ok(annotations)
    }

    /// Annotations with `after < last_modified <= up_to`, any status.
    pub async fn annotations_modified_between(
        &mut self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<Annotation>> {
        let annotations = sqlx::query_as::<_, Annotation>(
            r#"
            SELECT * FROM annotation
            WHERE last_modified > ? AND last_modified <= ?
            ORDER BY last_modified ASC, id ASC
            "#,
        )
        .bind(to_millis(after))
        .bind(to_millis(up_to))
        .fetch_all(self.conn())
        .await?;

        Ok(annotations)
    }

    /// Hard delete. Children and junction rows go with it.
    pub async fn delete_annotation(&mut self, id: i64) -> Result<bool> {
        let notebooks: Vec<i64> =
            sqlx::query_scalar("SELECT notebook_id FROM annotation_notebook WHERE annotation_id = ?")
                .bind(id)
                .fetch_all(self.conn())
                .await?;

        let rows = sqlx::query("DELETE FROM annotation WHERE id = ?")
            .bind(id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows == 0 {
            return Ok(false);
        }

        self.mark_annotation(id);
        for notebook_id in notebooks {
            self.mark_notebook(notebook_id);
        }

        tracing::debug!("Hard deleted annotation {}", id);
        Ok(true)
    }

    /// Hard delete every non-active annotation last modified at or before
    /// `up_to`. Returns the purged ids.
    pub async fn purge_inactive_annotations(&mut self, up_to: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM annotation WHERE status != '' AND last_modified <= ?",
        )
        .bind(to_millis(up_to))
        .fetch_all(self.conn())
        .await?;

        for id in &ids {
            self.delete_annotation(*id).await?;
        }

        if !ids.is_empty() {
            tracing::info!("Purged {} inactive annotations", ids.len());
        }
        Ok(ids)
    }

    /// Whether the annotation still has a highlight, note, bookmark, link
    /// or tag. Notebook membership does not count.
    pub async fn has_children(&mut self, annotation_id: i64) -> Result<bool> {
        let present: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM highlight WHERE annotation_id = ?1)
                OR EXISTS (SELECT 1 FROM link WHERE annotation_id = ?1)
                OR EXISTS (SELECT 1 FROM annotation_tag WHERE annotation_id = ?1)
                OR EXISTS (SELECT 1 FROM bookmark WHERE annotation_id = ?1)
                OR EXISTS (SELECT 1 FROM note WHERE annotation_id = ?1)
            "#,
        )
        .bind(annotation_id)
        .fetch_one(self.conn())
        .await?;

        Ok(present)
    }

    // ===== Notebooks =====

    pub async fn insert_notebook(&mut self, notebook: &Notebook) -> Result<Notebook> {
        notebook.validate()?;

        let inserted = sqlx::query_as::<_, Notebook>(
            r#"
            INSERT INTO notebook (unique_id, name, description, status, last_modified)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&notebook.unique_id)
        .bind(&notebook.name)
        .bind(&notebook.description)
        .bind(notebook.status.as_db_str())
        .bind(to_millis(notebook.last_modified))
        .fetch_one(self.conn())
        .await?;

        self.mark_notebook(inserted.id);
        tracing::debug!("Inserted notebook {} ({})", inserted.id, inserted.unique_id);
        Ok(inserted)
    }

    pub async fn update_notebook(&mut self, notebook: &Notebook) -> Result<Notebook> {
        notebook.validate()?;

        let rows = sqlx::query(
            r#"
            UPDATE notebook
            SET unique_id = ?, name = ?, description = ?, status = ?, last_modified = ?
            WHERE id = ?
            "#,
        )
        .bind(&notebook.unique_id)
        .bind(&notebook.name)
        .bind(&notebook.description)
        .bind(notebook.status.as_db_str())
        .bind(to_millis(notebook.last_modified))
        .bind(notebook.id)
        .execute(self.conn())
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(AppError::NotebookNotFound(notebook.id.to_string()));
        }

        self.mark_notebook(notebook.id);
        Ok(notebook.clone())
    }

    pub async fn touch_notebook(&mut self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let rows = sqlx::query("UPDATE notebook SET last_modified = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::NotebookNotFound(id.to_string()));
        }

        self.mark_notebook(id);
        Ok(())
    }

    pub async fn notebook_by_id(&mut self, id: i64) -> Result<Option<Notebook>> {
        let notebook = sqlx::query_as::<_, Notebook>("SELECT * FROM notebook WHERE id = ?")
            .bind(id)
            .fetch_optional(self.conn())
            .await?;

        Ok(notebook)
    }

    pub async fn require_notebook(&mut self, id: i64) -> Result<Notebook> {
        self.notebook_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotebookNotFound(id.to_string()))
    }

    pub async fn notebook_by_unique_id(&mut self, unique_id: &str) -> Result<Option<Notebook>> {
        let notebook = sqlx::query_as::<_, Notebook>("SELECT * FROM notebook WHERE unique_id = ?")
            .bind(unique_id)
            .fetch_optional(self.conn())
            .await?;

        Ok(notebook)
    }

    pub async fn notebooks_with_status(&mut self, status: Status) -> Result<Vec<Notebook>> {
        let notebooks = sqlx::query_as::<_, Notebook>(
            "SELECT * FROM notebook WHERE status = ? ORDER BY name COLLATE NOCASE, id",
        )
        .bind(status.as_db_str())
        .fetch_all(self.conn())
        .await?;

        Ok(notebooks)
    }

    /// Notebooks with `after < last_modified <= up_to`, any status.
    pub async fn notebooks_modified_between(
        &mut self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<Notebook>> {
        let notebooks = sqlx::query_as::<_, Notebook>(
            r#"
            SELECT * FROM notebook
            WHERE last_modified > ? AND last_modified <= ?
            ORDER BY last_modified ASC, id ASC
            "#,
        )
        .bind(to_millis(after))
        .bind(to_millis(up_to))
        .fetch_all(self.conn())
        .await?;

        Ok(notebooks)
    }

    /// Hard delete. Memberships go with it.
    pub async fn delete_notebook(&mut self, id: i64) -> Result<bool> {
        let members: Vec<i64> =
            sqlx::query_scalar("SELECT annotation_id FROM annotation_notebook WHERE notebook_id = ?")
                .bind(id)
                .fetch_all(self.conn())
                .await?;

        let rows = sqlx::query("DELETE FROM notebook WHERE id = ?")
            .bind(id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows == 0 {
            return Ok(false);
        }

        self.mark_notebook(id);
        for annotation_id in members {
            self.mark_annotation(annotation_id);
        }

        tracing::debug!("Hard deleted notebook {}", id);
        Ok(true)
    }

    /// Hard delete every non-active notebook last modified at or before
    /// `up_to`. Returns the purged ids.
    pub async fn purge_inactive_notebooks(&mut self, up_to: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM notebook WHERE status != '' AND last_modified <= ?")
                .bind(to_millis(up_to))
                .fetch_all(self.conn())
                .await?;

        for id in &ids {
            self.delete_notebook(*id).await?;
        }

        if !ids.is_empty() {
            tracing::info!("Purged {} inactive notebooks", ids.len());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_and_find_annotation() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();

        let annotation = Annotation::new(Some("doc-1".into()), Some(3));
        let inserted = tx.insert_annotation(&annotation).await.unwrap();
        assert!(inserted.id > 0);
        assert_eq!(inserted.unique_id, annotation.unique_id);
        assert_eq!(inserted.last_modified, annotation.last_modified);

        let found = tx
            .annotation_by_unique_id(&annotation.unique_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, inserted);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();

        let annotation = Annotation::new(None, None);
        tx.insert_annotation(&annotation).await.unwrap();
        assert!(tx.insert_annotation(&annotation).await.is_err());
    }

    #[tokio::test]
    async fn test_modified_between_is_half_open() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();

        let base = now();
        let mut early = Annotation::new(None, None);
        early.last_modified = base;
        let mut late = Annotation::new(None, None);
        late.last_modified = base + Duration::seconds(10);
        tx.insert_annotation(&early).await.unwrap();
        tx.insert_annotation(&late).await.unwrap();

        let window = tx
            .annotations_modified_between(base, base + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].unique_id, late.unique_id);
    }

    #[tokio::test]
    async fn test_purge_only_touches_inactive_before_boundary() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Sync).await.unwrap();

        let base = now();
        let active = tx
            .insert_annotation(&Annotation::new(None, None).touched(base))
            .await
            .unwrap();
        let trashed = tx
            .insert_annotation(&Annotation::new(None, None).with_status(Status::Trashed, base))
            .await
            .unwrap();
        let later = tx
            .insert_annotation(
                &Annotation::new(None, None)
                    .with_status(Status::Deleted, base + Duration::seconds(5)),
            )
            .await
            .unwrap();

        let purged = tx.purge_inactive_annotations(base).await.unwrap();
        assert_eq!(purged, vec![trashed.id]);
        assert!(tx.annotation_by_id(active.id).await.unwrap().is_some());
        assert!(tx.annotation_by_id(later.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_token_persistence() {
        let repo = Repository::open_in_memory().await.unwrap();

        assert_eq!(repo.load_sync_token().await.unwrap(), SyncToken::default());

        let token = SyncToken::default().with_notebooks(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            DateTime::from_timestamp(1_700_000_100, 0).unwrap(),
        );
        repo.save_sync_token(&token).await.unwrap();
        assert_eq!(repo.load_sync_token().await.unwrap(), token);

        repo.set_setting(SYNC_TOKEN_SETTING_KEY, "garbage").await.unwrap();
        assert_eq!(repo.load_sync_token().await.unwrap(), SyncToken::default());
    }

    #[tokio::test]
    async fn test_notebook_update_requires_existing_row() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();

        let notebook = Notebook::new("Study", None).unwrap();
        let result = tx.update_notebook(&notebook).await;
        assert!(matches!(result, Err(AppError::NotebookNotFound(_))));
    }
}
