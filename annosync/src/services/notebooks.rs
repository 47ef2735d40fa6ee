//! Notebooks service
//!
//! Local mutation API for notebooks and their ordered annotation
//! membership.

use super::lifecycle::{self, bumped};
use crate::database::{
    Annotation, AnnotationNotebook, Notebook, Repository, Status, StoreTransaction,
    TransactionKind,
};
use crate::error::{AppError, Result};

/// Service for managing notebooks
#[derive(Clone)]
pub struct NotebooksService {
    repo: Repository,
}

impl NotebooksService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    async fn touch_notebook(tx: &mut StoreTransaction, notebook_id: i64) -> Result<()> {
        let notebook = tx.require_notebook(notebook_id).await?;
        tx.touch_notebook(notebook_id, bumped(notebook.last_modified))
            .await
    }

    async fn touch_annotation(tx: &mut StoreTransaction, annotation_id: i64) -> Result<()> {
        let annotation = tx.require_annotation(annotation_id).await?;
        tx.touch_annotation(annotation_id, bumped(annotation.last_modified))
            .await
    }

    /// Create a new notebook
    pub async fn create_notebook(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Notebook> {
        tracing::info!("Creating new notebook: {}", name);

        let notebook = Notebook::new(name.trim(), description)?;

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let notebook = tx.insert_notebook(&notebook).await?;
        tx.commit().await?;

        Ok(notebook)
    }

    pub async fn get_notebook(&self, id: i64) -> Result<Notebook> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let notebook = tx.require_notebook(id).await;
        tx.commit().await?;
        notebook
    }

    pub async fn list_notebooks(&self, status: Status) -> Result<Vec<Notebook>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let notebooks = tx.notebooks_with_status(status).await?;
        tx.commit().await?;
        Ok(notebooks)
    }

    /// Rename or re-describe a notebook
    pub async fn update_notebook(
        &self,
        id: i64,
        name: Option<String>,
        description: Option<Option<String>>,
    ) -> Result<Notebook> {
        tracing::debug!("Updating notebook: {}", id);

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let current = tx.require_notebook(id).await?;

        let mut updated = current.touched(bumped(current.last_modified));
        if let Some(name) = name {
            updated.name = name.trim().to_string();
        }
        if let Some(description) = description {
            updated.description = description;
        }

        let notebook = tx.update_notebook(&updated).await?;
        tx.commit().await?;
        Ok(notebook)
    }

    // ===== Membership =====

    /// Active annotations of a notebook in display order
    pub async fn annotations(&self, notebook_id: i64) -> Result<Vec<Annotation>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let annotations = tx
            .annotations_in_notebook(notebook_id, Status::Active)
            .await?;
        tx.commit().await?;
        Ok(annotations)
    }

    /// Add an annotation at the end of the notebook
    pub async fn add_annotation(
        &self,
        notebook_id: i64,
        annotation_id: i64,
    ) -> Result<AnnotationNotebook> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        tx.require_notebook(notebook_id).await?;
        tx.require_annotation(annotation_id).await?;

        let membership = tx.append_membership(annotation_id, notebook_id).await?;
        Self::touch_notebook(&mut tx, notebook_id).await?;
        Self::touch_annotation(&mut tx, annotation_id).await?;
        tx.commit().await?;

        Ok(membership)
    }

    pub async fn remove_annotation(&self, notebook_id: i64, annotation_id: i64) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if tx.remove_membership(annotation_id, notebook_id).await? {
            Self::touch_notebook(&mut tx, notebook_id).await?;
            Self::touch_annotation(&mut tx, annotation_id).await?;
            lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Put the notebook's annotations in the given order.
    ///
    /// `annotation_ids` must name exactly the notebook's current members.
    pub async fn reorder(&self, notebook_id: i64, annotation_ids: &[i64]) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;

        let mut current: Vec<i64> = tx
            .memberships_for_notebook(notebook_id)
            .await?
            .into_iter()
            .map(|m| m.annotation_id)
            .collect();
        let mut requested = annotation_ids.to_vec();
        current.sort_unstable();
        requested.sort_unstable();
        if current != requested {
            tx.rollback().await?;
            return Err(AppError::Validation(format!(
                "reorder of notebook {} must list exactly its annotations",
                notebook_id
            )));
        }

        for (position, annotation_id) in annotation_ids.iter().enumerate() {
            tx.set_membership(*annotation_id, notebook_id, position as i64)
                .await?;
        }
        Self::touch_notebook(&mut tx, notebook_id).await?;
        tx.commit().await?;

        tracing::debug!("Reordered {} annotations in notebook {}", annotation_ids.len(), notebook_id);
        Ok(())
    }

    // ===== Lifecycle =====

    pub async fn trash(&self, ids: &[i64]) -> Result<Vec<Notebook>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::trash_notebooks(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn delete(&self, ids: &[i64]) -> Result<Vec<Notebook>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::delete_notebooks(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn restore(&self, ids: &[i64]) -> Result<Vec<Notebook>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::restore_notebooks(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn hard_delete(&self, id: i64) -> Result<()> {
        tracing::info!("Hard deleting notebook: {}", id);

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if !tx.delete_notebook(id).await? {
            tx.rollback().await?;
            return Err(AppError::NotebookNotFound(id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::AnnotationsService;

    async fn create_test_services() -> (NotebooksService, AnnotationsService) {
        let repo = Repository::open_in_memory().await.unwrap();
        (
            NotebooksService::new(repo.clone()),
            AnnotationsService::new(repo),
        )
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let (notebooks, _) = create_test_services().await;

        assert!(matches!(
            notebooks.create_notebook("   ", None).await,
            Err(AppError::Validation(_))
        ));
        let notebook = notebooks.create_notebook(" Study ", None).await.unwrap();
        assert_eq!(notebook.name, "Study");
    }

    #[tokio::test]
    async fn test_add_appends_and_reorder() {
        let (notebooks, annotations) = create_test_services().await;
        let notebook = notebooks.create_notebook("Study", None).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let annotation = annotations.create_annotation(None, None).await.unwrap();
            notebooks.add_annotation(notebook.id, annotation.id).await.unwrap();
            ids.push(annotation.id);
        }

        let listed: Vec<i64> = notebooks
            .annotations(notebook.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(listed, ids);

        let reversed: Vec<i64> = ids.iter().rev().copied().collect();
        notebooks.reorder(notebook.id, &reversed).await.unwrap();
        let listed: Vec<i64> = notebooks
            .annotations(notebook.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(listed, reversed);

        assert!(notebooks.reorder(notebook.id, &ids[..2]).await.is_err());
    }

    #[tokio::test]
    async fn test_removing_only_membership_trashes_empty_annotation() {
        let (notebooks, annotations) = create_test_services().await;
        let notebook = notebooks.create_notebook("Study", None).await.unwrap();
        let annotation = annotations.create_annotation(None, None).await.unwrap();

        notebooks.add_annotation(notebook.id, annotation.id).await.unwrap();
        notebooks
            .remove_annotation(notebook.id, annotation.id)
            .await
            .unwrap();

        let detail = annotations.get_annotation(annotation.id).await.unwrap();
        assert_eq!(detail.annotation.status, Status::Trashed);
        assert!(detail.notebooks.is_empty());
    }

    #[tokio::test]
    async fn test_notebook_lifecycle() {
        let (notebooks, _) = create_test_services().await;
        let notebook = notebooks.create_notebook("Study", None).await.unwrap();

        assert!(matches!(
            notebooks.delete(&[notebook.id]).await,
            Err(AppError::InvalidStateTransition { .. })
        ));

        notebooks.trash(&[notebook.id]).await.unwrap();
        let deleted = notebooks.delete(&[notebook.id]).await.unwrap();
        assert_eq!(deleted[0].status, Status::Deleted);

        let restored = notebooks.restore(&[notebook.id]).await.unwrap();
        assert_eq!(restored[0].status, Status::Active);
    }

    #[tokio::test]
    async fn test_update_notebook_fields() {
        let (notebooks, _) = create_test_services().await;
        let notebook = notebooks
            .create_notebook("Study", Some("old".into()))
            .await
            .unwrap();

        let updated = notebooks
            .update_notebook(notebook.id, Some("Prayer".into()), Some(None))
            .await
            .unwrap();
        assert_eq!(updated.name, "Prayer");
        assert!(updated.description.is_none());
        assert!(updated.last_modified > notebook.last_modified);

        let result = notebooks
            .update_notebook(notebook.id, Some(" ".into()), None)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
