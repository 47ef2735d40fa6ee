//! Annotations service
//!
//! Local mutation API for annotations and their children. Every call runs
//! in its own local transaction, bumps the annotation's `last_modified`
//! so the next sync round uploads it, and re-checks the empty-annotation
//! rule after removing a child.

use super::lifecycle::{self, bumped};
use crate::database::{
    Annotation, AnnotationDetail, Bookmark, Highlight, HighlightStyle, Link, Note,
    ParagraphRange, Repository, Status, StoreTransaction, Tag, TransactionKind,
};
use crate::error::{AppError, Result};

/// Service for managing annotations
#[derive(Clone)]
pub struct AnnotationsService {
    repo: Repository,
    device: Option<String>,
}

impl AnnotationsService {
    pub fn new(repo: Repository) -> Self {
        Self { repo, device: None }
    }

    /// Stamp annotations created here with a device name
    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    async fn touch(tx: &mut StoreTransaction, annotation_id: i64) -> Result<Annotation> {
        let annotation = tx.require_annotation(annotation_id).await?;
        let touched = annotation.touched(bumped(annotation.last_modified));
        tx.update_annotation(&touched).await
    }

    /// Create a new, empty annotation
    pub async fn create_annotation(
        &self,
        doc_id: Option<String>,
        doc_version: Option<i64>,
    ) -> Result<Annotation> {
        let mut annotation = Annotation::new(doc_id, doc_version);
        annotation.device = self.device.clone();

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let annotation = tx.insert_annotation(&annotation).await?;
        tx.commit().await?;

        tracing::info!("Annotation created: {}", annotation.unique_id);
        Ok(annotation)
    }

    pub async fn get_annotation(&self, id: i64) -> Result<AnnotationDetail> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let detail = tx.annotation_detail(id).await?;
        tx.commit().await?;

        detail.ok_or_else(|| AppError::AnnotationNotFound(id.to_string()))
    }

    pub async fn get_by_unique_id(&self, unique_id: &str) -> Result<AnnotationDetail> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let detail = match tx.annotation_by_unique_id(unique_id).await? {
            Some(annotation) => tx.annotation_detail(annotation.id).await?,
            None => None,
        };
        tx.commit().await?;

        detail.ok_or_else(|| AppError::AnnotationNotFound(unique_id.to_string()))
    }

    /// List annotations with a status, most recently modified first
    pub async fn list_annotations(&self, status: Status) -> Result<Vec<Annotation>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let annotations = tx.annotations_with_status(status).await?;
        tx.commit().await?;
        Ok(annotations)
    }

    // ===== Highlights =====

    pub async fn add_highlight(
        &self,
        annotation_id: i64,
        range: ParagraphRange,
        color_name: &str,
        style: HighlightStyle,
    ) -> Result<Highlight> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let highlight = tx
            .insert_highlight(&Highlight::new(annotation_id, range, color_name, style))
            .await?;
        Self::touch(&mut tx, annotation_id).await?;
        tx.commit().await?;

        tracing::debug!("Highlight {} added to annotation {}", highlight.id, annotation_id);
        Ok(highlight)
    }

    pub async fn remove_highlight(&self, highlight_id: i64) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if let Some(annotation_id) = tx.delete_highlight(highlight_id).await? {
            Self::touch(&mut tx, annotation_id).await?;
            lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ===== Links =====

    pub async fn add_link(
        &self,
        annotation_id: i64,
        name: &str,
        dest_doc_id: &str,
        dest_doc_version: i64,
        dest_paragraph_ids: Vec<String>,
    ) -> Result<Link> {
        let link = Link::new(annotation_id, name, dest_doc_id, dest_doc_version, dest_paragraph_ids);

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let link = tx.insert_link(&link).await?;
        Self::touch(&mut tx, annotation_id).await?;
        tx.commit().await?;
        Ok(link)
    }

    pub async fn remove_link(&self, link_id: i64) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if let Some(annotation_id) = tx.delete_link(link_id).await? {
            Self::touch(&mut tx, annotation_id).await?;
            lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ===== Tags =====

    /// Tag an annotation; names match existing tags without regard to case
    pub async fn add_tag(&self, annotation_id: i64, name: &str) -> Result<Tag> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        tx.require_annotation(annotation_id).await?;
        let tag = tx.add_tag(annotation_id, name).await?;
        Self::touch(&mut tx, annotation_id).await?;
        tx.commit().await?;
        Ok(tag)
    }

    pub async fn remove_tag(&self, annotation_id: i64, name: &str) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if let Some(tag) = tx.tag_by_name(name).await? {
            if tx.remove_tag(annotation_id, tag.id).await? {
                Self::touch(&mut tx, annotation_id).await?;
                lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let tags = tx.all_tags().await?;
        tx.commit().await?;
        Ok(tags)
    }

    // ===== Note and bookmark =====

    pub async fn set_note(
        &self,
        annotation_id: i64,
        title: Option<String>,
        content: &str,
    ) -> Result<Note> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let note = tx.save_note(&Note::new(annotation_id, title, content)).await?;
        Self::touch(&mut tx, annotation_id).await?;
        tx.commit().await?;
        Ok(note)
    }

    pub async fn remove_note(&self, annotation_id: i64) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if tx.delete_note_for(annotation_id).await? {
            Self::touch(&mut tx, annotation_id).await?;
            lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_bookmark(&self, bookmark: &Bookmark) -> Result<Bookmark> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let saved = tx.save_bookmark(bookmark).await?;
        Self::touch(&mut tx, bookmark.annotation_id).await?;
        tx.commit().await?;
        Ok(saved)
    }

    pub async fn remove_bookmark(&self, annotation_id: i64) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if tx.delete_bookmark_for(annotation_id).await? {
            Self::touch(&mut tx, annotation_id).await?;
            lifecycle::trash_if_empty(&mut tx, annotation_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ===== Lifecycle =====

    pub async fn trash(&self, ids: &[i64]) -> Result<Vec<Annotation>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::trash_annotations(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn delete(&self, ids: &[i64]) -> Result<Vec<Annotation>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::delete_annotations(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn restore(&self, ids: &[i64]) -> Result<Vec<Annotation>> {
        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        let result = lifecycle::restore_annotations(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Remove an annotation and everything attached to it right away.
    /// Nothing is uploaded for it.
    pub async fn hard_delete(&self, id: i64) -> Result<()> {
        tracing::info!("Hard deleting annotation: {}", id);

        let mut tx = self.repo.begin(TransactionKind::Local).await?;
        if !tx.delete_annotation(id).await? {
            tx.rollback().await?;
            return Err(AppError::AnnotationNotFound(id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }
}
