//! Child and junction queries
//!
//! Every mutation records the owning annotation (and, for notebook
//! membership, the notebook) as changed on the transaction.

use super::models::*;
use super::transaction::StoreTransaction;
use crate::error::{AppError, Result};

impl StoreTransaction {
    // ===== Highlights =====

    pub async fn insert_highlight(&mut self, highlight: &Highlight) -> Result<Highlight> {
        highlight.validate()?;

        let inserted = sqlx::query_as::<_, Highlight>(
            r#"
            INSERT INTO highlight
                (paragraph_id, offset_start, offset_end, color_name, style, annotation_id)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&highlight.range.paragraph_id)
        .bind(highlight.range.start)
        .bind(highlight.range.end)
        .bind(&highlight.color_name)
        .bind(highlight.style.as_str())
        .bind(highlight.annotation_id)
        .fetch_one(self.conn())
        .await?;

        self.mark_annotation(inserted.annotation_id);
        Ok(inserted)
    }

    pub async fn highlights_for(&mut self, annotation_id: i64) -> Result<Vec<Highlight>> {
        let highlights = sqlx::query_as::<_, Highlight>(
            "SELECT * FROM highlight WHERE annotation_id = ? ORDER BY id",
        )
        .bind(annotation_id)
        .fetch_all(self.conn())
        .await?;

        Ok(highlights)
    }

    /// Delete one highlight, returning the annotation it belonged to.
    pub async fn delete_highlight(&mut self, id: i64) -> Result<Option<i64>> {
        let owner: Option<i64> =
            sqlx::query_scalar("DELETE FROM highlight WHERE id = ? RETURNING annotation_id")
                .bind(id)
                .fetch_optional(self.conn())
                .await?;

        if let Some(annotation_id) = owner {
            self.mark_annotation(annotation_id);
        }
        Ok(owner)
    }

    pub async fn delete_highlights_for(&mut self, annotation_id: i64) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM highlight WHERE annotation_id = ?")
            .bind(annotation_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows)
    }

    // ===== Notes (0..1 per annotation) =====

    pub async fn note_for(&mut self, annotation_id: i64) -> Result<Option<Note>> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM note WHERE annotation_id = ?")
            .bind(annotation_id)
            .fetch_optional(self.conn())
            .await?;

        Ok(note)
    }

    /// Insert the annotation's note, or replace the existing one's fields.
    pub async fn save_note(&mut self, note: &Note) -> Result<Note> {
        note.validate()?;

        let saved = sqlx::query_as::<_, Note>(
            r#"
            INSERT INTO note (title, content, annotation_id) VALUES (?, ?, ?)
            ON CONFLICT(annotation_id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content
            RETURNING *
            "#,
        )
        .bind(&note.title)
        .bind(&note.content)
        .bind(note.annotation_id)
        .fetch_one(self.conn())
        .await?;

        self.mark_annotation(saved.annotation_id);
        Ok(saved)
    }

    pub async fn delete_note_for(&mut self, annotation_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM note WHERE annotation_id = ?")
            .bind(annotation_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows > 0)
    }

    // ===== Bookmarks (0..1 per annotation) =====

    pub async fn bookmark_for(&mut self, annotation_id: i64) -> Result<Option<Bookmark>> {
        let bookmark =
            sqlx::query_as::<_, Bookmark>("SELECT * FROM bookmark WHERE annotation_id = ?")
                .bind(annotation_id)
                .fetch_optional(self.conn())
                .await?;

        Ok(bookmark)
    }

    pub async fn save_bookmark(&mut self, bookmark: &Bookmark) -> Result<Bookmark> {
        bookmark.validate()?;

        let saved = sqlx::query_as::<_, Bookmark>(
            r#"
            INSERT INTO bookmark (name, paragraph_id, display_order, word_offset, annotation_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(annotation_id) DO UPDATE SET
                name = excluded.name,
                paragraph_id = excluded.paragraph_id,
                display_order = excluded.display_order,
                word_offset = excluded.word_offset
            RETURNING *
            "#,
        )
        .bind(&bookmark.name)
        .bind(&bookmark.paragraph_id)
        .bind(bookmark.display_order)
        .bind(bookmark.offset)
        .bind(bookmark.annotation_id)
        .fetch_one(self.conn())
        .await?;

        self.mark_annotation(saved.annotation_id);
        Ok(saved)
    }

    pub async fn delete_bookmark_for(&mut self, annotation_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM bookmark WHERE annotation_id = ?")
            .bind(annotation_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows > 0)
    }

    // ===== Links =====

    pub async fn insert_link(&mut self, link: &Link) -> Result<Link> {
        link.validate()?;

        let paragraphs = serde_json::to_string(&link.dest_paragraph_ids)?;
        let inserted = sqlx::query_as::<_, Link>(
            r#"
            INSERT INTO link
                (name, dest_doc_id, dest_doc_version, dest_paragraph_ids, annotation_id)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&link.name)
        .bind(&link.dest_doc_id)
        .bind(link.dest_doc_version)
        .bind(paragraphs)
        .bind(link.annotation_id)
        .fetch_one(self.conn())
        .await?;

        self.mark_annotation(inserted.annotation_id);
        Ok(inserted)
    }

    pub async fn links_for(&mut self, annotation_id: i64) -> Result<Vec<Link>> {
        let links = sqlx::query_as::<_, Link>("SELECT * FROM link WHERE annotation_id = ? ORDER BY id")
            .bind(annotation_id)
            .fetch_all(self.conn())
            .await?;

        Ok(links)
    }

    /// Delete one link, returning the annotation it belonged to.
    pub async fn delete_link(&mut self, id: i64) -> Result<Option<i64>> {
        let owner: Option<i64> =
            sqlx::query_scalar("DELETE FROM link WHERE id = ? RETURNING annotation_id")
                .bind(id)
                .fetch_optional(self.conn())
                .await?;

        if let Some(annotation_id) = owner {
            self.mark_annotation(annotation_id);
        }
        Ok(owner)
    }

    pub async fn delete_links_for(&mut self, annotation_id: i64) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM link WHERE annotation_id = ?")
            .bind(annotation_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows)
    }

    // ===== Tags =====

    /// Case-insensitive lookup.
    pub async fn tag_by_name(&mut self, name: &str) -> Result<Option<Tag>> {
        let tag = sqlx::query_as::<_, Tag>("SELECT * FROM tag WHERE name = ? COLLATE NOCASE")
            .bind(name.trim())
            .fetch_optional(self.conn())
            .await?;

        Ok(tag)
    }

    /// Reuse the tag whose name matches without regard to case, or create it.
    pub async fn find_or_create_tag(&mut self, name: &str) -> Result<Tag> {
        Tag::validate_name(name)?;

        if let Some(tag) = self.tag_by_name(name).await? {
            return Ok(tag);
        }

        let tag = sqlx::query_as::<_, Tag>("INSERT INTO tag (name) VALUES (?) RETURNING *")
            .bind(name.trim())
            .fetch_one(self.conn())
            .await?;

        tracing::debug!("Created tag {:?}", tag.name);
        Ok(tag)
    }

    pub async fn all_tags(&mut self) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>("SELECT * FROM tag ORDER BY name COLLATE NOCASE")
            .fetch_all(self.conn())
            .await?;

        Ok(tags)
    }

    pub async fn tags_for(&mut self, annotation_id: i64) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT tag.* FROM tag
            JOIN annotation_tag ON annotation_tag.tag_id = tag.id
            WHERE annotation_tag.annotation_id = ?
            ORDER BY tag.name COLLATE NOCASE
            "#,
        )
        .bind(annotation_id)
        .fetch_all(self.conn())
        .await?;

        Ok(tags)
    }

    /// Associate a tag by name, creating the tag row when needed.
    pub async fn add_tag(&mut self, annotation_id: i64, name: &str) -> Result<Tag> {
        let tag = self.find_or_create_tag(name).await?;

        sqlx::query("INSERT OR IGNORE INTO annotation_tag (annotation_id, tag_id) VALUES (?, ?)")
            .bind(annotation_id)
            .bind(tag.id)
            .execute(self.conn())
            .await?;

        self.mark_annotation(annotation_id);
        Ok(tag)
    }

    pub async fn remove_tag(&mut self, annotation_id: i64, tag_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM annotation_tag WHERE annotation_id = ? AND tag_id = ?")
            .bind(annotation_id)
            .bind(tag_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows > 0)
    }

    pub async fn remove_all_tags(&mut self, annotation_id: i64) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM annotation_tag WHERE annotation_id = ?")
            .bind(annotation_id)
            .execute(self.conn())
            .await?
            .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
        }
        Ok(rows)
    }

    // ===== Notebook membership =====

    pub async fn memberships_for_annotation(
        &mut self,
        annotation_id: i64,
    ) -> Result<Vec<AnnotationNotebook>> {
        let memberships = sqlx::query_as::<_, AnnotationNotebook>(
            "SELECT * FROM annotation_notebook WHERE annotation_id = ? ORDER BY notebook_id",
        )
        .bind(annotation_id)
        .fetch_all(self.conn())
        .await?;

        Ok(memberships)
    }

    pub async fn memberships_for_notebook(
        &mut self,
        notebook_id: i64,
    ) -> Result<Vec<AnnotationNotebook>> {
        let memberships = sqlx::query_as::<_, AnnotationNotebook>(
            r#"
            SELECT * FROM annotation_notebook
            WHERE notebook_id = ?
            ORDER BY display_order, annotation_id
            "#,
        )
        .bind(notebook_id)
        .fetch_all(self.conn())
        .await?;

        Ok(memberships)
    }

    pub async fn max_display_order(&mut self, notebook_id: i64) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(display_order) FROM annotation_notebook WHERE notebook_id = ?",
        )
        .bind(notebook_id)
        .fetch_one(self.conn())
        .await?;

        Ok(max)
    }

    /// Insert or reposition a membership.
    pub async fn set_membership(
        &mut self,
        annotation_id: i64,
        notebook_id: i64,
        display_order: i64,
    ) -> Result<AnnotationNotebook> {
        if annotation_id == 0 || notebook_id == 0 {
            return Err(AppError::Validation(
                "notebook membership needs both an annotation and a notebook".into(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO annotation_notebook (annotation_id, notebook_id, display_order)
            VALUES (?, ?, ?)
            ON CONFLICT(annotation_id, notebook_id) DO UPDATE SET
                display_order = excluded.display_order
            "#,
        )
        .bind(annotation_id)
        .bind(notebook_id)
        .bind(display_order)
        .execute(self.conn())
        .await?;

        self.mark_annotation(annotation_id);
        self.mark_notebook(notebook_id);
        Ok(AnnotationNotebook {
            annotation_id,
            notebook_id,
            display_order,
        })
    }

    /// Append at the end of the notebook's current order.
    pub async fn append_membership(
        &mut self,
        annotation_id: i64,
        notebook_id: i64,
    ) -> Result<AnnotationNotebook> {
        let next = self
            .max_display_order(notebook_id)
            .await?
            .map_or(0, |max| max + 1);
        self.set_membership(annotation_id, notebook_id, next).await
    }

    pub async fn remove_membership(&mut self, annotation_id: i64, notebook_id: i64) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM annotation_notebook WHERE annotation_id = ? AND notebook_id = ?",
        )
        .bind(annotation_id)
        .bind(notebook_id)
        .execute(self.conn())
        .await?
        .rows_affected();

        if rows > 0 {
            self.mark_annotation(annotation_id);
            self.mark_notebook(notebook_id);
        }
        Ok(rows > 0)
    }

    /// Annotations of a notebook in display order.
    pub async fn annotations_in_notebook(
        &mut self,
        notebook_id: i64,
        status: Status,
    ) -> Result<Vec<Annotation>> {
        let annotations = sqlx::query_as::<_, Annotation>(
            r#"
            SELECT annotation.* FROM annotation
            JOIN annotation_notebook ON annotation_notebook.annotation_id = annotation.id
            WHERE annotation_notebook.notebook_id = ? AND annotation.status = ?
            ORDER BY annotation_notebook.display_order, annotation.id
            "#,
        )
        .bind(notebook_id)
        .bind(status.as_db_str())
        .fetch_all(self.conn())
        .await?;

        Ok(annotations)
    }

    /// Unique ids of a notebook's active annotations in display order.
    pub async fn notebook_order(&mut self, notebook_id: i64) -> Result<Vec<String>> {
        let ids = self
            .annotations_in_notebook(notebook_id, Status::Active)
            .await?
            .into_iter()
            .map(|a| a.unique_id)
            .collect();

        Ok(ids)
    }

    // ===== Assembly =====

    /// The annotation with every child, or `None` if it does not exist.
    pub async fn annotation_detail(&mut self, id: i64) -> Result<Option<AnnotationDetail>> {
        let Some(annotation) = self.annotation_by_id(id).await? else {
            return Ok(None);
        };

        let notebooks: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT notebook.unique_id, annotation_notebook.display_order
            FROM annotation_notebook
            JOIN notebook ON notebook.id = annotation_notebook.notebook_id
            WHERE annotation_notebook.annotation_id = ?
            ORDER BY notebook.unique_id
            "#,
        )
        .bind(id)
        .fetch_all(self.conn())
        .await?;

        Ok(Some(AnnotationDetail {
            note: self.note_for(id).await?,
            bookmark: self.bookmark_for(id).await?,
            highlights: self.highlights_for(id).await?,
            links: self.links_for(id).await?,
            tags: self.tags_for(id).await?,
            notebooks,
            annotation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::database::*;

    async fn setup() -> (Repository, StoreTransaction, Annotation) {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let annotation = tx
            .insert_annotation(&Annotation::new(Some("doc".into()), Some(1)))
            .await
            .unwrap();
        (repo, tx, annotation)
    }

    #[tokio::test]
    async fn test_tags_are_case_insensitive() {
        let (_repo, mut tx, annotation) = setup().await;

        let first = tx.add_tag(annotation.id, "Faith").await.unwrap();
        let second = tx.add_tag(annotation.id, "faith").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(tx.tags_for(annotation.id).await.unwrap().len(), 1);
        assert_eq!(tx.all_tags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_note_upsert_keeps_single_row() {
        let (_repo, mut tx, annotation) = setup().await;

        tx.save_note(&Note::new(annotation.id, None, "first"))
            .await
            .unwrap();
        tx.save_note(&Note::new(annotation.id, Some("Title".into()), "second"))
            .await
            .unwrap();

        let note = tx.note_for(annotation.id).await.unwrap().unwrap();
        assert_eq!(note.content, "second");
        assert_eq!(note.title.as_deref(), Some("Title"));
    }

    #[tokio::test]
    async fn test_link_paragraphs_round_trip() {
        let (_repo, mut tx, annotation) = setup().await;

        let link = Link::new(annotation.id, "See also", "doc-9", 2, vec!["p3".into(), "p4".into()]);
        tx.insert_link(&link).await.unwrap();

        let links = tx.links_for(annotation.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].dest_paragraph_ids, vec!["p3", "p4"]);
    }

    #[tokio::test]
    async fn test_membership_append_and_order() {
        let (_repo, mut tx, first) = setup().await;
        let second = tx
            .insert_annotation(&Annotation::new(None, None))
            .await
            .unwrap();
        let notebook = tx
            .insert_notebook(&Notebook::new("Study", None).unwrap())
            .await
            .unwrap();

        tx.append_membership(second.id, notebook.id).await.unwrap();
        tx.append_membership(first.id, notebook.id).await.unwrap();

        let order = tx.notebook_order(notebook.id).await.unwrap();
        assert_eq!(order, vec![second.unique_id.clone(), first.unique_id.clone()]);

        tx.set_membership(first.id, notebook.id, -1).await.unwrap();
        let order = tx.notebook_order(notebook.id).await.unwrap();
        assert_eq!(order, vec![first.unique_id, second.unique_id]);
    }

    #[tokio::test]
    async fn test_delete_annotation_cascades_children() {
        let (_repo, mut tx, annotation) = setup().await;
        let range = ParagraphRange {
            paragraph_id: "p1".into(),
            start: 0,
            end: 5,
        };
        tx.insert_highlight(&Highlight::new(
            annotation.id,
            range,
            "yellow",
            HighlightStyle::Highlight,
        ))
        .await
        .unwrap();
        tx.add_tag(annotation.id, "study").await.unwrap();

        assert!(tx.has_children(annotation.id).await.unwrap());
        assert!(tx.delete_annotation(annotation.id).await.unwrap());
        assert!(tx.highlights_for(annotation.id).await.unwrap().is_empty());
        assert!(tx.tags_for(annotation.id).await.unwrap().is_empty());
        assert!(!tx.has_children(annotation.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_detail_assembly() {
        let (_repo, mut tx, annotation) = setup().await;
        let notebook = tx
            .insert_notebook(&Notebook::new("Study", None).unwrap())
            .await
            .unwrap();
        tx.append_membership(annotation.id, notebook.id).await.unwrap();
        tx.save_bookmark(&Bookmark::new(annotation.id, Some("Here".into()), None))
            .await
            .unwrap();

        let detail = tx.annotation_detail(annotation.id).await.unwrap().unwrap();
        assert!(detail.has_children());
        assert_eq!(detail.notebooks, vec![(notebook.unique_id, 0)]);
        assert!(detail.bookmark.is_some());
        assert!(detail.note.is_none());
    }
}
