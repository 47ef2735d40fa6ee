//! Annotation sync engine
//!
//! Two requests per round against the same endpoint:
//! 1. Probe: upload local changes and ask which annotations changed on
//!    the service since our server cursor. An empty answer ends the round.
//! 2. Fetch: ask for the full documents of those annotations, attaching
//!    the host's current version of each referenced document.
//!
//! Each downloaded change is applied inside its own savepoint so a change
//! that fails to apply is rolled back and reported without touching the
//! others. Collections (highlights, links, tags) are replaced wholesale.

use super::notebooks::NotebookOrder;
use super::summary::{ChangeCounts, ChangeError, SyncSummary};
use super::token::{whole_seconds, SyncToken};
use super::transport::{Endpoint, SyncTransport};
use super::wire::{
    parse_change, AnnotationChange, AnnotationPayload, SyncId, SyncRequest, SyncResponse,
};
use crate::config::NOT_DELETED_SYNC_STATUS;
use crate::database::{
    now, Annotation, Bookmark, ChangedEntity, Highlight, Link, Note, ParagraphRange, Repository,
    Status, StoreTransaction, TransactionKind,
};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Host lookup of the local version of each document
pub trait DocVersionProvider: Send + Sync {
    fn doc_versions(&self, doc_ids: &[String]) -> HashMap<String, i64>;
}

impl<F> DocVersionProvider for F
where
    F: Fn(&[String]) -> HashMap<String, i64> + Send + Sync,
{
    fn doc_versions(&self, doc_ids: &[String]) -> HashMap<String, i64> {
        self(doc_ids)
    }
}

/// Provider for hosts that do not track document versions
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDocVersions;

impl DocVersionProvider for NoDocVersions {
    fn doc_versions(&self, _doc_ids: &[String]) -> HashMap<String, i64> {
        HashMap::new()
    }
}

/// Result of the annotation phase
#[derive(Debug, Clone)]
pub struct AnnotationRound {
    pub local_boundary: DateTime<Utc>,
    pub server_before: DateTime<Utc>,
    pub summary: SyncSummary,
}

/// Failed annotation phase with the partial summary up to the failure
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AnnotationFailure {
    #[source]
    pub error: AppError,
    pub summary: SyncSummary,
}

/// Annotation sync engine
#[derive(Clone)]
pub struct AnnotationSyncEngine {
    repo: Repository,
    transport: Arc<dyn SyncTransport>,
    doc_versions: Arc<dyn DocVersionProvider>,
}

impl AnnotationSyncEngine {
    pub fn new(
        repo: Repository,
        transport: Arc<dyn SyncTransport>,
        doc_versions: Arc<dyn DocVersionProvider>,
    ) -> Self {
        Self {
            repo,
            transport,
            doc_versions,
        }
    }

    /// Run the annotation phase of a round.
    ///
    /// `order` is the authoritative per-notebook order from the notebook
    /// phase of the same round. On failure the error carries whatever the
    /// phase had already uploaded or applied.
    pub async fn run(
        &self,
        token: &SyncToken,
        order: &NotebookOrder,
    ) -> std::result::Result<AnnotationRound, AnnotationFailure> {
        let mut summary = SyncSummary::default();
        match self.run_phase(token, order, &mut summary).await {
            Ok((local_boundary, server_before)) => Ok(AnnotationRound {
                local_boundary,
                server_before,
                summary,
            }),
            Err(error) => Err(AnnotationFailure { error, summary }),
        }
    }

    /// Returns the local boundary and the server cursor of the round.
    async fn run_phase(
        &self,
        token: &SyncToken,
        order: &NotebookOrder,
        summary: &mut SyncSummary,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let local_boundary = whole_seconds(now());

        let (changes, uploaded) = self
            .collect_local_changes(token.local_annotations, local_boundary)
            .await?;
        tracing::info!("Annotation sync: uploading {} changes", changes.len());

        let mut probe = SyncRequest::new(token.server_annotations, now());
        if token.is_first_annotation_sync() {
            probe.sync_status = Some(NOT_DELETED_SYNC_STATUS.to_string());
        }
        probe.changes = changes;

        let probed = self.send(&probe).await?;
        summary.uploaded += uploaded;
        collect_service_errors(&probed, summary);

        let sync_ids = probed.sync_ids.clone().unwrap_or_default();
        if sync_ids.is_empty() {
            tracing::info!("Annotation sync: no remote changes");
            self.purge(local_boundary).await?;
            return Ok((local_boundary, probed.before));
        }

        tracing::info!("Annotation sync: fetching {} annotations", sync_ids.len());
        let mut fetch: SyncRequest<AnnotationChange> =
            SyncRequest::new(token.server_annotations, now());
        fetch.sync_ids = Some(self.attach_doc_versions(sync_ids));

        let fetched = self.send(&fetch).await?;
        collect_service_errors(&fetched, summary);

        let mut parsed = Vec::with_capacity(fetched.changes.len());
        for raw in fetched.changes {
            match parse_change::<AnnotationChange>(raw, "annotationId") {
                Ok(change) => parsed.push(change),
                Err((unique_id, error)) => {
                    tracing::warn!(
                        "Skipping malformed annotation change {:?}: {}",
                        unique_id,
                        error
                    );
                    summary.errors.push(ChangeError::new(
                        ChangedEntity::Annotations,
                        unique_id,
                        error.to_string(),
                    ));
                }
            }
        }

        self.apply_remote_changes(parsed, order, local_boundary, summary)
            .await?;

        tracing::info!(
            "Annotation sync finished: {} uploaded, {} downloaded, {} skipped",
            summary.uploaded.annotations,
            summary.downloaded.annotations,
            summary.errors.len()
        );

        Ok((local_boundary, probed.before))
    }

    async fn send(&self, request: &SyncRequest<AnnotationChange>) -> Result<SyncResponse> {
        let raw = self
            .transport
            .put(Endpoint::Annotations, serde_json::to_value(request)?)
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    fn attach_doc_versions(&self, mut sync_ids: Vec<SyncId>) -> Vec<SyncId> {
        let doc_ids: Vec<String> = sync_ids
            .iter()
            .filter_map(|id| id.doc_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if doc_ids.is_empty() {
            return sync_ids;
        }

        let versions = self.doc_versions.doc_versions(&doc_ids);
        for id in &mut sync_ids {
            id.doc_version = id
                .doc_id
                .as_ref()
                .and_then(|doc| versions.get(doc).copied());
        }
        sync_ids
    }

    /// Annotations modified in `(after, up_to]` as change records, with
    /// the counts of what they carry.
    async fn collect_local_changes(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<(Vec<AnnotationChange>, ChangeCounts)> {
        let mut tx = self.repo.begin(TransactionKind::Sync).await?;
        let annotations = tx.annotations_modified_between(after, up_to).await?;

        let mut changes = Vec::with_capacity(annotations.len());
        let mut counts = ChangeCounts::default();
        for annotation in annotations {
            let Some(detail) = tx.annotation_detail(annotation.id).await? else {
                continue;
            };
            let change = AnnotationChange::from_local(&detail);
            if let AnnotationChange::New { annotation, .. } = &change {
                counts += payload_counts(annotation);
            } else {
                counts.annotations += 1;
            }
            changes.push(change);
        }

        tx.commit().await?;
        Ok((changes, counts))
    }

    async fn apply_remote_changes(
        &self,
        changes: Vec<AnnotationChange>,
        order: &NotebookOrder,
        local_boundary: DateTime<Utc>,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let mut applied = SyncSummary::default();
        let mut tx = self.repo.begin(TransactionKind::Sync).await?;

        for change in changes {
            let unique_id = change.annotation_id().to_string();

            tx.savepoint(TransactionKind::Sync).await?;
            match apply_change(&mut tx, change, order).await {
                Ok(counts) => {
                    tx.release_savepoint().await?;
                    applied.downloaded += counts;
                }
                Err(e) => {
                    tx.rollback_savepoint().await?;
                    tracing::warn!("Failed to apply annotation {}: {}", unique_id, e);
                    applied.errors.push(ChangeError::new(
                        ChangedEntity::Annotations,
                        Some(unique_id),
                        e.to_string(),
                    ));
                }
            }
        }

        tx.purge_inactive_annotations(local_boundary).await?;
        tx.commit().await?;

        // Counted only once the batch is committed
        summary.merge(applied);
        Ok(())
    }

    async fn purge(&self, local_boundary: DateTime<Utc>) -> Result<()> {
        let mut tx = self.repo.begin(TransactionKind::Sync).await?;
        tx.purge_inactive_annotations(local_boundary).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn collect_service_errors(response: &SyncResponse, summary: &mut SyncSummary) {
    for error in &response.errors {
        tracing::warn!("Service rejected annotation change: {}", error);
        summary.errors.push(ChangeError::new(
            ChangedEntity::Annotations,
            error.id.clone(),
            error.to_string(),
        ));
    }
}

fn payload_counts(payload: &AnnotationPayload) -> ChangeCounts {
    ChangeCounts {
        annotations: 1,
        highlights: payload.highlights.len() as u64,
        notes: payload.note.is_some() as u64,
        bookmarks: payload.bookmark.is_some() as u64,
        links: payload.links.len() as u64,
        tags: payload.tags.len() as u64,
        ..ChangeCounts::default()
    }
}

/// Apply one remote change, returning what it downloaded.
async fn apply_change(
    tx: &mut StoreTransaction,
    change: AnnotationChange,
    order: &NotebookOrder,
) -> Result<ChangeCounts> {
    match change {
        AnnotationChange::New {
            annotation_id,
            timestamp,
            annotation: payload,
        } => {
            let counts = payload_counts(&payload);
            let annotation = upsert_root(tx, &annotation_id, timestamp, &payload).await?;
            replace_children(tx, annotation.id, &payload).await?;
            merge_notebooks(tx, &annotation, &payload.folders, order).await?;
            Ok(counts)
        }
        AnnotationChange::Trash { annotation_id, .. }
        | AnnotationChange::Delete { annotation_id, .. } => {
            if let Some(annotation) = tx.annotation_by_unique_id(&annotation_id).await? {
                tx.delete_annotation(annotation.id).await?;
            }
            Ok(ChangeCounts {
                annotations: 1,
                ..ChangeCounts::default()
            })
        }
    }
}

async fn upsert_root(
    tx: &mut StoreTransaction,
    unique_id: &str,
    timestamp: DateTime<Utc>,
    payload: &AnnotationPayload,
) -> Result<Annotation> {
    let existing = tx.annotation_by_unique_id(unique_id).await?;
    let annotation = Annotation {
        id: existing.as_ref().map_or(0, |a| a.id),
        unique_id: unique_id.to_string(),
        doc_id: payload.doc_id.clone(),
        doc_version: payload.doc_version,
        status: Status::Active,
        created: payload.created,
        last_modified: timestamp,
        source: payload.source.clone(),
        device: payload.device.clone(),
    };

    match existing {
        Some(_) => tx.update_annotation(&annotation).await,
        None => tx.insert_annotation(&annotation).await,
    }
}

async fn replace_children(
    tx: &mut StoreTransaction,
    annotation_id: i64,
    payload: &AnnotationPayload,
) -> Result<()> {
    match &payload.note {
        Some(note) => {
            tx.save_note(&Note::new(annotation_id, note.title.clone(), &note.content))
                .await?;
        }
        None => {
            tx.delete_note_for(annotation_id).await?;
        }
    }

    match &payload.bookmark {
        Some(bookmark) => {
            let bookmark = Bookmark {
                id: 0,
                name: bookmark.name.clone(),
                paragraph_id: bookmark.paragraph_id.clone(),
                display_order: bookmark.display_order,
                offset: bookmark.offset,
                annotation_id,
            };
            tx.save_bookmark(&bookmark).await?;
        }
        None => {
            tx.delete_bookmark_for(annotation_id).await?;
        }
    }

    tx.delete_highlights_for(annotation_id).await?;
    for highlight in &payload.highlights {
        let range = ParagraphRange {
            paragraph_id: highlight.paragraph_id.clone(),
            start: highlight.start,
            end: highlight.end,
        };
        tx.insert_highlight(&Highlight::new(
            annotation_id,
            range,
            &highlight.color,
            highlight.style,
        ))
        .await?;
    }

    tx.delete_links_for(annotation_id).await?;
    for link in &payload.links {
        tx.insert_link(&Link::new(
            annotation_id,
            &link.name,
            &link.doc_id,
            link.doc_version,
            link.paragraph_ids.clone(),
        ))
        .await?;
    }

    tx.remove_all_tags(annotation_id).await?;
    for name in &payload.tags {
        tx.add_tag(annotation_id, name).await?;
    }

    Ok(())
}

/// Bring the annotation's notebook memberships in line with `folders`.
async fn merge_notebooks(
    tx: &mut StoreTransaction,
    annotation: &Annotation,
    folders: &[String],
    order: &NotebookOrder,
) -> Result<()> {
    let mut wanted: HashMap<i64, &str> = HashMap::new();
    for folder_id in folders {
        match tx.notebook_by_unique_id(folder_id).await? {
            Some(notebook) => {
                wanted.insert(notebook.id, folder_id.as_str());
            }
            None => tracing::warn!(
                "Annotation {} refers to unknown notebook {}",
                annotation.unique_id,
                folder_id
            ),
        }
    }

    let current: HashMap<i64, i64> = tx
        .memberships_for_annotation(annotation.id)
        .await?
        .into_iter()
        .map(|m| (m.notebook_id, m.display_order))
        .collect();

    let stale: HashSet<i64> = current
        .keys()
        .filter(|id| !wanted.contains_key(id))
        .copied()
        .collect();
    for notebook_id in stale {
        tx.remove_membership(annotation.id, notebook_id).await?;
    }

    for (notebook_id, folder_id) in wanted {
        let authoritative = order.get(folder_id).and_then(|ids| {
            ids.iter()
                .position(|uid| *uid == annotation.unique_id)
                .map(|p| p as i64)
        });

        match (authoritative, current.get(&notebook_id)) {
            (Some(position), Some(existing)) if position == *existing => {}
            (Some(position), _) => {
                tx.set_membership(annotation.id, notebook_id, position).await?;
            }
            (None, Some(_)) => {}
            (None, None) => {
                tx.append_membership(annotation.id, notebook_id).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{HighlightStyle, Notebook};
    use crate::sync::wire::{HighlightPayload, NotePayload};

    async fn apply(
        repo: &Repository,
        change: AnnotationChange,
        order: &NotebookOrder,
    ) -> Result<ChangeCounts> {
        let mut tx = repo.begin(TransactionKind::Sync).await.unwrap();
        let counts = apply_change(&mut tx, change, order).await;
        tx.commit().await.unwrap();
        counts
    }

    fn highlight(paragraph: &str) -> HighlightPayload {
        HighlightPayload {
            paragraph_id: paragraph.to_string(),
            start: 0,
            end: 5,
            color: "yellow".to_string(),
            style: HighlightStyle::Highlight,
        }
    }

    fn payload() -> AnnotationPayload {
        AnnotationPayload {
            doc_id: Some("1".into()),
            doc_version: Some(1),
            created: now(),
            source: None,
            device: None,
            note: None,
            bookmark: None,
            highlights: Vec::new(),
            links: Vec::new(),
            tags: Vec::new(),
            folders: Vec::new(),
        }
    }

    fn new_change(unique_id: &str, payload: AnnotationPayload) -> AnnotationChange {
        AnnotationChange::New {
            annotation_id: unique_id.to_string(),
            timestamp: now(),
            annotation: payload,
        }
    }

    #[tokio::test]
    async fn test_highlights_are_fully_replaced() {
        let repo = Repository::open_in_memory().await.unwrap();
        let none = NotebookOrder::new();

        let mut two = payload();
        two.highlights = vec![highlight("p1"), highlight("p2")];
        apply(&repo, new_change("a-1", two), &none).await.unwrap();

        let mut one = payload();
        one.highlights = vec![highlight("p2")];
        apply(&repo, new_change("a-1", one), &none).await.unwrap();

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let annotation = tx.annotation_by_unique_id("a-1").await.unwrap().unwrap();
        let highlights = tx.highlights_for(annotation.id).await.unwrap();
        assert_eq!(highlights.len(), 1);
        assert_eq!(highlights[0].range.paragraph_id, "p2");
    }

    #[tokio::test]
    async fn test_absent_note_is_removed_and_tags_reused() {
        let repo = Repository::open_in_memory().await.unwrap();
        let none = NotebookOrder::new();

        let mut with_note = payload();
        with_note.note = Some(NotePayload {
            title: None,
            content: "text".into(),
        });
        with_note.tags = vec!["Faith".into()];
        let counts = apply(&repo, new_change("a-1", with_note), &none).await.unwrap();
        assert_eq!(counts.notes, 1);
        assert_eq!(counts.tags, 1);

        let mut without_note = payload();
        without_note.tags = vec!["faith".into()];
        apply(&repo, new_change("a-1", without_note), &none).await.unwrap();

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let annotation = tx.annotation_by_unique_id("a-1").await.unwrap().unwrap();
        assert!(tx.note_for(annotation.id).await.unwrap().is_none());
        assert_eq!(tx.all_tags().await.unwrap().len(), 1);
        assert_eq!(tx.tags_for(annotation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_uses_authoritative_order() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let notebook = tx
            .insert_notebook(&Notebook::new("Study", None).unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let order: NotebookOrder = HashMap::from([(
            notebook.unique_id.clone(),
            vec!["a-2".to_string(), "a-1".to_string()],
        )]);

        for uid in ["a-1", "a-2", "a-3"] {
            let mut p = payload();
            p.folders = vec![notebook.unique_id.clone()];
            apply(&repo, new_change(uid, p), &order).await.unwrap();
        }

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let listed = tx.notebook_order(notebook.id).await.unwrap();
        // a-3 is not in the order list and is appended after the maximum.
        assert_eq!(listed, vec!["a-2", "a-1", "a-3"]);
    }

    #[tokio::test]
    async fn test_unknown_notebook_reference_skipped() {
        let repo = Repository::open_in_memory().await.unwrap();
        let mut p = payload();
        p.folders = vec!["missing".into()];

        apply(&repo, new_change("a-1", p), &NotebookOrder::new())
            .await
            .unwrap();

        let mut tx = repo.begin(TransactionKind::Local).await.unwrap();
        let annotation = tx.annotation_by_unique_id("a-1").await.unwrap().unwrap();
        assert!(tx
            .memberships_for_annotation(annotation.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remote_delete_of_unknown_is_noop() {
        let repo = Repository::open_in_memory().await.unwrap();
        let change = AnnotationChange::Delete {
            annotation_id: "nobody".into(),
            timestamp: now(),
        };

        let counts = apply(&repo, change, &NotebookOrder::new()).await.unwrap();
        assert_eq!(counts.annotations, 1);
    }

    #[test]
    fn test_closure_provides_doc_versions() {
        let provider = |ids: &[String]| {
            ids.iter()
                .map(|id| (id.clone(), 7))
                .collect::<HashMap<String, i64>>()
        };
        let provider: Arc<dyn DocVersionProvider> = Arc::new(provider);
        let versions = provider.doc_versions(&["1".to_string()]);
        assert_eq!(versions.get("1"), Some(&7));
    }
}
