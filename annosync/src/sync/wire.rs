//! Wire model for the annotation service
//!
//! Change records are tagged by `changeType`. A `new` record carries the
//! full entity payload, `trash` and `delete` carry only the id and
//! timestamp. Responses are parsed in two stages: the envelope first,
//! then each change record on its own so that one malformed record does
//! not sink the rest.

use crate::database::{AnnotationDetail, HighlightStyle, Notebook, Status};
use crate::error::{AppError, ServiceError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notebook fields sent with a `new` folder change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unique ids of the notebook's annotations in display order
    #[serde(default)]
    pub annotation_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "changeType", rename_all = "lowercase")]
pub enum FolderChange {
    New {
        #[serde(rename = "folderId")]
        folder_id: String,
        timestamp: DateTime<Utc>,
        folder: FolderPayload,
    },
    Trash {
        #[serde(rename = "folderId")]
        folder_id: String,
        timestamp: DateTime<Utc>,
    },
    Delete {
        #[serde(rename = "folderId")]
        folder_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl FolderChange {
    /// Change record describing a local notebook.
    pub fn from_local(notebook: &Notebook, annotation_ids: Vec<String>) -> Self {
        let folder_id = notebook.unique_id.clone();
        let timestamp = notebook.last_modified;
        match notebook.status {
            Status::Active => FolderChange::New {
                folder_id,
                timestamp,
                folder: FolderPayload {
                    name: notebook.name.clone(),
                    description: notebook.description.clone(),
                    annotation_ids,
                },
            },
            Status::Trashed => FolderChange::Trash {
                folder_id,
                timestamp,
            },
            Status::Deleted => FolderChange::Delete {
                folder_id,
                timestamp,
            },
        }
    }

    pub fn folder_id(&self) -> &str {
        match self {
            FolderChange::New { folder_id, .. }
            | FolderChange::Trash { folder_id, .. }
            | FolderChange::Delete { folder_id, .. } => folder_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightPayload {
    pub paragraph_id: String,
    pub start: i64,
    pub end: i64,
    pub color: String,
    #[serde(default)]
    pub style: HighlightStyle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPayload {
    pub name: String,
    pub doc_id: String,
    pub doc_version: i64,
    #[serde(default)]
    pub paragraph_ids: Vec<String>,
}

/// Full annotation document sent with a `new` annotation change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_version: Option<i64>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<NotePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<BookmarkPayload>,
    #[serde(default)]
    pub highlights: Vec<HighlightPayload>,
    #[serde(default)]
    pub links: Vec<LinkPayload>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unique ids of the notebooks the annotation belongs to
    #[serde(default)]
    pub folders: Vec<String>,
}

impl AnnotationPayload {
    pub fn from_detail(detail: &AnnotationDetail) -> Self {
        let annotation = &detail.annotation;
        Self {
            doc_id: annotation.doc_id.clone(),
            doc_version: annotation.doc_version,
            created: annotation.created,
            source: annotation.source.clone(),
            device: annotation.device.clone(),
            note: detail.note.as_ref().map(|note| NotePayload {
                title: note.title.clone(),
                content: note.content.clone(),
            }),
            bookmark: detail.bookmark.as_ref().map(|bookmark| BookmarkPayload {
                name: bookmark.name.clone(),
                paragraph_id: bookmark.paragraph_id.clone(),
                display_order: bookmark.display_order,
                offset: bookmark.offset,
            }),
            highlights: detail
                .highlights
                .iter()
                .map(|h| HighlightPayload {
                    paragraph_id: h.range.paragraph_id.clone(),
                    start: h.range.start,
                    end: h.range.end,
                    color: h.color_name.clone(),
                    style: h.style,
                })
                .collect(),
            links: detail
                .links
                .iter()
                .map(|l| LinkPayload {
                    name: l.name.clone(),
                    doc_id: l.dest_doc_id.clone(),
                    doc_version: l.dest_doc_version,
                    paragraph_ids: l.dest_paragraph_ids.clone(),
                })
                .collect(),
            tags: detail.tags.iter().map(|t| t.name.clone()).collect(),
            folders: detail
                .notebooks
                .iter()
                .map(|(unique_id, _)| unique_id.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "changeType", rename_all = "lowercase")]
pub enum AnnotationChange {
    New {
        #[serde(rename = "annotationId")]
        annotation_id: String,
        timestamp: DateTime<Utc>,
        annotation: AnnotationPayload,
    },
    Trash {
        #[serde(rename = "annotationId")]
        annotation_id: String,
        timestamp: DateTime<Utc>,
    },
    Delete {
        #[serde(rename = "annotationId")]
        annotation_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl AnnotationChange {
    /// Change record describing a local annotation and its children.
    pub fn from_local(detail: &AnnotationDetail) -> Self {
        let annotation_id = detail.annotation.unique_id.clone();
        let timestamp = detail.annotation.last_modified;
        match detail.annotation.status {
            Status::Active => AnnotationChange::New {
                annotation_id,
                timestamp,
                annotation: AnnotationPayload::from_detail(detail),
            },
            Status::Trashed => AnnotationChange::Trash {
                annotation_id,
                timestamp,
            },
            Status::Deleted => AnnotationChange::Delete {
                annotation_id,
                timestamp,
            },
        }
    }

    pub fn annotation_id(&self) -> &str {
        match self {
            AnnotationChange::New { annotation_id, .. }
            | AnnotationChange::Trash { annotation_id, .. }
            | AnnotationChange::Delete { annotation_id, .. } => annotation_id,
        }
    }
}

/// Annotation the service reports as changed, from the id probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncId {
    pub annotation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Local version of the document, attached for the full fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_version: Option<i64>,
}

/// Request envelope shared by every sync call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest<C> {
    pub since: DateTime<Utc>,
    pub client_time: DateTime<Utc>,
    #[serde(default = "Vec::new", skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<C>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_ids: Option<Vec<SyncId>>,
}

impl<C> SyncRequest<C> {
    pub fn new(since: DateTime<Utc>, client_time: DateTime<Utc>) -> Self {
        Self {
            since,
            client_time,
            changes: Vec::new(),
            sync_status: None,
            sync_ids: None,
        }
    }
}

/// Response envelope. Change records stay raw until parsed one by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub before: DateTime<Utc>,
    #[serde(default)]
    pub changes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_ids: Option<Vec<SyncId>>,
    #[serde(default)]
    pub errors: Vec<ServiceError>,
}

/// Parse one raw change record.
///
/// On failure the error carries whatever id could be read from the
/// record under `id_key`.
pub fn parse_change<C: DeserializeOwned>(
    raw: Value,
    id_key: &str,
) -> std::result::Result<C, (Option<String>, AppError)> {
    let id = raw.get(id_key).and_then(Value::as_str).map(str::to_string);
    serde_json::from_value(raw).map_err(|e| (id, AppError::Deserialization(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trash_change_has_no_payload() {
        let change = FolderChange::Trash {
            folder_id: "f-1".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };

        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(
            value,
            json!({
                "changeType": "trash",
                "folderId": "f-1",
                "timestamp": "2023-11-14T22:13:20Z"
            })
        );
    }

    #[test]
    fn test_new_annotation_requires_payload() {
        let raw = json!({
            "changeType": "new",
            "annotationId": "a-1",
            "timestamp": "2023-11-14T22:13:20Z"
        });

        let err = parse_change::<AnnotationChange>(raw, "annotationId").unwrap_err();
        assert_eq!(err.0.as_deref(), Some("a-1"));
        assert!(matches!(err.1, AppError::Deserialization(_)));
        assert!(err.1.to_string().starts_with("Malformed remote change"));
    }

    #[test]
    fn test_unknown_change_type_rejected() {
        let raw = json!({
            "changeType": "archive",
            "folderId": "f-2",
            "timestamp": "2023-11-14T22:13:20Z"
        });

        assert!(parse_change::<FolderChange>(raw, "folderId").is_err());
    }

    #[test]
    fn test_annotation_payload_defaults() {
        let raw = json!({
            "changeType": "new",
            "annotationId": "a-1",
            "timestamp": "2023-11-14T22:13:20Z",
            "annotation": {
                "docId": "1",
                "docVersion": 1,
                "created": "2023-11-14T22:13:20Z",
                "highlights": [
                    {"paragraphId": "p1", "start": 0, "end": 5, "color": "yellow"}
                ]
            }
        });

        let change: AnnotationChange = parse_change(raw, "annotationId").unwrap();
        let AnnotationChange::New { annotation, .. } = change else {
            panic!("expected a new change");
        };
        assert_eq!(annotation.highlights.len(), 1);
        assert_eq!(annotation.highlights[0].style, HighlightStyle::Highlight);
        assert!(annotation.note.is_none());
        assert!(annotation.tags.is_empty());
    }

    #[test]
    fn test_first_sync_request_shape() {
        let mut request: SyncRequest<FolderChange> = SyncRequest::new(
            DateTime::UNIX_EPOCH,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        request.sync_status = Some("notdeleted".into());

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "since": "1970-01-01T00:00:00Z",
                "clientTime": "2023-11-14T22:13:20Z",
                "syncStatus": "notdeleted"
            })
        );
    }
}
