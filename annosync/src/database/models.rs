//! Database models
//!
//! Immutable value structs for the seven entity kinds and two junctions.
//! Updates follow copy-then-save: clone the value, change it with one of
//! the `with_*` helpers and hand it back to the repository.
//!
//! Timestamps are persisted as Unix epoch milliseconds, so every
//! timestamp created here is truncated to millisecond precision.

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current time truncated to the precision the store persists.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| sqlx::Error::Decode(format!("timestamp out of range: {}", ms).into()))
}

fn new_unique_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle status shared by annotations and notebooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Trashed,
    Deleted,
}

impl Status {
    /// Persisted form: active is stored as an empty string.
    pub fn as_db_str(self) -> &'static str {
        match self {
            Status::Active => "",
            Status::Trashed => "trashed",
            Status::Deleted => "deleted",
        }
    }

    pub fn is_active(self) -> bool {
        self == Status::Active
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "active" => Ok(Status::Active),
            "trashed" => Ok(Status::Trashed),
            "deleted" => Ok(Status::Deleted),
            other => Err(format!("unknown status: {:?}", other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Active => "active",
            Status::Trashed => "trashed",
            Status::Deleted => "deleted",
        })
    }
}

fn status_column(row: &SqliteRow) -> std::result::Result<Status, sqlx::Error> {
    let raw: String = row.try_get("status")?;
    raw.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))
}

/// Root entity: a user's mark against a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Store-local identity, never transmitted. Zero until inserted.
    pub id: i64,
    pub unique_id: String,
    pub doc_id: Option<String>,
    pub doc_version: Option<i64>,
    pub status: Status,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub source: Option<String>,
    pub device: Option<String>,
}

impl Annotation {
    /// A fresh, unsaved annotation with a new unique id
    pub fn new(doc_id: Option<String>, doc_version: Option<i64>) -> Self {
        let ts = now();
        Self {
            id: 0,
            unique_id: new_unique_id(),
            doc_id,
            doc_version,
            status: Status::Active,
            created: ts,
            last_modified: ts,
            source: None,
            device: None,
        }
    }

    pub fn with_status(&self, status: Status, last_modified: DateTime<Utc>) -> Self {
        Self {
            status,
            last_modified,
            ..self.clone()
        }
    }

    pub fn touched(&self, last_modified: DateTime<Utc>) -> Self {
        Self {
            last_modified,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.unique_id.trim().is_empty() {
            return Err(AppError::Validation("annotation unique id is empty".into()));
        }
        if matches!(&self.doc_id, Some(doc) if doc.trim().is_empty()) {
            return Err(AppError::Validation("annotation doc id is empty".into()));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Annotation {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            unique_id: row.try_get("unique_id")?,
            doc_id: row.try_get("doc_id")?,
            doc_version: row.try_get("doc_version")?,
            status: status_column(row)?,
            created: from_millis(row.try_get("created")?)?,
            last_modified: from_millis(row.try_get("last_modified")?)?,
            source: row.try_get("source")?,
            device: row.try_get("device")?,
        })
    }
}

/// Independent root owning an ordered set of annotations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: i64,
    pub unique_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: Status,
    pub last_modified: DateTime<Utc>,
}

impl Notebook {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Result<Self> {
        let notebook = Self {
            id: 0,
            unique_id: new_unique_id(),
            name: name.into(),
            description,
            status: Status::Active,
            last_modified: now(),
        };
        notebook.validate()?;
        Ok(notebook)
    }

    pub fn with_status(&self, status: Status, last_modified: DateTime<Utc>) -> Self {
        Self {
            status,
            last_modified,
            ..self.clone()
        }
    }

    pub fn touched(&self, last_modified: DateTime<Utc>) -> Self {
        Self {
            last_modified,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.unique_id.trim().is_empty() {
            return Err(AppError::Validation("notebook unique id is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("notebook name is empty".into()));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Notebook {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            unique_id: row.try_get("unique_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: status_column(row)?,
            last_modified: from_millis(row.try_get("last_modified")?)?,
        })
    }
}

/// Span of words within a single paragraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParagraphRange {
    pub paragraph_id: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightStyle {
    #[default]
    Highlight,
    Underline,
    Clear,
}

impl HighlightStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            HighlightStyle::Highlight => "highlight",
            HighlightStyle::Underline => "underline",
            HighlightStyle::Clear => "clear",
        }
    }
}

impl FromStr for HighlightStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "highlight" => Ok(HighlightStyle::Highlight),
            "underline" => Ok(HighlightStyle::Underline),
            "clear" => Ok(HighlightStyle::Clear),
            other => Err(format!("unknown highlight style: {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: i64,
    pub range: ParagraphRange,
    pub color_name: String,
    pub style: HighlightStyle,
    pub annotation_id: i64,
}

impl Highlight {
    pub fn new(
        annotation_id: i64,
        range: ParagraphRange,
        color_name: impl Into<String>,
        style: HighlightStyle,
    ) -> Self {
        Self {
            id: 0,
            range,
            color_name: color_name.into(),
            style,
            annotation_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.annotation_id == 0 {
            return Err(AppError::Validation("highlight has no annotation".into()));
        }
        if self.range.paragraph_id.trim().is_empty() {
            return Err(AppError::Validation("highlight paragraph id is empty".into()));
        }
        if self.range.start > self.range.end {
            return Err(AppError::Validation(format!(
                "highlight range is inverted: {}..{}",
                self.range.start, self.range.end
            )));
        }
        if self.color_name.trim().is_empty() {
            return Err(AppError::Validation("highlight color is empty".into()));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Highlight {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let style: String = row.try_get("style")?;
        Ok(Self {
            id: row.try_get("id")?,
            range: ParagraphRange {
                paragraph_id: row.try_get("paragraph_id")?,
                start: row.try_get("offset_start")?,
                end: row.try_get("offset_end")?,
            },
            color_name: row.try_get("color_name")?,
            style: style.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            annotation_id: row.try_get("annotation_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Note {
    pub id: i64,
    pub title: Option<String>,
    pub content: String,
    pub annotation_id: i64,
}

impl Note {
    pub fn new(annotation_id: i64, title: Option<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            title,
            content: content.into(),
            annotation_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.annotation_id == 0 {
            return Err(AppError::Validation("note has no annotation".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: i64,
    pub name: Option<String>,
    pub paragraph_id: Option<String>,
    pub display_order: Option<i64>,
    pub offset: i64,
    pub annotation_id: i64,
}

impl Bookmark {
    pub fn new(annotation_id: i64, name: Option<String>, paragraph_id: Option<String>) -> Self {
        Self {
            id: 0,
            name,
            paragraph_id,
            display_order: None,
            offset: 0,
            annotation_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.annotation_id == 0 {
            return Err(AppError::Validation("bookmark has no annotation".into()));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Bookmark {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            paragraph_id: row.try_get("paragraph_id")?,
            display_order: row.try_get("display_order")?,
            offset: row.try_get("word_offset")?,
            annotation_id: row.try_get("annotation_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub name: String,
    pub dest_doc_id: String,
    pub dest_doc_version: i64,
    pub dest_paragraph_ids: Vec<String>,
    pub annotation_id: i64,
}

impl Link {
    pub fn new(
        annotation_id: i64,
        name: impl Into<String>,
        dest_doc_id: impl Into<String>,
        dest_doc_version: i64,
        dest_paragraph_ids: Vec<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            dest_doc_id: dest_doc_id.into(),
            dest_doc_version,
            dest_paragraph_ids,
            annotation_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.annotation_id == 0 {
            return Err(AppError::Validation("link has no annotation".into()));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("link name is empty".into()));
        }
        if self.dest_doc_id.trim().is_empty() {
            return Err(AppError::Validation("link destination is empty".into()));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Link {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let paragraphs: String = row.try_get("dest_paragraph_ids")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            dest_doc_id: row.try_get("dest_doc_id")?,
            dest_doc_version: row.try_get("dest_doc_version")?,
            dest_paragraph_ids: serde_json::from_str(&paragraphs)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            annotation_id: row.try_get("annotation_id")?,
        })
    }
}

/// Tag names are unique without regard to case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

impl Tag {
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("tag name is empty".into()));
        }
        Ok(())
    }
}

/// Ordered membership of an annotation in a notebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AnnotationNotebook {
    pub annotation_id: i64,
    pub notebook_id: i64,
    pub display_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AnnotationTag {
    pub annotation_id: i64,
    pub tag_id: i64,
}

/// An annotation with every child assembled from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationDetail {
    pub annotation: Annotation,
    pub note: Option<Note>,
    pub bookmark: Option<Bookmark>,
    pub highlights: Vec<Highlight>,
    pub links: Vec<Link>,
    pub tags: Vec<Tag>,
    /// Notebook memberships as (notebook unique id, display order)
    pub notebooks: Vec<(String, i64)>,
}

impl AnnotationDetail {
    /// Whether any child that keeps an annotation alive is present.
    pub fn has_children(&self) -> bool {
        self.note.is_some()
            || self.bookmark.is_some()
            || !self.highlights.is_empty()
            || !self.links.is_empty()
            || !self.tags.is_empty()
    }
}
