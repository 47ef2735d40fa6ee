//! Round change summary
//!
//! Per-kind counters and the remote records that could not be applied.
//! Counters are observability data only.

use crate::database::ChangedEntity;
use serde::Serialize;
use std::fmt;
use std::ops::AddAssign;

/// Number of records per entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub notebooks: u64,
    pub annotations: u64,
    pub highlights: u64,
    pub notes: u64,
    pub bookmarks: u64,
    pub links: u64,
    pub tags: u64,
}

impl ChangeCounts {
    pub fn total(&self) -> u64 {
        self.notebooks
            + self.annotations
            + self.highlights
            + self.notes
            + self.bookmarks
            + self.links
            + self.tags
    }
}

impl AddAssign for ChangeCounts {
    fn add_assign(&mut self, other: Self) {
        self.notebooks += other.notebooks;
        self.annotations += other.annotations;
        self.highlights += other.highlights;
        self.notes += other.notes;
        self.bookmarks += other.bookmarks;
        self.links += other.links;
        self.tags += other.tags;
    }
}

impl fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notebooks, {} annotations ({} highlights, {} notes, {} bookmarks, {} links, {} tags)",
            self.notebooks,
            self.annotations,
            self.highlights,
            self.notes,
            self.bookmarks,
            self.links,
            self.tags
        )
    }
}

/// A remote record that was skipped or rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeError {
    pub entity: ChangedEntity,
    /// Unique id of the record, when it could be read
    pub unique_id: Option<String>,
    pub message: String,
}

impl ChangeError {
    pub fn new(entity: ChangedEntity, unique_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            entity,
            unique_id,
            message: message.into(),
        }
    }
}

impl fmt::Display for ChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity = match self.entity {
            ChangedEntity::Annotations => "annotation",
            ChangedEntity::Notebooks => "notebook",
        };
        match &self.unique_id {
            Some(id) => write!(f, "{} {}: {}", entity, id, self.message),
            None => write!(f, "{}: {}", entity, self.message),
        }
    }
}

/// What one round moved in each direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub uploaded: ChangeCounts,
    pub downloaded: ChangeCounts,
    pub errors: Vec<ChangeError>,
}

impl SyncSummary {
    pub fn merge(&mut self, other: SyncSummary) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded.total() == 0 && self.downloaded.total() == 0 && self.errors.is_empty()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uploaded {}; downloaded {}",
            self.uploaded, self.downloaded
        )?;
        if !self.errors.is_empty() {
            write!(f, "; {} changes skipped", self.errors.len())?;
        }
        Ok(())
    }
}
