//! Change cursor
//!
//! Four independent timestamps, one per stream and direction. Each marks
//! the point up to which that stream has been reconciled. Values are kept
//! at whole-second precision because that is what the text encoding
//! carries.

use crate::config::TOKEN_FORMAT_VERSION;
use chrono::{DateTime, Utc};

/// Resumable sync cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken {
    pub local_notebooks: DateTime<Utc>,
    pub server_notebooks: DateTime<Utc>,
    pub local_annotations: DateTime<Utc>,
    pub server_annotations: DateTime<Utc>,
}

impl Default for SyncToken {
    /// The zero cursor: nothing has been reconciled yet.
    fn default() -> Self {
        Self {
            local_notebooks: DateTime::UNIX_EPOCH,
            server_notebooks: DateTime::UNIX_EPOCH,
            local_annotations: DateTime::UNIX_EPOCH,
            server_annotations: DateTime::UNIX_EPOCH,
        }
    }
}

/// Drop the sub-second part of a timestamp.
pub fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

impl SyncToken {
    pub fn new(
        local_notebooks: DateTime<Utc>,
        server_notebooks: DateTime<Utc>,
        local_annotations: DateTime<Utc>,
        server_annotations: DateTime<Utc>,
    ) -> Self {
        Self {
            local_notebooks: whole_seconds(local_notebooks),
            server_notebooks: whole_seconds(server_notebooks),
            local_annotations: whole_seconds(local_annotations),
            server_annotations: whole_seconds(server_annotations),
        }
    }

    /// Copy with the notebook stream advanced.
    pub fn with_notebooks(&self, local: DateTime<Utc>, server: DateTime<Utc>) -> Self {
        Self {
            local_notebooks: whole_seconds(local),
            server_notebooks: whole_seconds(server),
            ..*self
        }
    }

    /// Copy with the annotation stream advanced.
    pub fn with_annotations(&self, local: DateTime<Utc>, server: DateTime<Utc>) -> Self {
        Self {
            local_annotations: whole_seconds(local),
            server_annotations: whole_seconds(server),
            ..*self
        }
    }

    /// Most recent local reconciliation, for staleness display only.
    pub fn last_local_sync_date(&self) -> DateTime<Utc> {
        self.local_notebooks.max(self.local_annotations)
    }

    /// Whether the notebook stream has never been downloaded.
    pub fn is_first_notebook_sync(&self) -> bool {
        self.server_notebooks == DateTime::UNIX_EPOCH
    }

    /// Whether the annotation stream has never been downloaded.
    pub fn is_first_annotation_sync(&self) -> bool {
        self.server_annotations == DateTime::UNIX_EPOCH
    }

    /// `"<version>:<localNotebooks>:<serverNotebooks>:<localAnnotations>:<serverAnnotations>"`
    /// in Unix epoch seconds.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            TOKEN_FORMAT_VERSION,
            self.local_notebooks.timestamp(),
            self.server_notebooks.timestamp(),
            self.local_annotations.timestamp(),
            self.server_annotations.timestamp()
        )
    }

    /// Parse an encoded cursor. Any malformed segment yields `None`.
    pub fn decode(text: &str) -> Option<Self> {
        let mut parts = text.trim().split(':');
        if parts.next()? != TOKEN_FORMAT_VERSION {
            return None;
        }

        let mut stamps = [DateTime::<Utc>::UNIX_EPOCH; 4];
        for slot in stamps.iter_mut() {
            let seconds: i64 = parts.next()?.parse().ok()?;
            *slot = DateTime::from_timestamp(seconds, 0)?;
        }
        if parts.next().is_some() {
            return None;
        }

        let [local_notebooks, server_notebooks, local_annotations, server_annotations] = stamps;
        Some(Self {
            local_notebooks,
            server_notebooks,
            local_annotations,
            server_annotations,
        })
    }
}
