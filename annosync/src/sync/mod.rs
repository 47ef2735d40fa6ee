//! Sync module
//!
//! Bidirectional synchronization with the annotation service:
//! - Change cursor and its text encoding
//! - Typed wire model
//! - Transport abstraction and HTTP implementation
//! - Notebook and annotation engines
//! - Single-flight coordinator

pub mod annotations;
pub mod coordinator;
pub mod notebooks;
pub mod summary;
pub mod token;
pub mod transport;
pub mod wire;

pub use annotations::{
    AnnotationFailure, AnnotationSyncEngine, DocVersionProvider, NoDocVersions,
};
pub use coordinator::{SyncCoordinator, SyncReport, SyncStatus};
pub use notebooks::{NotebookOrder, NotebookSyncEngine};
pub use summary::{ChangeCounts, ChangeError, SyncSummary};
pub use token::SyncToken;
pub use transport::{Endpoint, HttpTransport, SyncTransport};
