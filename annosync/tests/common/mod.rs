//! In-memory annotation service for integration tests
//!
//! Behaves like the real service as far as the sync engines can tell:
//! - a server clock that ticks one second per request
//! - uploads are stored under the tick of the request that carried them
//!   and are not echoed back in that request's response
//! - an upload older than the stored record is ignored
//! - trash/delete uploads are kept as tombstones, hidden from clients
//!   that send the `notdeleted` hint
//! - the annotation endpoint answers an id probe or a full fetch

#![allow(dead_code)]

use annosync::database::{AnnotationDetail, Repository, Status};
use annosync::error::{AppError, Result};
use annosync::services::{AnnotationsService, NotebooksService};
use annosync::sync::wire::{
    AnnotationChange, FolderChange, SyncId, SyncRequest, SyncResponse,
};
use annosync::sync::{
    DocVersionProvider, Endpoint, NoDocVersions, SyncCoordinator, SyncReport, SyncTransport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Sleep into the next wall-clock second.
///
/// Upload windows end at a whole second, so edits only become visible to
/// a round that starts in a later second.
pub async fn next_second() {
    let millis = Utc::now().timestamp_subsec_millis() as u64;
    tokio::time::sleep(Duration::from_millis(1_000u64.saturating_sub(millis) + 5)).await;
}

const CLOCK_START: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
struct Record {
    /// Server tick at which the record was stored
    stamp: i64,
    /// Client timestamp carried by the change
    timestamp: DateTime<Utc>,
    doc_id: Option<String>,
    tombstone: bool,
    change: Value,
}

#[derive(Debug, Default)]
struct ServerState {
    clock: i64,
    folders: BTreeMap<String, Record>,
    annotations: BTreeMap<String, Record>,
    last_sync_ids: Vec<SyncId>,
}

impl ServerState {
    fn tick(&mut self) -> i64 {
        self.clock = if self.clock == 0 { CLOCK_START } else { self.clock + 1 };
        self.clock
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

fn store(records: &mut BTreeMap<String, Record>, id: &str, record: Record) {
    match records.get(id) {
        Some(existing) if existing.timestamp >= record.timestamp => {}
        _ => {
            records.insert(id.to_string(), record);
        }
    }
}

fn visible(record: &Record, since: i64, tick: i64, hide_tombstones: bool) -> bool {
    record.stamp > since && record.stamp < tick && !(hide_tombstones && record.tombstone)
}

/// Fake annotation service
#[derive(Default)]
pub struct FakeService {
    state: Mutex<ServerState>,
    notebook_requests: AtomicUsize,
    annotation_requests: AtomicUsize,
    fail_annotations: AtomicBool,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    gate_sender: Mutex<Option<watch::Sender<bool>>>,
    /// Signalled when a request arrives
    pub arrived: Notify,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notebook_requests(&self) -> usize {
        self.notebook_requests.load(Ordering::SeqCst)
    }

    pub fn annotation_requests(&self) -> usize {
        self.annotation_requests.load(Ordering::SeqCst)
    }

    pub fn set_fail_annotations(&self, fail: bool) {
        self.fail_annotations.store(fail, Ordering::SeqCst);
    }

    /// Hold every request until [`FakeService::release`] is called.
    pub fn hold(&self) {
        let (sender, receiver) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(receiver);
        *self.gate_sender.lock().unwrap() = Some(sender);
    }

    pub fn release(&self) {
        self.gate.lock().unwrap().take();
        if let Some(sender) = self.gate_sender.lock().unwrap().take() {
            sender.send_replace(true);
        }
    }

    /// Sync ids sent with the most recent full fetch
    pub fn last_sync_ids(&self) -> Vec<SyncId> {
        self.state.lock().unwrap().last_sync_ids.clone()
    }

    /// Store a raw annotation change as if another client had uploaded it.
    pub fn inject_annotation(&self, annotation_id: &str, doc_id: Option<&str>, change: Value) {
        let mut state = self.state.lock().unwrap();
        let stamp = state.tick();
        state.annotations.insert(
            annotation_id.to_string(),
            Record {
                stamp,
                timestamp: at(stamp),
                doc_id: doc_id.map(str::to_string),
                tombstone: false,
                change,
            },
        );
    }

    fn notebooks(&self, request: SyncRequest<FolderChange>) -> Value {
        let mut state = self.state.lock().unwrap();
        let tick = state.tick();

        for change in &request.changes {
            let (timestamp, tombstone) = match change {
                FolderChange::New { timestamp, .. } => (*timestamp, false),
                FolderChange::Trash { timestamp, .. } | FolderChange::Delete { timestamp, .. } => {
                    (*timestamp, true)
                }
            };
            let record = Record {
                stamp: tick,
                timestamp,
                doc_id: None,
                tombstone,
                change: serde_json::to_value(change).unwrap(),
            };
            store(&mut state.folders, change.folder_id(), record);
        }

        let since = request.since.timestamp();
        let hide = request.sync_status.is_some();
        let changes = state
            .folders
            .values()
            .filter(|r| visible(r, since, tick, hide))
            .map(|r| r.change.clone())
            .collect();

        serde_json::to_value(SyncResponse {
            before: at(tick),
            changes,
            sync_ids: None,
            errors: Vec::new(),
        })
        .unwrap()
    }

    fn annotations(&self, request: SyncRequest<AnnotationChange>) -> Value {
        let mut state = self.state.lock().unwrap();
        let tick = state.tick();

        if let Some(sync_ids) = request.sync_ids {
            let changes = sync_ids
                .iter()
                .filter_map(|id| state.annotations.get(&id.annotation_id))
                .map(|r| r.change.clone())
                .collect();
            state.last_sync_ids = sync_ids;

            return serde_json::to_value(SyncResponse {
                before: at(tick),
                changes,
                sync_ids: None,
                errors: Vec::new(),
            })
            .unwrap();
        }

        for change in &request.changes {
            let (timestamp, tombstone, doc_id) = match change {
                AnnotationChange::New {
                    timestamp,
                    annotation,
                    ..
                } => (*timestamp, false, annotation.doc_id.clone()),
                AnnotationChange::Trash { timestamp, .. }
                | AnnotationChange::Delete { timestamp, .. } => (*timestamp, true, None),
            };
            let record = Record {
                stamp: tick,
                timestamp,
                doc_id,
                tombstone,
                change: serde_json::to_value(change).unwrap(),
            };
            store(&mut state.annotations, change.annotation_id(), record);
        }

        let since = request.since.timestamp();
        let hide = request.sync_status.is_some();
        let sync_ids = state
            .annotations
            .iter()
            .filter(|(_, r)| visible(r, since, tick, hide))
            .map(|(id, r)| SyncId {
                annotation_id: id.clone(),
                doc_id: r.doc_id.clone(),
                doc_version: None,
            })
            .collect();

        serde_json::to_value(SyncResponse {
            before: at(tick),
            changes: Vec::new(),
            sync_ids: Some(sync_ids),
            errors: Vec::new(),
        })
        .unwrap()
    }
}

#[async_trait]
impl SyncTransport for FakeService {
    async fn put(&self, endpoint: Endpoint, payload: Value) -> Result<Value> {
        match endpoint {
            Endpoint::Notebooks => self.notebook_requests.fetch_add(1, Ordering::SeqCst),
            Endpoint::Annotations => self.annotation_requests.fetch_add(1, Ordering::SeqCst),
        };
        self.arrived.notify_one();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        match endpoint {
            Endpoint::Notebooks => Ok(self.notebooks(serde_json::from_value(payload)?)),
            Endpoint::Annotations => {
                if self.fail_annotations.load(Ordering::SeqCst) {
                    return Err(AppError::Service {
                        status: 503,
                        errors: Vec::new(),
                    });
                }
                Ok(self.annotations(serde_json::from_value(payload)?))
            }
        }
    }
}

/// A client store with its services and a coordinator talking to a
/// fake service
pub struct Client {
    pub repo: Repository,
    pub annotations: AnnotationsService,
    pub notebooks: NotebooksService,
    pub coordinator: SyncCoordinator,
}

impl Client {
    pub async fn new(service: &Arc<FakeService>) -> Self {
        let repo = Repository::open_in_memory().await.unwrap();
        Self::with_repo(service, repo, Arc::new(NoDocVersions))
    }

    pub fn with_repo(
        service: &Arc<FakeService>,
        repo: Repository,
        doc_versions: Arc<dyn DocVersionProvider>,
    ) -> Self {
        let coordinator =
            SyncCoordinator::new(repo.clone(), service.clone(), doc_versions, Duration::ZERO);
        Self {
            annotations: AnnotationsService::new(repo.clone()),
            notebooks: NotebooksService::new(repo.clone()),
            repo,
            coordinator,
        }
    }

    /// Run one round from the persisted cursor and require success.
    pub async fn sync(&self) -> SyncReport {
        let report = self.coordinator.sync_persisted().await.unwrap();
        assert!(report.is_success(), "sync failed: {:?}", report.error());
        report
    }

    /// Active annotations with every child, keyed by unique id
    pub async fn details(&self) -> BTreeMap<String, AnnotationDetail> {
        let mut details = BTreeMap::new();
        for annotation in self.annotations.list_annotations(Status::Active).await.unwrap() {
            let detail = self.annotations.get_annotation(annotation.id).await.unwrap();
            details.insert(annotation.unique_id, detail);
        }
        details
    }

    /// Unique ids of a notebook's annotations in display order
    pub async fn notebook_order(&self, notebook_uid: &str) -> Vec<String> {
        let notebook = self
            .notebooks
            .list_notebooks(Status::Active)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.unique_id == notebook_uid)
            .expect("notebook not found");
        self.notebooks
            .annotations(notebook.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.unique_id)
            .collect()
    }
}
