//! Sync coordinator
//!
//! Runs rounds one at a time: notebooks first, then annotations with the
//! notebook order produced by the same round. Requests that arrive while
//! a round is in flight collapse into a single follow-up round. Callers
//! get their report as soon as the round finishes; the grace period the
//! service asks for is observed afterwards, before the next round may
//! start.

use super::annotations::{AnnotationSyncEngine, DocVersionProvider};
use super::notebooks::NotebookSyncEngine;
use super::summary::SyncSummary;
use super::token::SyncToken;
use super::transport::SyncTransport;
use crate::database::Repository;
use crate::error::{AppError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Coordinator state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    InProgress,
    Successful,
    Failed,
}

/// Outcome of one round
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Cursor after the round. Only phases that succeeded advanced it.
    pub token: SyncToken,
    pub summary: SyncSummary,
    /// Failure of the notebook phase. The annotation phase did not run.
    pub notebook_error: Option<Arc<AppError>>,
    pub annotation_error: Option<Arc<AppError>>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.notebook_error.is_none() && self.annotation_error.is_none()
    }

    /// First error of the round, if any.
    pub fn error(&self) -> Option<&AppError> {
        self.notebook_error
            .as_deref()
            .or(self.annotation_error.as_deref())
    }
}

/// Request waiting for the round in flight to finish
struct Pending {
    token: SyncToken,
    waiters: Vec<oneshot::Sender<SyncReport>>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    pending: Option<Pending>,
}

struct Inner {
    repo: Repository,
    notebooks: NotebookSyncEngine,
    annotations: AnnotationSyncEngine,
    grace_period: Duration,
    state: Mutex<RunState>,
    status: watch::Sender<SyncStatus>,
    rounds: AtomicU64,
}

/// Single-flight sync coordinator
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        repo: Repository,
        transport: Arc<dyn SyncTransport>,
        doc_versions: Arc<dyn DocVersionProvider>,
        grace_period: Duration,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let inner = Inner {
            notebooks: NotebookSyncEngine::new(repo.clone(), transport.clone()),
            annotations: AnnotationSyncEngine::new(repo.clone(), transport, doc_versions),
            repo,
            grace_period,
            state: Mutex::new(RunState::default()),
            status,
            rounds: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Observe state transitions
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    /// Rounds run since the coordinator was created
    pub fn rounds_completed(&self) -> u64 {
        self.inner.rounds.load(Ordering::SeqCst)
    }

    /// Ask for a round starting at `token`.
    ///
    /// If a round is already in flight the request is queued; every
    /// request queued during one round is served by the same follow-up
    /// round. The receiver resolves when the serving round finishes.
    pub fn request_sync(&self, token: SyncToken) -> oneshot::Receiver<SyncReport> {
        let (sender, receiver) = oneshot::channel();

        let mut state = self.inner.lock_state();
        if state.running {
            match &mut state.pending {
                Some(pending) => {
                    pending.token = token;
                    pending.waiters.push(sender);
                }
                None => {
                    state.pending = Some(Pending {
                        token,
                        waiters: vec![sender],
                    });
                }
            }
            tracing::debug!("Sync already running, request queued");
            return receiver;
        }

        state.running = true;
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut guard = RunGuard {
                inner: inner.clone(),
                finished: false,
            };
            inner.drive(token, vec![sender]).await;
            guard.finished = true;
        });

        receiver
    }

    /// Run (or join) a round starting at `token` and wait for its report.
    pub async fn sync(&self, token: SyncToken) -> Result<SyncReport> {
        self.request_sync(token)
            .await
            .map_err(|_| AppError::Generic("sync task ended without a report".into()))
    }

    /// Run a round from the persisted cursor.
    pub async fn sync_persisted(&self) -> Result<SyncReport> {
        let token = self.inner.repo.load_sync_token().await?;
        self.sync(token).await
    }
}

/// Clears the run state if the driving task unwinds, so later requests
/// can start a round again.
struct RunGuard {
    inner: Arc<Inner>,
    finished: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        tracing::error!("Sync task ended without finishing its round");
        let mut state = self.inner.lock_state();
        state.running = false;
        // Queued callers see their channel close
        state.pending = None;
        self.inner.status.send_replace(SyncStatus::Idle);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        // The state is plain data, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drive(
        self: Arc<Self>,
        mut token: SyncToken,
        mut waiters: Vec<oneshot::Sender<SyncReport>>,
    ) {
        loop {
            self.status.send_replace(SyncStatus::InProgress);

            let report = self.run_round(token).await;
            self.rounds.fetch_add(1, Ordering::SeqCst);
            self.status.send_replace(if report.is_success() {
                SyncStatus::Successful
            } else {
                SyncStatus::Failed
            });

            for waiter in waiters.drain(..) {
                // The caller may have stopped waiting.
                let _ = waiter.send(report.clone());
            }

            if !self.grace_period.is_zero() {
                tokio::time::sleep(self.grace_period).await;
            }

            let next = {
                let mut state = self.lock_state();
                let next = state.pending.take();
                if next.is_none() {
                    state.running = false;
                    self.status.send_replace(SyncStatus::Idle);
                }
                next
            };

            match next {
                Some(pending) => {
                    tracing::info!(
                        "Starting queued sync round for {} requests",
                        pending.waiters.len()
                    );
                    // A round that got past the notebook phase produced a
                    // newer cursor than anything queued while it ran.
                    token = if report.notebook_error.is_none() {
                        report.token
                    } else {
                        pending.token
                    };
                    waiters = pending.waiters;
                }
                None => return,
            }
        }
    }

    async fn run_round(&self, token: SyncToken) -> SyncReport {
        tracing::info!("Sync round starting from cursor {}", token.encode());

        let mut report = SyncReport {
            token,
            summary: SyncSummary::default(),
            notebook_error: None,
            annotation_error: None,
        };

        let notebooks = match self.notebooks.run(&report.token).await {
            Ok(round) => round,
            Err(e) => {
                tracing::error!("Notebook sync failed: {}", e);
                report.notebook_error = Some(Arc::new(e));
                return report;
            }
        };
        report.summary.merge(notebooks.summary);
        report.token = report
            .token
            .with_notebooks(notebooks.local_boundary, notebooks.server_before);
        self.persist(&report.token).await;

        match self.annotations.run(&report.token, &notebooks.order).await {
            Ok(round) => {
                report.summary.merge(round.summary);
                report.token = report
                    .token
                    .with_annotations(round.local_boundary, round.server_before);
                self.persist(&report.token).await;
            }
            Err(failure) => {
                tracing::error!("Annotation sync failed: {}", failure.error);
                report.summary.merge(failure.summary);
                report.annotation_error = Some(Arc::new(failure.error));
            }
        }

        tracing::info!("Sync round finished: {}", report.summary);
        report
    }

    async fn persist(&self, token: &SyncToken) {
        if let Err(e) = self.repo.save_sync_token(token).await {
            tracing::warn!("Failed to persist sync cursor: {}", e);
        }
    }
}
