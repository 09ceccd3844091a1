//! Download coordinator
//!
//! Tracks at most one pull job per model name. Each job streams the
//! runtime's NDJSON progress records, forwards them to the sink in order and
//! completes exactly once on the first `success` record.

use super::progress::{LineBuffer, PullProgress};
use super::sink::DownloadSink;
use crate::client::{ModelNameRequest, check_status};
use crate::error::{RuntimeError, RuntimeResult};
use crate::models::catalog::{self, CatalogEntry};
use crate::notify::Notifier;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use reqwest::Client;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listener invoked with the model id after a pull completes
pub type CompletionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle for removing a completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Snapshot of an active pull
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub progress: Option<PullProgress>,
}

struct DownloadJob {
    /// Generation id, so a finished task never removes a newer job for the same model
    id: u64,
    token: CancellationToken,
    started_at: DateTime<Utc>,
    progress: Option<PullProgress>,
}

#[derive(Debug)]
enum PullOutcome {
    Completed,
    Cancelled,
}

struct Inner {
    client: Client,
    jobs: DashMap<String, DownloadJob>,
    completed: DashSet<String>,
    catalog: RwLock<Vec<CatalogEntry>>,
    callbacks: DashMap<u64, CompletionCallback>,
    next_job_id: AtomicU64,
    next_callback_id: AtomicU64,
    sink: Arc<dyn DownloadSink>,
    notifier: Arc<dyn Notifier>,
}

/// Drives concurrent, individually cancellable model pulls
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Pulls have no client-side timeout; only cancellation ends them early.
    pub fn new(sink: Arc<dyn DownloadSink>, notifier: Arc<dyn Notifier>) -> RuntimeResult<Self> {
        let client = Client::builder().no_proxy().build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                jobs: DashMap::new(),
                completed: DashSet::new(),
                catalog: RwLock::new(Vec::new()),
                callbacks: DashMap::new(),
                next_job_id: AtomicU64::new(1),
                next_callback_id: AtomicU64::new(1),
                sink,
                notifier,
            }),
        })
    }

    /// Start pulling `model` from the runtime at `server_address`.
    ///
    /// Returns the pull task, or `None` when a job for the model is already
    /// active. Must be called from within a tokio runtime.
    pub fn download(&self, model: &str, server_address: &str) -> Option<JoinHandle<()>> {
        let token = CancellationToken::new();
        let job_id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed);

        match self.inner.jobs.entry(model.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(model = %model, "Download already in progress, ignoring request");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(DownloadJob {
                    id: job_id,
                    token: token.clone(),
                    started_at: Utc::now(),
                    progress: None,
                });
            }
        }

        self.inner.completed.remove(model);
        crate::metrics::record_pull_started(model);
        crate::metrics::update_active_pulls(self.inner.jobs.len());
        self.inner.sink.started(model);

        let url = format!("{}/api/pull", server_address.trim_end_matches('/'));
        tracing::info!(model = %model, url = %url, job_id = job_id, "Starting model pull");

        let inner = self.inner.clone();
        let model = model.to_string();
        Some(tokio::spawn(async move {
            inner.run_pull(model, url, job_id, token).await;
        }))
    }

    /// Cancel the active pull for `model`. Returns false when none was active.
    pub async fn cancel(&self, model: &str) -> bool {
        let Some((_, job)) = self.inner.jobs.remove(model) else {
            tracing::debug!(model = %model, "No active download to cancel");
            return false;
        };

        job.token.cancel();
        self.inner.completed.remove(model);
        self.inner.sink.stopped(model);
        crate::metrics::record_pull_finished(model, "cancelled");
        crate::metrics::update_active_pulls(self.inner.jobs.len());

        let display = self.inner.display_name(model).await;
        tracing::info!(model = %model, job_id = job.id, "Download cancelled");
        self.inner
            .notifier
            .info(&format!("Cancelled download of {}", display));
        true
    }

    /// Cancel every active pull
    pub async fn cancel_all(&self) {
        let models: Vec<String> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        for model in models {
            self.cancel(&model).await;
        }
        self.inner.completed.clear();
    }

    pub fn is_downloading(&self, model: &str) -> bool {
        self.inner.jobs.contains_key(model)
    }

    pub fn list_downloading(&self) -> BTreeSet<String> {
        self.inner.jobs.iter().map(|e| e.key().clone()).collect()
    }

    /// Latest progress record of an active pull
    pub fn progress(&self, model: &str) -> Option<PullProgress> {
        self.inner.jobs.get(model).and_then(|job| job.progress.clone())
    }

    pub fn snapshot(&self, model: &str) -> Option<JobSnapshot> {
        self.inner.jobs.get(model).map(|job| JobSnapshot {
            model: model.to_string(),
            started_at: job.started_at,
            progress: job.progress.clone(),
        })
    }

    pub fn add_completion_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Arc::new(callback));
        CallbackId(id)
    }

    pub fn remove_completion_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(&id.0).is_some()
    }

    /// Replace the catalog used for display names in notices
    pub async fn set_catalog(&self, entries: Vec<CatalogEntry>) {
        *self.inner.catalog.write().await = entries;
    }
}

impl Inner {
    async fn display_name(&self, model: &str) -> String {
        catalog::display_name(&self.catalog.read().await, model)
    }

    async fn run_pull(&self, model: String, url: String, job_id: u64, token: CancellationToken) {
        match self.pull_stream(&model, &url, job_id, &token).await {
            Ok(PullOutcome::Completed) => {}
            Ok(PullOutcome::Cancelled) => {
                tracing::debug!(model = %model, job_id = job_id, "Pull task observed cancellation");
            }
            Err(e) if token.is_cancelled() => {
                tracing::debug!(model = %model, error = %e, "Read failed after cancellation");
            }
            Err(e) => self.fail(&model, job_id, e).await,
        }
    }

    async fn pull_stream(
        &self,
        model: &str,
        url: &str,
        job_id: u64,
        token: &CancellationToken,
    ) -> RuntimeResult<PullOutcome> {
        let request = self
            .client
            .post(url)
            .json(&ModelNameRequest { name: model })
            .send();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(PullOutcome::Cancelled),
            response = request => response?,
        };
        let response = check_status(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = LineBuffer::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(PullOutcome::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for line in buffer.push(&chunk) {
                        if let Some(outcome) = self.handle_line(model, &line, job_id, token).await? {
                            return Ok(outcome);
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if let Some(line) = buffer.finish()
            && let Some(outcome) = self.handle_line(model, &line, job_id, token).await?
        {
            return Ok(outcome);
        }

        Err(RuntimeError::Pull(
            "stream ended before the pull completed".to_string(),
        ))
    }

    async fn handle_line(
        &self,
        model: &str,
        line: &str,
        job_id: u64,
        token: &CancellationToken,
    ) -> RuntimeResult<Option<PullOutcome>> {
        if token.is_cancelled() {
            return Ok(Some(PullOutcome::Cancelled));
        }

        let progress = match PullProgress::parse_line(line) {
            Ok(Some(progress)) => progress,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(model = %model, error = %e, line = %line, "Skipping malformed progress record");
                return Ok(None);
            }
        };

        if let Some(error) = progress.error.as_deref() {
            return Err(RuntimeError::Pull(error.to_string()));
        }

        if let Some(mut job) = self.jobs.get_mut(model)
            && job.id == job_id
        {
            job.progress = Some(progress.clone());
        }
        self.sink.progress(model, &progress);

        if progress.is_success() {
            self.complete(model, job_id).await;
            return Ok(Some(PullOutcome::Completed));
        }
        Ok(None)
    }

    async fn complete(&self, model: &str, job_id: u64) {
        if !self.completed.insert(model.to_string()) {
            tracing::debug!(model = %model, "Duplicate completion ignored");
            return;
        }

        self.finish_job(model, job_id);
        crate::metrics::record_pull_finished(model, "completed");

        let display = self.display_name(model).await;
        tracing::info!(model = %model, job_id = job_id, "Model pull completed");
        self.notifier.success(&format!(
            "Model {} downloaded and added to the local model library",
            display
        ));

        let mut callbacks: Vec<(u64, CompletionCallback)> = self
            .callbacks
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        callbacks.sort_by_key(|(id, _)| *id);

        for (_, callback) in callbacks {
            callback(model);
        }
    }

    async fn fail(&self, model: &str, job_id: u64, error: RuntimeError) {
        tracing::error!(model = %model, job_id = job_id, error = %error, "Model pull failed");

        self.finish_job(model, job_id);
        crate::metrics::record_pull_finished(model, "failed");

        let display = self.display_name(model).await;
        self.notifier
            .error(&format!("Failed to download model {}: {}", display, error));
    }

    /// Remove the job if it still belongs to this task
    fn finish_job(&self, model: &str, job_id: u64) {
        if self.jobs.remove_if(model, |_, job| job.id == job_id).is_some() {
            self.sink.stopped(model);
        }
        crate::metrics::update_active_pulls(self.jobs.len());
    }
}
