//! Keeps the application registry in sync with the runtime
//!
//! Every trigger (startup, completed pull, deletion) re-runs the same
//! reconciliation against a fresh installed snapshot.

use super::catalog::{CatalogEntry, CatalogSource, display_name};
use super::reconcile::{ModelRegistryReconciler, ReconcileReport};
use crate::client::OllamaClient;
use crate::download::{CallbackId, DownloadCoordinator};
use crate::notify::{ConfirmPrompt, Notifier};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

pub struct RegistrySync {
    client: OllamaClient,
    catalog: Arc<dyn CatalogSource>,
    reconciler: Arc<ModelRegistryReconciler>,
    coordinator: DownloadCoordinator,
    notifier: Arc<dyn Notifier>,
    settle_delay: Duration,
}

impl RegistrySync {
    pub fn new(
        client: OllamaClient,
        catalog: Arc<dyn CatalogSource>,
        reconciler: Arc<ModelRegistryReconciler>,
        coordinator: DownloadCoordinator,
        notifier: Arc<dyn Notifier>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            client,
            catalog,
            reconciler,
            coordinator,
            notifier,
            settle_delay,
        }
    }

    pub fn reconciler(&self) -> &Arc<ModelRegistryReconciler> {
        &self.reconciler
    }

    async fn load_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let entries = self.catalog.load().await.context("Failed to load model catalog")?;
        self.coordinator.set_catalog(entries.clone()).await;
        Ok(entries)
    }

    /// Fetch the catalog and the installed list, then reconcile
    pub async fn refresh(&self) -> Result<ReconcileReport> {
        let catalog = self.load_catalog().await?;
        let installed = self
            .client
            .installed_models()
            .await
            .context("Failed to list installed models")?;

        self.reconciler.reconcile(&installed, &catalog).await
    }

    /// Re-run [`refresh`](Self::refresh) after every completed pull.
    ///
    /// The refresh waits for the settling delay first so the runtime lists
    /// the new model. Holds only a weak reference to `self`.
    pub fn attach(self: &Arc<Self>) -> CallbackId {
        let weak = Arc::downgrade(self);
        let settle_delay = self.settle_delay;

        self.coordinator.add_completion_callback(move |model| {
            let weak = weak.clone();
            let model = model.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(settle_delay).await;
                let Some(sync) = weak.upgrade() else {
                    return;
                };
                match sync.refresh().await {
                    Ok(report) => {
                        tracing::debug!(model = %model, mutations = report.mutations(), "Post-download sync finished")
                    }
                    Err(e) => {
                        tracing::warn!(model = %model, error = %e, "Post-download sync failed")
                    }
                }
            });
        })
    }

    /// Delete an installed model after confirmation, then reconcile.
    ///
    /// Returns false when the prompt was declined.
    pub async fn delete_model(&self, model: &str, prompt: &dyn ConfirmPrompt) -> Result<bool> {
        let catalog = self.load_catalog().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Catalog unavailable, using raw model name");
            Vec::new()
        });
        let display = display_name(&catalog, model);

        let question = format!(
            "Delete model {}? It will be removed from the local model library.",
            display
        );
        if !prompt.confirm(&question).await {
            tracing::info!(model = %model, "Deletion declined");
            return Ok(false);
        }

        if let Err(e) = self.client.delete_model(model).await {
            self.notifier
                .error(&format!("Failed to delete model {}: {}", display, e));
            return Err(e).with_context(|| format!("Failed to delete model {}", model));
        }

        self.notifier
            .success(&format!("Model {} deleted", display));
        self.refresh().await?;
        Ok(true)
    }
}
