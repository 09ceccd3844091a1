//! Registry reconciliation
//!
//! Aligns the application registry and default bindings with what the
//! runtime reports as installed. Planning is pure; [`apply`] performs the
//! mutations. Running it again with unchanged inputs yields an empty plan.

use super::catalog::{CatalogEntry, find_entry};
use super::registry::{
    BindingRole, BindingStore, DefaultBindings, ModelRegistry, Provenance, RUNTIME_PROVIDER,
    RegistryModel,
};
use crate::client::InstalledModel;
use crate::notify::Notifier;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a binding change applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    Role(BindingRole),
    Assistant(String),
}

impl std::fmt::Display for BindingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Role(role) => write!(f, "{}", role),
            Self::Assistant(id) => write!(f, "assistant {}", id),
        }
    }
}

/// A binding that pointed at a removed model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingChange {
    pub target: BindingTarget,
    pub from: String,
    /// Fallback model, or `None` when the binding was cleared
    pub to: Option<String>,
}

/// Mutations needed to bring the registry in line with the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub remove: Vec<String>,
    pub add: Vec<RegistryModel>,
    /// Entries whose display name changed, applied as remove-then-add
    pub replace: Vec<RegistryModel>,
    pub rebind: Vec<BindingChange>,
    /// Bindings after rebinding
    pub bindings: DefaultBindings,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.add.is_empty()
            && self.replace.is_empty()
            && self.rebind.is_empty()
    }
}

/// Summary of an applied plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub rebound: Vec<BindingChange>,
}

impl ReconcileReport {
    pub fn mutations(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len() + self.rebound.len()
    }

    pub fn is_noop(&self) -> bool {
        self.mutations() == 0
    }
}

/// Registry entry for an installed model matched to a catalog entry
pub fn candidate_entry(installed: &InstalledModel, entry: &CatalogEntry) -> RegistryModel {
    let description = match installed.parameter_size() {
        Some(size) => format!("{} parameters", size),
        None => entry.description.clone(),
    };

    RegistryModel {
        id: installed.name.clone(),
        name: entry.display_name().to_string(),
        group: entry.name.clone(),
        description,
        provider: RUNTIME_PROVIDER.to_string(),
        owned_by: Provenance::Runtime,
    }
}

/// Compute the plan without touching any collaborator
pub fn plan(
    installed: &[InstalledModel],
    catalog: &[CatalogEntry],
    registry: &[RegistryModel],
    bindings: &DefaultBindings,
) -> ReconcilePlan {
    // Installed order is kept; it decides the fallback for orphaned bindings
    let mut seen = HashSet::new();
    let matched: Vec<(RegistryModel, bool)> = installed
        .iter()
        .filter(|m| seen.insert(m.name.clone()))
        .filter_map(|m| {
            find_entry(catalog, &m.name).map(|e| (candidate_entry(m, e), e.is_conversational()))
        })
        .collect();

    let matched_ids: HashSet<&str> = matched.iter().map(|(m, _)| m.id.as_str()).collect();

    let remove: Vec<String> = registry
        .iter()
        .filter(|m| m.is_runtime() && !matched_ids.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect();

    let mut add = Vec::new();
    let mut replace = Vec::new();
    for (candidate, _) in &matched {
        match registry.iter().find(|m| m.id == candidate.id) {
            None => add.push(candidate.clone()),
            Some(existing) if existing.is_runtime() && existing.name != candidate.name => {
                replace.push(candidate.clone())
            }
            Some(_) => {}
        }
    }

    let fallback = matched
        .iter()
        .find(|(_, conversational)| *conversational)
        .map(|(m, _)| m.id.clone());

    let removed: HashSet<&str> = remove.iter().map(String::as_str).collect();
    let mut next = bindings.clone();
    let mut rebind = Vec::new();

    for role in BindingRole::ALL {
        if let Some(current) = bindings.get(role)
            && removed.contains(current)
        {
            rebind.push(BindingChange {
                target: BindingTarget::Role(role),
                from: current.to_string(),
                to: fallback.clone(),
            });
            next.set(role, fallback.clone());
        }
    }

    for assistant in next.assistants.iter_mut() {
        if let Some(current) = assistant.model.as_deref()
            && removed.contains(current)
        {
            rebind.push(BindingChange {
                target: BindingTarget::Assistant(assistant.assistant_id.clone()),
                from: current.to_string(),
                to: fallback.clone(),
            });
            assistant.model = fallback.clone();
        }
    }

    ReconcilePlan {
        remove,
        add,
        replace,
        rebind,
        bindings: next,
    }
}

/// Apply a plan and emit one summary notice for binding changes
pub async fn apply(
    plan: ReconcilePlan,
    registry: &dyn ModelRegistry,
    bindings: &dyn BindingStore,
    notifier: &dyn Notifier,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for id in plan.remove {
        registry
            .remove(&id)
            .await
            .with_context(|| format!("Failed to remove registry entry {}", id))?;
        tracing::info!(model = %id, "Removed runtime model from registry");
        report.removed.push(id);
    }

    for model in plan.replace {
        let id = model.id.clone();
        registry
            .remove(&id)
            .await
            .with_context(|| format!("Failed to replace registry entry {}", id))?;
        registry.add(model).await?;
        tracing::info!(model = %id, "Updated runtime model in registry");
        report.updated.push(id);
    }

    for model in plan.add {
        let id = model.id.clone();
        registry
            .add(model)
            .await
            .with_context(|| format!("Failed to add registry entry {}", id))?;
        tracing::info!(model = %id, "Added runtime model to registry");
        report.added.push(id);
    }

    if !plan.rebind.is_empty() {
        bindings
            .set_bindings(plan.bindings)
            .await
            .context("Failed to update default bindings")?;

        for change in &plan.rebind {
            tracing::info!(
                target_binding = %change.target,
                from = %change.from,
                to = ?change.to,
                "Rebound default model"
            );
        }

        let count = plan.rebind.len();
        let summary = format!(
            "{} default {} used removed models ({})",
            count,
            if count == 1 { "binding" } else { "bindings" },
            plan.rebind
                .iter()
                .map(|c| c.target.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        match plan.rebind.iter().find_map(|c| c.to.as_deref()) {
            Some(fallback) => {
                notifier.info(&format!("{}; switched to {}", summary, fallback));
            }
            None => notifier.warning(&format!(
                "{}; no installed chat model is left, please choose a new default",
                summary
            )),
        }
        report.rebound = plan.rebind;
    }

    Ok(report)
}

/// Serialized reconciliation against the host registry and bindings
pub struct ModelRegistryReconciler {
    registry: Arc<dyn ModelRegistry>,
    bindings: Arc<dyn BindingStore>,
    notifier: Arc<dyn Notifier>,
    lock: Mutex<()>,
}

impl ModelRegistryReconciler {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        bindings: Arc<dyn BindingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            bindings,
            notifier,
            lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn bindings(&self) -> &Arc<dyn BindingStore> {
        &self.bindings
    }

    /// Run one pass. Concurrent calls are serialized.
    pub async fn reconcile(
        &self,
        installed: &[InstalledModel],
        catalog: &[CatalogEntry],
    ) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;

        let current = self.registry.list().await.context("Failed to list registry")?;
        let bindings = self
            .bindings
            .bindings()
            .await
            .context("Failed to read default bindings")?;

        let plan = plan(installed, catalog, &current, &bindings);
        if plan.is_empty() {
            tracing::debug!(installed = installed.len(), "Registry already in sync");
            return Ok(ReconcileReport::default());
        }

        let report = apply(
            plan,
            self.registry.as_ref(),
            self.bindings.as_ref(),
            self.notifier.as_ref(),
        )
        .await?;

        crate::metrics::record_reconcile(
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.rebound.len(),
        );
        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            rebound = report.rebound.len(),
            "Registry reconciled"
        );

        Ok(report)
    }
}
