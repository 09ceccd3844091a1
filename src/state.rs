//! State persistence for the model registry and default bindings

use crate::models::registry::{BindingStore, DefaultBindings, ModelRegistry, RegistryModel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Storage backend on the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystemStorage;

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory: {:?}", parent))?;
        }

        // Write to a sibling temp file, then rename over the target
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write state file")?;
        file.sync_all().await.context("Failed to sync state file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp state file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read state file: {:?}", path)),
        }
    }
}

// ============================================================================
// State Manager
// ============================================================================

/// On-disk snapshot of the registry and bindings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub bindings: DefaultBindings,
    #[serde(default)]
    pub models: Vec<RegistryModel>,
}

/// Persists the host registry and bindings between runs
pub struct StateManager {
    state_file: PathBuf,
    registry: Arc<dyn ModelRegistry>,
    bindings: Arc<dyn BindingStore>,
    storage: Arc<dyn StorageBackend>,
    restore_in_progress: AtomicBool,
}

impl StateManager {
    pub fn new_with_storage(
        state_file: PathBuf,
        registry: Arc<dyn ModelRegistry>,
        bindings: Arc<dyn BindingStore>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state_file,
            registry,
            bindings,
            storage,
            restore_in_progress: AtomicBool::new(false),
        }
    }

    pub fn new(
        state_file: PathBuf,
        registry: Arc<dyn ModelRegistry>,
        bindings: Arc<dyn BindingStore>,
    ) -> Self {
        Self::new_with_storage(state_file, registry, bindings, Arc::new(FileSystemStorage))
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Save current state to disk atomically
    pub async fn save(&self) -> Result<()> {
        let state = PersistedState {
            last_updated: chrono::Utc::now(),
            bindings: self.bindings.bindings().await?,
            models: self.registry.list().await?,
        };

        let toml_content =
            toml::to_string_pretty(&state).context("Failed to serialize state to TOML")?;

        self.storage.save(&self.state_file, &toml_content).await?;

        tracing::debug!(
            path = ?self.state_file,
            models = state.models.len(),
            "State saved"
        );

        Ok(())
    }

    /// Load state from disk
    /// FAILS HARD if state file is corrupted - user must fix or delete
    pub async fn load(&self) -> Result<PersistedState> {
        let Some(content) = self.storage.load(&self.state_file).await? else {
            tracing::info!("No state file found, starting fresh");
            return Ok(PersistedState::default());
        };

        let state: PersistedState = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        tracing::info!(
            models = state.models.len(),
            last_updated = %state.last_updated,
            "State loaded from disk"
        );

        Ok(state)
    }

    /// Load the saved state into the registry and binding store
    pub async fn restore(&self) -> Result<()> {
        if self
            .restore_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("Restore operation already in progress");
        }

        let _guard = RestoreGuard {
            flag: &self.restore_in_progress,
        };

        let state = self.load().await?;
        let count = state.models.len();

        for model in state.models {
            let id = model.id.clone();
            self.registry
                .add(model)
                .await
                .with_context(|| format!("Failed to restore registry entry {}", id))?;
        }
        self.bindings.set_bindings(state.bindings).await?;

        tracing::info!(models = count, "State restored");
        Ok(())
    }
}

/// RAII guard to ensure restore_in_progress flag is cleared on drop
struct RestoreGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
