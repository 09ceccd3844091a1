//! Application model registry and default-model bindings
//!
//! The registry is owned by the host application. Entries created by the
//! reconciler carry [`Provenance::Runtime`]; everything else is left alone.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Provider id written on runtime-provisioned entries
pub const RUNTIME_PROVIDER: &str = "ollama";

/// Who created a registry entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Provisioned through the local runtime and owned by the reconciler
    Runtime,
    #[default]
    External,
}

/// Entry in the application's model registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryModel {
    /// Installed runtime identifier, e.g. "llama3:8b"
    pub id: String,
    /// Display name
    pub name: String,
    /// Catalog name the entry was matched against
    pub group: String,
    #[serde(default)]
    pub description: String,
    pub provider: String,
    #[serde(default)]
    pub owned_by: Provenance,
}

impl RegistryModel {
    pub fn is_runtime(&self) -> bool {
        self.owned_by == Provenance::Runtime
    }
}

/// Host registry the reconciler mutates
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Add an entry, replacing any entry with the same id
    async fn add(&self, model: RegistryModel) -> Result<()>;

    /// Remove by id. Returns whether an entry existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<RegistryModel>>;
}

/// Registry kept in memory, in insertion order
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    models: RwLock<Vec<RegistryModel>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: Vec<RegistryModel>) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }
}

#[async_trait]
impl ModelRegistry for InMemoryRegistry {
    async fn add(&self, model: RegistryModel) -> Result<()> {
        let mut models = self.models.write().await;
        match models.iter_mut().find(|m| m.id == model.id) {
            Some(existing) => *existing = model,
            None => models.push(model),
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut models = self.models.write().await;
        let before = models.len();
        models.retain(|m| m.id != id);
        Ok(models.len() != before)
    }

    async fn list(&self) -> Result<Vec<RegistryModel>> {
        Ok(self.models.read().await.clone())
    }
}

// ============================================================================
// Default bindings
// ============================================================================

/// Application roles that point at a default model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingRole {
    DefaultChat,
    TopicNaming,
    Translation,
}

impl BindingRole {
    pub const ALL: [BindingRole; 3] = [
        BindingRole::DefaultChat,
        BindingRole::TopicNaming,
        BindingRole::Translation,
    ];
}

impl std::fmt::Display for BindingRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DefaultChat => write!(f, "default chat"),
            Self::TopicNaming => write!(f, "topic naming"),
            Self::Translation => write!(f, "translation"),
        }
    }
}

/// Per-assistant model override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantBinding {
    pub assistant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Default model per role plus assistant overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultBindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_naming: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default)]
    pub assistants: Vec<AssistantBinding>,
}

impl DefaultBindings {
    pub fn get(&self, role: BindingRole) -> Option<&str> {
        match role {
            BindingRole::DefaultChat => self.default_chat.as_deref(),
            BindingRole::TopicNaming => self.topic_naming.as_deref(),
            BindingRole::Translation => self.translation.as_deref(),
        }
    }

    pub fn set(&mut self, role: BindingRole, model: Option<String>) {
        let slot = match role {
            BindingRole::DefaultChat => &mut self.default_chat,
            BindingRole::TopicNaming => &mut self.topic_naming,
            BindingRole::Translation => &mut self.translation,
        };
        *slot = model;
    }

    /// Whether any role or assistant points at `id`
    pub fn references(&self, id: &str) -> bool {
        BindingRole::ALL.iter().any(|r| self.get(*r) == Some(id))
            || self.assistants.iter().any(|a| a.model.as_deref() == Some(id))
    }
}

/// Host store for the default bindings
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn bindings(&self) -> Result<DefaultBindings>;
    async fn set_bindings(&self, bindings: DefaultBindings) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryBindings {
    bindings: RwLock<DefaultBindings>,
}

impl InMemoryBindings {
    pub fn new(bindings: DefaultBindings) -> Self {
        Self {
            bindings: RwLock::new(bindings),
        }
    }
}

#[async_trait]
impl BindingStore for InMemoryBindings {
    async fn bindings(&self) -> Result<DefaultBindings> {
        Ok(self.bindings.read().await.clone())
    }

    async fn set_bindings(&self, bindings: DefaultBindings) -> Result<()> {
        *self.bindings.write().await = bindings;
        Ok(())
    }
}
