//! Ollama Manager - Local runtime lifecycle and model provisioning
//!
//! Supervises a locally bundled Ollama server process, drives cancellable
//! model pulls against it, and keeps an application model registry in sync
//! with what the runtime has installed.

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod probe;
pub mod runtime;
pub mod state;

pub use client::{InstalledModel, ModelDetails, OllamaClient};
pub use config::ManagerConfig;
pub use download::{CallbackId, DownloadCoordinator, DownloadSink, LogSink, PullProgress};
pub use error::{RuntimeError, RuntimeResult};
pub use models::{
    CatalogEntry, CatalogSource, DefaultBindings, ModelRegistry, ModelRegistryReconciler,
    RegistryModel, RegistrySync,
};
pub use notify::{ConfirmPrompt, LogNotifier, Notifier};
pub use probe::probe_port;
pub use runtime::{HostEvent, RuntimeState, RuntimeSupervisor, ShutdownHook, StartOutcome};
pub use state::StateManager;
