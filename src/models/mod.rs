//! Model provisioning on the application side
//!
//! - Catalog of provisionable models and name matching
//! - Host registry and default-model bindings
//! - Reconciliation of the registry against installed models
//! - Sync triggers tying the reconciler to the runtime and the coordinator

pub mod catalog;
pub mod reconcile;
pub mod registry;
pub mod sync;

pub use catalog::{CatalogEntry, CatalogSource, JsonFileCatalog, ModelCategory, StaticCatalog};
pub use reconcile::{
    BindingChange, BindingTarget, ModelRegistryReconciler, ReconcilePlan, ReconcileReport,
};
pub use registry::{
    AssistantBinding, BindingRole, BindingStore, DefaultBindings, InMemoryBindings,
    InMemoryRegistry, ModelRegistry, Provenance, RUNTIME_PROVIDER, RegistryModel,
};
pub use sync::RegistrySync;
