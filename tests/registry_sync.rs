//! Registry reconciliation driven through the runtime client

mod common;

use common::{FakeOllama, NoticeKind, RecordingNotifier, RecordingSink};
use ollama_manager::download::DownloadCoordinator;
use ollama_manager::models::{
    BindingStore, CatalogEntry, DefaultBindings, InMemoryBindings, InMemoryRegistry,
    ModelCategory, ModelRegistry, ModelRegistryReconciler, Provenance, RUNTIME_PROVIDER,
    RegistryModel, RegistrySync, StaticCatalog,
};
use ollama_manager::notify::FixedAnswer;
use ollama_manager::OllamaClient;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    server: FakeOllama,
    registry: Arc<InMemoryRegistry>,
    bindings: Arc<InMemoryBindings>,
    notifier: Arc<RecordingNotifier>,
    sync: Arc<RegistrySync>,
}

fn catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("llama3", ModelCategory::Conversational).with_display_name("Llama 3"),
        CatalogEntry::new("qwen2", ModelCategory::Conversational).with_display_name("Qwen 2"),
        CatalogEntry::new("nomic-embed-text", ModelCategory::Embedding),
    ]
}

async fn fixture(registry: Vec<RegistryModel>, bindings: DefaultBindings) -> Fixture {
    let server = FakeOllama::start().await;
    let registry = Arc::new(InMemoryRegistry::with_models(registry));
    let bindings = Arc::new(InMemoryBindings::new(bindings));
    let notifier = Arc::new(RecordingNotifier::default());

    let coordinator =
        DownloadCoordinator::new(Arc::new(RecordingSink::default()), notifier.clone()).unwrap();
    let reconciler = Arc::new(ModelRegistryReconciler::new(
        registry.clone(),
        bindings.clone(),
        notifier.clone(),
    ));
    let sync = Arc::new(RegistrySync::new(
        OllamaClient::new(server.address.clone()).unwrap(),
        Arc::new(StaticCatalog(catalog())),
        reconciler,
        coordinator,
        notifier.clone(),
        Duration::from_millis(10),
    ));

    Fixture {
        server,
        registry,
        bindings,
        notifier,
        sync,
    }
}

fn runtime_entry(id: &str, name: &str, group: &str) -> RegistryModel {
    RegistryModel {
        id: id.to_string(),
        name: name.to_string(),
        group: group.to_string(),
        description: String::new(),
        provider: RUNTIME_PROVIDER.to_string(),
        owned_by: Provenance::Runtime,
    }
}

fn external_entry(id: &str) -> RegistryModel {
    RegistryModel {
        id: id.to_string(),
        name: id.to_string(),
        group: "openai".to_string(),
        description: String::new(),
        provider: "openai".to_string(),
        owned_by: Provenance::External,
    }
}

#[tokio::test]
async fn test_first_sync_registers_installed_catalog_models() {
    let f = fixture(vec![external_entry("gpt-4o")], DefaultBindings::default()).await;
    f.server.state.install("llama3:8b", "8.0B");
    f.server.state.install("mistral:7b", "7.2B");
    f.server.state.install("nomic-embed-text:latest", "137M");

    let report = f.sync.refresh().await.unwrap();
    assert_eq!(
        report.added,
        vec!["llama3:8b".to_string(), "nomic-embed-text:latest".to_string()]
    );

    let models = f.registry.list().await.unwrap();
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["gpt-4o", "llama3:8b", "nomic-embed-text:latest"]);
    assert_eq!(models[1].name, "Llama 3");
    assert_eq!(models[1].description, "8.0B parameters");

    let second = f.sync.refresh().await.unwrap();
    assert!(second.is_noop());
    assert!(f.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_uninstalled_default_falls_back_to_next_chat_model() {
    let bindings = DefaultBindings {
        default_chat: Some("llama3:8b".to_string()),
        topic_naming: Some("gpt-4o".to_string()),
        ..Default::default()
    };
    let f = fixture(
        vec![
            external_entry("gpt-4o"),
            runtime_entry("llama3:8b", "Llama 3", "llama3"),
        ],
        bindings,
    )
    .await;
    f.server.state.install("nomic-embed-text:latest", "137M");
    f.server.state.install("qwen2:7b", "7.6B");

    let report = f.sync.refresh().await.unwrap();
    assert_eq!(report.removed, vec!["llama3:8b".to_string()]);
    assert_eq!(report.rebound.len(), 1);

    let bindings = f.bindings.bindings().await.unwrap();
    assert_eq!(bindings.default_chat.as_deref(), Some("qwen2:7b"));
    assert_eq!(bindings.topic_naming.as_deref(), Some("gpt-4o"));
    assert_eq!(f.notifier.count(NoticeKind::Info), 1);
}

#[tokio::test]
async fn test_delete_declined_keeps_model() {
    let f = fixture(Vec::new(), DefaultBindings::default()).await;
    f.server.state.install("llama3:8b", "8.0B");
    f.sync.refresh().await.unwrap();

    let deleted = f
        .sync
        .delete_model("llama3:8b", &FixedAnswer(false))
        .await
        .unwrap();

    assert!(!deleted);
    assert!(f.server.state.deleted.lock().unwrap().is_empty());
    assert_eq!(f.registry.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_confirmed_removes_and_clears_binding() {
    let bindings = DefaultBindings {
        default_chat: Some("llama3:8b".to_string()),
        ..Default::default()
    };
    let f = fixture(Vec::new(), bindings).await;
    f.server.state.install("llama3:8b", "8.0B");
    f.sync.refresh().await.unwrap();

    let deleted = f
        .sync
        .delete_model("llama3:8b", &FixedAnswer(true))
        .await
        .unwrap();

    assert!(deleted);
    assert_eq!(
        f.server.state.deleted.lock().unwrap().as_slice(),
        &["llama3:8b".to_string()]
    );
    assert!(f.registry.list().await.unwrap().is_empty());
    assert_eq!(f.bindings.bindings().await.unwrap().default_chat, None);

    let notices = f.notifier.notices();
    assert_eq!(notices[0], (NoticeKind::Success, "Model Llama 3 deleted".to_string()));
    assert_eq!(f.notifier.count(NoticeKind::Warning), 1);
}

#[tokio::test]
async fn test_delete_unknown_model_reports_error() {
    let f = fixture(Vec::new(), DefaultBindings::default()).await;

    let result = f.sync.delete_model("ghost:1b", &FixedAnswer(true)).await;

    assert!(result.is_err());
    assert_eq!(f.notifier.count(NoticeKind::Error), 1);
    assert_eq!(f.notifier.count(NoticeKind::Success), 0);
}
