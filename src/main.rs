//! Ollama Manager - Main entry point

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ollama_manager::config::ManagerConfig;
use ollama_manager::download::{DownloadCoordinator, LogSink};
use ollama_manager::models::{
    CatalogSource, InMemoryBindings, InMemoryRegistry, JsonFileCatalog, ModelRegistryReconciler,
    RegistrySync, StaticCatalog,
};
use ollama_manager::notify::{ConfirmPrompt, FixedAnswer, LogNotifier, Notifier};
use ollama_manager::runtime::{
    ProcessControl, RuntimeSupervisor, ShutdownHook, StartOutcome, SupervisorConfig,
    system_process_control, wait_for_signal,
};
use ollama_manager::{OllamaClient, StateManager, metrics, probe_port};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Interval between liveness polls while the runtime starts
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "ollama-manager")]
#[command(about = "Local Ollama runtime and model manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override runtime port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the runtime and keep the model registry in sync until interrupted
    Serve,
    /// Download a model, starting the runtime if needed
    Pull { model: String },
    /// List models installed in the runtime
    List,
    /// Delete an installed model
    Delete {
        model: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show runtime status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.port = port;
    }

    config.validate()?;

    tracing::debug!(
        port = config.port,
        bin_dir = ?config.bin_dir,
        state_file = ?config.state_file,
        "Configuration loaded"
    );

    let app = App::build(config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => app.serve().await,
        Command::Pull { model } => app.pull(&model).await,
        Command::List => app.list().await,
        Command::Delete { model, yes } => app.delete(&model, yes).await,
        Command::Status => app.status().await,
    }
}

/// Long-lived components shared by every subcommand
struct App {
    config: ManagerConfig,
    supervisor: Arc<RuntimeSupervisor>,
    client: OllamaClient,
    coordinator: DownloadCoordinator,
    sync: Arc<RegistrySync>,
    state_manager: StateManager,
}

impl App {
    fn build(config: ManagerConfig) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let supervisor = Arc::new(RuntimeSupervisor::new(SupervisorConfig::from_manager(&config)));
        let client = OllamaClient::new(config.server_address())?;
        let coordinator = DownloadCoordinator::new(Arc::new(LogSink::new()), notifier.clone())?;

        let catalog: Arc<dyn CatalogSource> = match &config.catalog_file {
            Some(path) => Arc::new(JsonFileCatalog::new(path.clone())),
            None => {
                tracing::warn!("No catalog file configured, installed models will not be registered");
                Arc::new(StaticCatalog::default())
            }
        };

        let registry = Arc::new(InMemoryRegistry::new());
        let bindings = Arc::new(InMemoryBindings::default());
        let reconciler = Arc::new(ModelRegistryReconciler::new(
            registry.clone(),
            bindings.clone(),
            notifier.clone(),
        ));
        let sync = Arc::new(RegistrySync::new(
            client.clone(),
            catalog,
            reconciler,
            coordinator.clone(),
            notifier,
            config.settle_delay(),
        ));
        let state_manager = StateManager::new(config.state_file.clone(), registry, bindings);

        Ok(Self {
            config,
            supervisor,
            client,
            coordinator,
            sync,
            state_manager,
        })
    }

    /// Start the runtime unless one already answers, then wait for liveness
    async fn ensure_runtime(&self) -> Result<StartOutcome> {
        let outcome = self
            .supervisor
            .start()
            .await
            .context("Failed to start runtime")?;

        if let StartOutcome::Started(info) = &outcome {
            tracing::info!(pid = ?info.pid, executable = ?info.executable, "Runtime started");
        }

        self.client
            .wait_until_ready(self.config.startup_timeout(), READY_POLL_INTERVAL)
            .await?;
        Ok(outcome)
    }

    async fn serve(&self) -> Result<()> {
        tracing::info!("Starting Ollama Manager");

        // Installed before any work so a signal during startup still shuts down
        let hook =
            ShutdownHook::new(self.supervisor.clone()).with_downloads(self.coordinator.clone());
        let restored = AtomicBool::new(false);

        let result = hook
            .run_until_exit(self.run_serve(&restored), wait_for_signal())
            .await;

        // Never overwrite the state file with a registry that was not restored
        if restored.load(Ordering::SeqCst) {
            tracing::info!("Saving final state");
            if let Err(e) = self.state_manager.save().await {
                tracing::error!(error = %e, "Failed to save final state");
            }
        }

        tracing::info!("Shutdown complete");
        result.unwrap_or(Ok(()))
    }

    /// Startup and steady state of `serve`; only returns on error
    async fn run_serve(&self, restored: &AtomicBool) -> Result<()> {
        if let Some(port) = self.config.metrics_port {
            metrics::setup_metrics(std::net::SocketAddr::from(([127, 0, 0, 1], port)))?;
        }

        self.state_manager.restore().await?;
        restored.store(true, Ordering::SeqCst);

        self.ensure_runtime().await?;

        self.sync.attach();
        if let Err(e) = self.sync.refresh().await {
            tracing::warn!(error = %e, "Initial registry sync failed");
        }
        self.state_manager.save().await?;

        std::future::pending().await
    }

    async fn pull(&self, model: &str) -> Result<()> {
        let hook = ShutdownHook::new(self.supervisor.clone())
            .with_downloads(self.coordinator.clone())
            .spawned_runtime_only();

        match hook
            .run_until_exit(self.run_pull(model), wait_for_signal())
            .await
        {
            Some(result) => result,
            None => anyhow::bail!("Pull of {} interrupted", model),
        }
    }

    async fn run_pull(&self, model: &str) -> Result<()> {
        self.state_manager.restore().await?;
        self.ensure_runtime().await?;

        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        self.coordinator.add_completion_callback(move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        // Warm the display-name catalog before the pull starts
        if let Err(e) = self.sync.refresh().await {
            tracing::warn!(error = %e, "Registry sync before pull failed");
        }

        let Some(handle) = self
            .coordinator
            .download(model, &self.config.server_address())
        else {
            anyhow::bail!("A download of {} is already in progress", model);
        };
        handle.await.context("Pull task failed")?;

        if !completed.load(Ordering::SeqCst) {
            anyhow::bail!("Model {} was not downloaded", model);
        }

        tokio::time::sleep(self.config.settle_delay()).await;
        self.sync.refresh().await?;
        self.state_manager.save().await?;
        Ok(())
    }

    async fn list(&self) -> Result<()> {
        let models = self
            .client
            .installed_models()
            .await
            .context("Failed to list installed models, is the runtime running?")?;

        if models.is_empty() {
            println!("No models installed");
            return Ok(());
        }

        for model in models {
            println!(
                "{:<40} {:>8.2} GB  {}",
                model.name,
                model.size as f64 / 1_073_741_824.0,
                model.parameter_size().unwrap_or("-")
            );
        }
        Ok(())
    }

    async fn delete(&self, model: &str, yes: bool) -> Result<()> {
        self.state_manager.restore().await?;

        let deleted = if yes {
            self.sync.delete_model(model, &FixedAnswer(true)).await?
        } else {
            self.sync.delete_model(model, &StdinPrompt).await?
        };

        if deleted {
            self.state_manager.save().await?;
        }
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let occupied = probe_port(&self.config.host, self.config.port).await;
        println!("Address:  {}", self.config.server_address());
        println!("Port:     {}", if occupied { "in use" } else { "free" });

        match self.client.version().await {
            Ok(version) => println!("Runtime:  connected (version {})", version),
            Err(e) => {
                tracing::debug!(error = %e, "Version request failed");
                println!("Runtime:  not reachable");
            }
        }

        let executable = &self.supervisor.config().executable;
        match system_process_control()
            .list_processes_by_name(executable)
            .await
        {
            Ok(pids) if pids.is_empty() => println!("Process:  none named {}", executable),
            Ok(pids) => println!("Process:  {} (pids {:?})", executable, pids),
            Err(e) => {
                tracing::debug!(error = %e, "Process listing failed");
                println!("Process:  unknown");
            }
        }

        println!(
            "Binary:   {}",
            self.supervisor.config().executable_path().display()
        );
        println!("State:    {}", self.state_manager.state_file().display());
        Ok(())
    }
}

/// Asks on the terminal
struct StdinPrompt;

#[async_trait]
impl ConfirmPrompt for StdinPrompt {
    async fn confirm(&self, message: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        if stdout
            .write_all(format!("{} [y/N] ", message).as_bytes())
            .await
            .is_err()
        {
            return false;
        }
        let _ = stdout.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read confirmation");
                false
            }
        }
    }
}
