//! Host-application collaborators: user notices and confirmation prompts

use async_trait::async_trait;

/// User-visible notices (toasts in a desktop host, log lines in the CLI)
pub trait Notifier: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
}

/// Notifier that writes every notice to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn success(&self, message: &str) {
        tracing::info!(notice = "success", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(notice = "error", "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(notice = "info", "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(notice = "warning", "{}", message);
    }
}

/// Asked before destructive operations
#[async_trait]
pub trait ConfirmPrompt: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

/// Prompt that answers every question with a fixed decision
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl ConfirmPrompt for FixedAnswer {
    async fn confirm(&self, message: &str) -> bool {
        tracing::debug!(answer = self.0, "{}", message);
        self.0
    }
}
