//! Outbound download state updates

use super::progress::PullProgress;

/// Receives per-model download state, typically the host's state container.
///
/// Calls for one model arrive in the order the runtime emitted them.
pub trait DownloadSink: Send + Sync {
    /// A pull job was created
    fn started(&self, model: &str);

    /// A progress record was parsed from the stream
    fn progress(&self, model: &str, progress: &PullProgress);

    /// The job left the active set (completed, cancelled or failed)
    fn stopped(&self, model: &str);
}

/// Sink that logs progress, throttled to whole-percent changes per layer
#[derive(Debug, Default)]
pub struct LogSink {
    last_percent: dashmap::DashMap<String, (String, u32)>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadSink for LogSink {
    fn started(&self, model: &str) {
        tracing::info!(model = %model, "Download started");
    }

    fn progress(&self, model: &str, progress: &PullProgress) {
        let Some(fraction) = progress.fraction() else {
            tracing::info!(model = %model, status = %progress.status, "Download status");
            return;
        };

        let percent = (fraction * 100.0) as u32;
        let changed = match self.last_percent.get(model) {
            Some(last) => last.0 != progress.status || last.1 != percent,
            None => true,
        };
        if changed {
            self.last_percent
                .insert(model.to_string(), (progress.status.clone(), percent));
            tracing::info!(
                model = %model,
                status = %progress.status,
                percent = percent,
                "Download progress"
            );
        }
    }

    fn stopped(&self, model: &str) {
        self.last_percent.remove(model);
        tracing::info!(model = %model, "Download stopped");
    }
}
