//! Model pulls: progress parsing, outbound sink and the coordinator

pub mod coordinator;
pub mod progress;
pub mod sink;

pub use coordinator::{CallbackId, CompletionCallback, DownloadCoordinator, JobSnapshot};
pub use progress::{LineBuffer, PullProgress, SUCCESS_STATUS};
pub use sink::{DownloadSink, LogSink};
