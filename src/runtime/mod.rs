//! Runtime process supervision
//!
//! Provides functionality for:
//! - Spawning the runtime executable with its environment overlay
//! - Forwarding runtime output into the log
//! - Observing unexpected exits
//! - Two-phase shutdown driven by host exit events

pub mod platform;
pub mod shutdown;
pub mod supervisor;

pub use platform::{KillOutcome, ProcessControl, system_process_control};
pub use shutdown::{HostEvent, ShutdownHook, wait_for_signal};
pub use supervisor::{
    ProcessInfo, RuntimeState, RuntimeSupervisor, StartOutcome, SupervisorConfig, executable_name,
};
