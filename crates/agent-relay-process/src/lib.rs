//! Launching and supervising agent processes.
//!
//! - `shell` - Executable resolution and the non-interactive environment
//! - `supervisor` - Process groups, output events and cooperative stop

pub mod shell;
pub mod supervisor;

pub use shell::{NON_INTERACTIVE_ENV, augmented_path, resolve_executable_path};
pub use supervisor::{
    DEFAULT_STOP_GRACE, ExitReport, LaunchSpec, ProcessError, ProcessEvent, ProcessEvents,
    ProcessHandle, ProcessSupervisor,
};
