//! Top-level session and sandbox orchestration.
//!
//! The orchestrator maps agent ids to persistent sandboxes, reconnecting to
//! them across broker restarts; provisions and tears sandboxes down without
//! leaking resources under concurrent cleanup; and owns the host side of
//! the bridge channel, including the embedded bridge program itself.

pub mod bridge;
pub mod error;
pub mod orchestrator;

pub use bridge::{bridge_launch_command, bridge_script};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    Orchestrator, ReapReport, SessionConfig, SessionDetail, SessionSummary,
};
