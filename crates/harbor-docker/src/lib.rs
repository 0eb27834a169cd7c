//! Thin async facade over the Docker engine for Harbor sandboxes.
//!
//! Every call that can block runs through the engine's HTTP API under a
//! bounded semaphore so a burst of session churn cannot overload the
//! daemon. Each operation carries its own timeout; callers cancel by
//! dropping the returned future.

pub mod driver;
pub mod error;
pub mod image;
pub mod spec;

pub use driver::{ExecOutput, SandboxDriver, SandboxState, SandboxStats};
pub use error::{DriverError, Result};
pub use image::sandbox_dockerfile;
pub use spec::{MountSpec, SandboxSpec};
