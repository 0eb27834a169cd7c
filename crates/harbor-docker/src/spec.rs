//! Sandbox creation spec.

use std::collections::HashMap;
use std::path::PathBuf;

use bollard::models::{Mount, MountTypeEnum};

/// One host directory bind-mounted into the sandbox.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    pub(crate) fn to_engine_mount(&self) -> Mount {
        Mount {
            target: Some(self.container_path.clone()),
            source: Some(self.host_path.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(self.read_only),
            ..Default::default()
        }
    }
}

/// Everything the driver needs to create one sandbox container.
///
/// `auto_remove` is always off: sandboxes outlive the broker process and are
/// reaped explicitly.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Entrypoint is cleared; this command runs as pid 1.
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub workdir: String,
    pub user: String,
    pub memory_limit_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub network_mode: String,
}

impl SandboxSpec {
    /// Environment in the engine's `KEY=value` form, sorted for determinism.
    pub(crate) fn env_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        lines.sort();
        lines
    }
}
