//! Durable map of agent ids to sandbox records.
//!
//! The index is the broker's source of truth across restarts: one JSON file
//! under `data_dir/metadata/`, rewritten atomically on every mutation. All
//! operations are serialized behind a single async mutex, and the on-disk
//! file only ever contains states the broker has committed to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use harbor_core::{AgentId, SessionBinding};

pub const METADATA_DIR: &str = "metadata";
pub const INDEX_FILE: &str = "agent_containers.json";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Lifecycle state of a sandbox as recorded by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SandboxState {
    /// States in which `sandbox_id` refers to a live engine object.
    pub fn has_engine_object(self) -> bool {
        matches!(self, Self::Creating | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One persisted agent-to-sandbox binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub agent_id: AgentId,
    pub sandbox_id: String,
    pub sandbox_name: String,
    pub workspace_path: PathBuf,
    pub config_path: PathBuf,
    pub model: String,
    pub provider: String,
    pub approval_mode: String,
    pub reasoning_level: String,
    #[serde(default)]
    pub binding: SessionBinding,
    pub state: SandboxState,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds; never precedes `created_at`
    pub last_active: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_session_id: Option<String>,
}

impl SandboxRecord {
    pub fn idle_for(&self, now: i64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.last_active).max(0) as u64)
    }
}

/// Counters over the whole index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_agents: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub recently_active: usize,
}

/// The durable agent → sandbox map.
pub struct SandboxIndex {
    file: PathBuf,
    entries: Mutex<HashMap<AgentId, SandboxRecord>>,
}

impl SandboxIndex {
    /// Open (or initialize) the index under `data_dir`.
    ///
    /// A corrupt or unreadable file logs a warning and starts fresh; it is
    /// never silently partially loaded.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let metadata_dir = data_dir.join(METADATA_DIR);
        std::fs::create_dir_all(&metadata_dir).map_err(|source| IndexError::Io {
            path: metadata_dir.clone(),
            source,
        })?;

        let file = metadata_dir.join(INDEX_FILE);
        let entries = match std::fs::read_to_string(&file) {
            Ok(raw) => match serde_json::from_str::<HashMap<AgentId, SandboxRecord>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "index file corrupt, starting fresh");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "index file unreadable, starting fresh");
                HashMap::new()
            }
        };

        info!(path = %file.display(), agents = entries.len(), "sandbox index opened");

        Ok(Self {
            file,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<AgentId, SandboxRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;

        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| IndexError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.file).map_err(|source| IndexError::Io {
            path: self.file.clone(),
            source,
        })?;

        debug!(agents = entries.len(), "index persisted");
        Ok(())
    }

    /// Insert or replace the record for an agent. At most one record per
    /// agent id exists at any time.
    pub async fn register(&self, record: SandboxRecord) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(record.agent_id.clone(), record);
        self.persist(&entries)
    }

    pub async fn get(&self, agent_id: &AgentId) -> Option<SandboxRecord> {
        self.entries.lock().await.get(agent_id).cloned()
    }

    pub async fn update_state(&self, agent_id: &AgentId, state: SandboxState) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(record) = entries.get_mut(agent_id) {
            record.state = state;
            record.last_active = now_epoch();
            self.persist(&entries)?;
        }
        Ok(())
    }

    pub async fn update_last_active(&self, agent_id: &AgentId) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(record) = entries.get_mut(agent_id) {
            record.last_active = now_epoch().max(record.created_at);
            self.persist(&entries)?;
        }
        Ok(())
    }

    pub async fn update_persistent_session_id(
        &self,
        agent_id: &AgentId,
        session_id: &str,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(record) = entries.get_mut(agent_id) {
            record.persistent_session_id = Some(session_id.to_string());
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Remove and return the record for an agent.
    pub async fn remove(&self, agent_id: &AgentId) -> Result<Option<SandboxRecord>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(agent_id);
        if removed.is_some() {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    pub async fn list_all(&self) -> Vec<SandboxRecord> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn list_running(&self) -> Vec<SandboxRecord> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|r| r.state == SandboxState::Running)
            .cloned()
            .collect()
    }

    /// Records whose `last_active` is older than the threshold.
    pub async fn list_idle(&self, threshold: Duration) -> Vec<SandboxRecord> {
        let now = now_epoch();
        self.entries
            .lock()
            .await
            .values()
            .filter(|r| r.idle_for(now) > threshold)
            .cloned()
            .collect()
    }

    /// Drop records older than `max_age` outright. Returns removed agent ids.
    pub async fn reap_stale(&self, max_age: Duration) -> Result<Vec<AgentId>> {
        let now = now_epoch();
        let mut entries = self.entries.lock().await;

        let stale: Vec<AgentId> = entries
            .values()
            .filter(|r| now.saturating_sub(r.created_at) > max_age.as_secs() as i64)
            .map(|r| r.agent_id.clone())
            .collect();

        for agent_id in &stale {
            entries.remove(agent_id);
            info!(agent_id = %agent_id, "removed stale index entry");
        }

        if !stale.is_empty() {
            self.persist(&entries)?;
        }
        Ok(stale)
    }

    pub async fn stats(&self) -> IndexStats {
        let now = now_epoch();
        let entries = self.entries.lock().await;

        IndexStats {
            total_agents: entries.len(),
            running: entries
                .values()
                .filter(|r| r.state == SandboxState::Running)
                .count(),
            stopped: entries
                .values()
                .filter(|r| r.state == SandboxState::Stopped)
                .count(),
            error: entries
                .values()
                .filter(|r| r.state == SandboxState::Error)
                .count(),
            recently_active: entries
                .values()
                .filter(|r| now.saturating_sub(r.last_active) < 3600)
                .count(),
        }
    }
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
