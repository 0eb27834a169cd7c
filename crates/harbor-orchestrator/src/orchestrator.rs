//! The top-level coordinator for agent sessions and their sandboxes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use harbor_auth::AuthManager;
use harbor_core::{AgentId, SessionBinding};
use harbor_docker::{
    sandbox_dockerfile, DriverError, MountSpec, SandboxDriver, SandboxSpec,
};
use harbor_index::{SandboxIndex, SandboxRecord, SandboxState};
use harbor_session::AgentSession;
use harbor_settings::HarborSettings;

use crate::bridge::{await_bridge_ready, bridge_launch_command};
use crate::error::{OrchestratorError, Result};

const WORKSPACE_MOUNT: &str = "/app/workspace";
const CONFIG_MOUNT: &str = "/app/config";
const SANDBOX_USER: &str = "codex";

/// Per-session knobs the caller may override; everything else comes from
/// the broker settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub model: Option<String>,
    pub binding: SessionBinding,
}

/// One row of `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub agent_id: AgentId,
    pub sandbox_id: String,
    pub sandbox_name: String,
    pub state: SandboxState,
    pub engine_status: String,
    pub model: String,
    pub created_at: i64,
    pub last_active: i64,
    pub cpu_percent: f64,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub workspace_path: PathBuf,
}

/// Full detail for `status(agent_id)`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub provider: String,
    pub approval_mode: String,
    pub reasoning_level: String,
    pub binding: SessionBinding,
    pub config_path: PathBuf,
    pub recent_logs: Vec<String>,
    /// Type tags of the bridge's most recent Assistant events.
    pub recent_event_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReapFailure {
    pub agent_id: AgentId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub removed: Vec<AgentId>,
    pub failed: Vec<ReapFailure>,
}

/// Coordinates sandbox provisioning, rehydration, turns, reaping, and
/// shutdown for every agent the broker serves.
pub struct Orchestrator {
    settings: HarborSettings,
    driver: Arc<SandboxDriver>,
    index: Arc<SandboxIndex>,
    auth: Arc<AuthManager>,

    sessions: Mutex<HashMap<AgentId, Arc<AgentSession>>>,
    /// Serializes get-or-create per agent so concurrent callers cannot
    /// provision two sandboxes for the same id.
    creation_locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,

    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        settings: HarborSettings,
        driver: Arc<SandboxDriver>,
        index: Arc<SandboxIndex>,
        auth: Arc<AuthManager>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            driver,
            index,
            auth,
            sessions: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            reaper: std::sync::Mutex::new(None),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the background reaper at the configured cadence.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let interval =
                Duration::from_secs(orchestrator.settings.server.reaper_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("reaper stopping");
                            return;
                        }
                        continue;
                    }
                }

                let idle =
                    Duration::from_secs(orchestrator.settings.server.session_idle_timeout_secs);
                let report = orchestrator.reap_inactive(idle).await;
                if !report.removed.is_empty() || !report.failed.is_empty() {
                    info!(
                        removed = report.removed.len(),
                        failed = report.failed.len(),
                        "reaper pass complete"
                    );
                }

                orchestrator.evict_vanished().await;
            }
        });

        *self.reaper.lock().expect("reaper slot poisoned") = Some(handle);
    }

    /// Resolve the agent's session, reconnecting to or provisioning its
    /// sandbox as needed.
    pub async fn get_or_create(
        &self,
        agent_id: &AgentId,
        config: SessionConfig,
    ) -> Result<Arc<AgentSession>> {
        let agent_lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(agent_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _creating = agent_lock.lock().await;

        if let Some(existing) = self.sessions.lock().await.get(agent_id).cloned() {
            self.index.update_last_active(agent_id).await?;
            return Ok(existing);
        }

        if let Some(record) = self.index.get(agent_id).await {
            match self.rehydrate(&record).await {
                Ok(Some(session)) => return Ok(session),
                Ok(None) => {
                    info!(agent_id = %agent_id, "stale sandbox record evicted, creating anew");
                }
                Err(e) => return Err(e),
            }
        }

        self.provision(agent_id, config).await
    }

    /// One turn against the agent's sandbox, provisioning it on first use.
    pub async fn turn(
        &self,
        agent_id: &AgentId,
        text: &str,
        deadline: Option<Duration>,
    ) -> Result<String> {
        let session = self.get_or_create(agent_id, SessionConfig::default()).await?;
        let deadline = deadline.unwrap_or(Duration::from_secs(
            self.settings.server.turn_timeout_default_secs,
        ));

        let reply = session.send_turn(text, deadline).await?;
        self.index.update_last_active(agent_id).await?;
        Ok(reply)
    }

    /// Reconnect to the sandbox named in a persisted record.
    ///
    /// Returns `Ok(None)` after evicting the record when the engine object
    /// is gone, so the caller can fall through to a fresh create.
    async fn rehydrate(&self, record: &SandboxRecord) -> Result<Option<Arc<AgentSession>>> {
        let state = match self.driver.get_container(&record.sandbox_id).await {
            Ok(state) => state,
            Err(DriverError::NotFound(_)) => {
                self.index.remove(&record.agent_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !state.running {
            info!(agent_id = %record.agent_id, "starting stopped sandbox");
            self.driver.start(&record.sandbox_id).await?;
            self.driver
                .wait_ready(
                    &record.sandbox_id,
                    None,
                    SANDBOX_USER,
                    Duration::from_secs(self.settings.sandbox.startup_timeout_secs),
                    Duration::from_secs(1),
                )
                .await?;
            await_bridge_ready(
                &self.driver,
                &record.sandbox_id,
                SANDBOX_USER,
                Duration::from_secs(self.settings.sandbox.ready_timeout_secs),
                Duration::from_secs(2),
            )
            .await?;
        }

        let session = Arc::new(AgentSession::new(
            record.agent_id.clone(),
            record.sandbox_id.clone(),
            record.binding,
            Arc::clone(&self.driver),
        ));
        session.mark_auth_complete();

        // Records written by older brokers may predate the session id field.
        if record.persistent_session_id.is_none() {
            let session_id = format!("persistent-{}", record.agent_id);
            self.index
                .update_persistent_session_id(&record.agent_id, &session_id)
                .await?;
        }

        self.index
            .update_state(&record.agent_id, SandboxState::Running)
            .await?;
        self.sessions
            .lock()
            .await
            .insert(record.agent_id.clone(), Arc::clone(&session));

        info!(agent_id = %record.agent_id, sandbox = %record.sandbox_name, "rehydrated session");
        Ok(Some(session))
    }

    /// Provision a fresh sandbox for an agent with no usable record.
    async fn provision(
        &self,
        agent_id: &AgentId,
        config: SessionConfig,
    ) -> Result<Arc<AgentSession>> {
        let cap = self.settings.server.max_concurrent_sessions;
        if self.sessions.lock().await.len() >= cap {
            return Err(OrchestratorError::CapExceeded { limit: cap });
        }

        info!(agent_id = %agent_id, "provisioning sandbox");

        self.driver
            .ensure_image(&sandbox_dockerfile(), &self.settings.sandbox.image_tag)
            .await?;

        let agent_dir = self
            .settings
            .server
            .data_dir
            .join("agents")
            .join(agent_id.as_str());
        let workspace_dir = agent_dir.join("workspace");
        let config_dir = agent_dir.join("config");
        for dir in [&workspace_dir, &config_dir] {
            std::fs::create_dir_all(dir).map_err(|source| OrchestratorError::DataDir {
                path: dir.clone(),
                source,
            })?;
        }

        let session_id = format!("persistent-{}-{}", agent_id, uuid::Uuid::new_v4());
        let bundle = self.auth.session_bundle(&session_id).await?;

        self.write_config_files(&config_dir, &bundle.auth_file)?;

        let model = config
            .model
            .unwrap_or_else(|| self.settings.assistant.model.clone());

        let mut env = bundle.environment.clone();
        env.insert("WORKSPACE_DIR".into(), WORKSPACE_MOUNT.into());
        env.insert(
            "CODEX_CONFIG_PATH".into(),
            format!("{CONFIG_MOUNT}/config.toml"),
        );
        env.insert("CODEX_MODEL".into(), model.clone());
        env.insert("AGENT_ID".into(), agent_id.as_str().into());
        env.insert("SESSION_ID".into(), session_id.clone());
        env.insert("TERM".into(), "xterm-256color".into());
        env.insert("HOME".into(), "/app".into());
        env.insert("PYTHONUNBUFFERED".into(), "1".into());
        env.insert("NODE_ENV".into(), "production".into());
        let include_reasoning = if self.settings.assistant.include_reasoning { "1" } else { "0" };
        env.insert("BRIDGE_INCLUDE_REASONING".into(), include_reasoning.into());

        let sandbox_name = agent_id.sandbox_name();

        // A container by this name without an index entry is debris from an
        // interrupted run; clear it before creating.
        if self.driver.get_container(&sandbox_name).await.is_ok() {
            warn!(name = %sandbox_name, "removing leftover container");
            let _ = self.driver.remove(&sandbox_name, true).await;
        }

        let spec = SandboxSpec {
            name: sandbox_name.clone(),
            image: self.settings.sandbox.image_tag.clone(),
            command: bridge_launch_command(WORKSPACE_MOUNT),
            env,
            mounts: vec![
                MountSpec::read_write(&workspace_dir, WORKSPACE_MOUNT),
                MountSpec::read_only(&config_dir, CONFIG_MOUNT),
            ],
            workdir: WORKSPACE_MOUNT.to_string(),
            user: SANDBOX_USER.to_string(),
            memory_limit_bytes: self.settings.sandbox.memory_limit_bytes(),
            nano_cpus: Some(self.settings.sandbox.nano_cpus()),
            network_mode: self.settings.sandbox.network_mode.clone(),
        };

        let sandbox_id = self.driver.create(&spec).await?;

        let now = harbor_index::now_epoch();
        let record = SandboxRecord {
            agent_id: agent_id.clone(),
            sandbox_id: sandbox_id.clone(),
            sandbox_name,
            workspace_path: workspace_dir,
            config_path: config_dir,
            model,
            provider: self.settings.assistant.provider.clone(),
            approval_mode: self.settings.assistant.approval_mode.clone(),
            reasoning_level: self.settings.assistant.reasoning_level.clone(),
            binding: config.binding,
            state: SandboxState::Creating,
            created_at: now,
            last_active: now,
            persistent_session_id: Some(session_id),
        };
        self.index.register(record).await?;

        if let Err(e) = self.boot_sandbox(&sandbox_id).await {
            error!(agent_id = %agent_id, error = %e, "provisioning failed, rolling back");
            let rollback = self.destroy_sandbox(agent_id, &sandbox_id).await;
            if let Some(reason) = rollback {
                warn!(agent_id = %agent_id, reason = %reason, "rollback incomplete");
            }
            return Err(e);
        }

        self.index
            .update_state(agent_id, SandboxState::Running)
            .await?;

        let session = Arc::new(AgentSession::new(
            agent_id.clone(),
            sandbox_id,
            config.binding,
            Arc::clone(&self.driver),
        ));
        session.mark_auth_complete();
        self.sessions
            .lock()
            .await
            .insert(agent_id.clone(), Arc::clone(&session));

        info!(agent_id = %agent_id, "sandbox provisioned and ready");
        Ok(session)
    }

    fn write_config_files(&self, config_dir: &PathBuf, auth_file: &[u8]) -> Result<()> {
        let write = |path: PathBuf, bytes: &[u8]| -> Result<()> {
            std::fs::write(&path, bytes).map_err(|source| OrchestratorError::DataDir {
                path: path.clone(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).map_err(
                    |source| OrchestratorError::DataDir { path, source },
                )?;
            }
            Ok(())
        };

        write(config_dir.join("auth.json"), auth_file)?;
        let assistant_config = self
            .auth
            .render_assistant_config(&self.settings.assistant);
        write(config_dir.join("config.toml"), assistant_config.as_bytes())
    }

    /// Start the container and wait for both the engine and the bridge.
    async fn boot_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.driver.start(sandbox_id).await?;
        self.driver
            .wait_ready(
                sandbox_id,
                None,
                SANDBOX_USER,
                Duration::from_secs(self.settings.sandbox.startup_timeout_secs),
                Duration::from_secs(1),
            )
            .await?;
        await_bridge_ready(
            &self.driver,
            sandbox_id,
            SANDBOX_USER,
            Duration::from_secs(self.settings.sandbox.ready_timeout_secs),
            Duration::from_secs(2),
        )
        .await
    }

    /// Engine-only stop; the record and data stay.
    pub async fn stop(&self, agent_id: &AgentId) -> Result<()> {
        let record = self
            .index
            .get(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.clone()))?;

        self.sessions.lock().await.remove(agent_id);

        match self
            .driver
            .stop(
                &record.sandbox_id,
                Duration::from_secs(self.settings.sandbox.stop_grace_secs),
            )
            .await
        {
            Ok(()) | Err(DriverError::Conflict(_)) => {}
            Err(DriverError::NotFound(_)) => {
                self.index.remove(agent_id).await?;
                return Err(OrchestratorError::UnknownAgent(agent_id.clone()));
            }
            Err(e) => {
                self.index.update_state(agent_id, SandboxState::Error).await?;
                return Err(e.into());
            }
        }

        self.index.update_state(agent_id, SandboxState::Stopped).await?;
        info!(agent_id = %agent_id, "sandbox stopped");
        Ok(())
    }

    /// Stop (if running) and start again, waiting for readiness.
    pub async fn restart(&self, agent_id: &AgentId) -> Result<()> {
        let record = self
            .index
            .get(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.clone()))?;

        self.sessions.lock().await.remove(agent_id);

        match self.driver.get_container(&record.sandbox_id).await {
            Ok(state) if state.running => {
                self.driver
                    .stop(
                        &record.sandbox_id,
                        Duration::from_secs(self.settings.sandbox.stop_grace_secs),
                    )
                    .await?;
            }
            Ok(_) => {}
            Err(DriverError::NotFound(_)) => {
                self.index.remove(agent_id).await?;
                return Err(OrchestratorError::UnknownAgent(agent_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.boot_sandbox(&record.sandbox_id).await?;
        self.index.update_state(agent_id, SandboxState::Running).await?;
        info!(agent_id = %agent_id, "sandbox restarted");
        Ok(())
    }

    /// Transport-level disconnect hook.
    ///
    /// Ephemeral sessions are destroyed with their sandbox; persistent ones
    /// are detached and preserved for the agent's next connection.
    pub async fn detach_agent(&self, agent_id: &AgentId) {
        let session = self.sessions.lock().await.remove(agent_id);
        if let Some(session) = session {
            self.cleanup_session(&session, false).await;
            return;
        }

        if let Some(record) = self.index.get(agent_id).await {
            if record.binding == SessionBinding::Ephemeral {
                if let Some(reason) = self.destroy_sandbox(agent_id, &record.sandbox_id).await {
                    warn!(agent_id = %agent_id, reason = %reason, "ephemeral detach incomplete");
                }
            } else if let Err(e) = self.index.update_last_active(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "failed to touch detached agent");
            }
        }
    }

    /// Full removal: sandbox, per-agent data tree, index entry.
    pub async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        let record = self
            .index
            .get(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.clone()))?;

        let session = self.sessions.lock().await.remove(agent_id);
        if let Some(session) = session {
            self.cleanup_session(&session, true).await;
        } else if let Some(reason) = self.destroy_sandbox(agent_id, &record.sandbox_id).await {
            warn!(agent_id = %agent_id, reason = %reason, "removal finished with errors");
        }

        info!(agent_id = %agent_id, "agent removed");
        Ok(())
    }

    /// Read-through list with engine state and resource stats. Records whose
    /// engine object vanished are evicted on the way.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();

        for record in self.index.list_all().await {
            match self.driver.get_container(&record.sandbox_id).await {
                Ok(state) => {
                    let stats = self.driver.stats(&record.sandbox_id).await.unwrap_or_default();
                    summaries.push(summary_from(&record, state.status, &stats));
                }
                Err(DriverError::NotFound(_)) => {
                    warn!(agent_id = %record.agent_id, "sandbox vanished, evicting record");
                    self.sessions.lock().await.remove(&record.agent_id);
                    let _ = self.index.remove(&record.agent_id).await;
                }
                Err(e) => {
                    warn!(agent_id = %record.agent_id, error = %e, "skipping unlistable sandbox");
                }
            }
        }

        summaries
    }

    /// Detailed status for one agent, including a log tail.
    pub async fn status(&self, agent_id: &AgentId) -> Result<SessionDetail> {
        let record = self
            .index
            .get(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.clone()))?;

        let state = match self.driver.get_container(&record.sandbox_id).await {
            Ok(state) => state,
            Err(DriverError::NotFound(_)) => {
                self.sessions.lock().await.remove(agent_id);
                self.index.remove(agent_id).await?;
                return Err(OrchestratorError::UnknownAgent(agent_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let stats = self.driver.stats(&record.sandbox_id).await.unwrap_or_default();
        let recent_logs = self
            .driver
            .logs_tail(&record.sandbox_id, 10)
            .await
            .unwrap_or_default();
        let recent_event_types = self.recent_event_types(&record.sandbox_id).await;

        Ok(SessionDetail {
            summary: summary_from(&record, state.status, &stats),
            provider: record.provider.clone(),
            approval_mode: record.approval_mode.clone(),
            reasoning_level: record.reasoning_level.clone(),
            binding: record.binding,
            config_path: record.config_path.clone(),
            recent_logs,
            recent_event_types,
        })
    }

    /// Tail of the sandbox event log, reduced to event type tags.
    async fn recent_event_types(&self, sandbox_id: &str) -> Vec<String> {
        let result = self
            .driver
            .exec(
                sandbox_id,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("tail -n 20 {} 2>/dev/null", harbor_core::EVENTS_LOG_FILE),
                ],
                SANDBOX_USER,
                None,
                None,
                None,
            )
            .await;

        match result {
            Ok(output) if output.success() => output
                .output
                .lines()
                .filter_map(|line| serde_json::from_str::<harbor_core::Event>(line).ok())
                .map(|event| event.msg.kind().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Evict every session idle past the threshold. Sessions with a turn in
    /// flight are skipped; they are active by definition.
    pub async fn reap_inactive(&self, threshold: Duration) -> ReapReport {
        let mut report = ReapReport::default();

        for record in self.index.list_idle(threshold).await {
            let agent_id = record.agent_id.clone();

            // Hold the turn slot while destroying so a turn can never start
            // against a half-removed sandbox.
            let session = self.sessions.lock().await.get(&agent_id).cloned();
            let _turn_guard = match &session {
                Some(session) => match session.try_begin_turn() {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        debug!(agent_id = %agent_id, "skipping reap, turn in flight");
                        continue;
                    }
                },
                None => None,
            };

            match self.remove(&agent_id).await {
                Ok(()) => report.removed.push(agent_id),
                Err(e) => report.failed.push(ReapFailure {
                    agent_id,
                    reason: e.to_string(),
                }),
            }
        }

        report
    }

    /// Drop index entries whose engine object no longer exists.
    async fn evict_vanished(&self) {
        for record in self.index.list_all().await {
            if !record.state.has_engine_object() {
                continue;
            }
            if let Err(DriverError::NotFound(_)) =
                self.driver.get_container(&record.sandbox_id).await
            {
                warn!(agent_id = %record.agent_id, "engine object vanished, evicting");
                self.sessions.lock().await.remove(&record.agent_id);
                let _ = self.index.remove(&record.agent_id).await;
            }
        }
    }

    /// Race-safe session cleanup.
    ///
    /// The cleanup lock is held across the whole sequence. Repeated and
    /// concurrent calls are no-ops once the first completes; failures are
    /// recorded on the session rather than surfaced, so eviction always
    /// converges.
    pub async fn cleanup_session(&self, session: &Arc<AgentSession>, explicit_remove: bool) {
        let mut flags = session.cleanup().lock().await;

        if flags.completed {
            debug!(agent_id = %session.agent_id(), "cleanup already completed");
            return;
        }
        if flags.in_progress {
            debug!(agent_id = %session.agent_id(), "cleanup already in progress");
            return;
        }
        flags.in_progress = true;

        if session.binding().is_persistent() && !explicit_remove {
            // Agent-pinned sandboxes survive detach; only refresh activity.
            if let Err(e) = self.index.update_last_active(session.agent_id()).await {
                flags.error = Some(e.to_string());
            }
            debug!(agent_id = %session.agent_id(), "detached persistent session, sandbox preserved");
        } else {
            session.end_conversation().await;
            flags.error = self
                .destroy_sandbox(session.agent_id(), session.sandbox_id())
                .await;
        }

        flags.completed = true;
        flags.in_progress = false;
    }

    /// Stop, remove, and scrub one sandbox. Engine conflicts and not-found
    /// responses count as success; the first real failure is returned as a
    /// description, and later steps still run.
    async fn destroy_sandbox(&self, agent_id: &AgentId, sandbox_id: &str) -> Option<String> {
        let mut first_error: Option<String> = None;
        let mut note = |e: String| {
            warn!(agent_id = %agent_id, error = %e, "cleanup step failed");
            if first_error.is_none() {
                first_error = Some(e);
            }
        };

        let grace = Duration::from_secs(self.settings.sandbox.stop_grace_secs);
        match self.driver.stop(sandbox_id, grace).await {
            Ok(()) => {}
            Err(DriverError::NotFound(_)) | Err(DriverError::Conflict(_)) => {}
            Err(e) => note(format!("stop: {e}")),
        }

        match self.driver.remove(sandbox_id, true).await {
            Ok(()) => {}
            Err(DriverError::NotFound(_)) | Err(DriverError::Conflict(_)) => {}
            Err(e) => note(format!("remove: {e}")),
        }

        // Temporary directories go last, after the engine can no longer
        // touch the mounts.
        let agent_dir = self
            .settings
            .server
            .data_dir
            .join("agents")
            .join(agent_id.as_str());
        match std::fs::remove_dir_all(&agent_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => note(format!("data dir: {e}")),
        }

        if let Err(e) = self.index.remove(agent_id).await {
            note(format!("index: {e}"));
        }

        first_error
    }

    /// Drain every live session and stop the reaper. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already performed");
            return;
        }

        info!("orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);

        let reaper = self.reaper.lock().expect("reaper slot poisoned").take();
        if let Some(handle) = reaper {
            handle.abort();
        }

        let sessions: Vec<Arc<AgentSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.cleanup_session(&session, false).await;
        }

        info!("orchestrator shutdown complete");
    }
}

fn summary_from(
    record: &SandboxRecord,
    engine_status: &str,
    stats: &harbor_docker::SandboxStats,
) -> SessionSummary {
    SessionSummary {
        agent_id: record.agent_id.clone(),
        sandbox_id: record.sandbox_id.clone(),
        sandbox_name: record.sandbox_name.clone(),
        state: record.state,
        engine_status: engine_status.to_string(),
        model: record.model.clone(),
        created_at: record.created_at,
        last_active: record.last_active,
        cpu_percent: stats.cpu_percent,
        memory_usage_mb: stats.memory_usage_bytes / (1024 * 1024),
        memory_limit_mb: stats.memory_limit_bytes / (1024 * 1024),
        workspace_path: record.workspace_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_auth::CredentialStore;
    use harbor_settings::AuthSettings;
    use tempfile::TempDir;

    fn orchestrator_with(dir: &TempDir, max_sessions: usize) -> Arc<Orchestrator> {
        let mut settings = HarborSettings::default();
        settings.server.data_dir = dir.path().join("data");
        settings.server.max_concurrent_sessions = max_sessions;
        settings.auth = AuthSettings {
            credential_file: Some(dir.path().join("credentials.json")),
            ..AuthSettings::default()
        };

        let driver = Arc::new(SandboxDriver::new(&settings.sandbox).expect("driver handle"));
        let index = Arc::new(SandboxIndex::open(&settings.server.data_dir).expect("index"));
        let store = Arc::new(CredentialStore::new(&settings.auth));
        let auth = Arc::new(AuthManager::new(store, settings.auth.clone()));
        Orchestrator::new(settings, driver, index, auth)
    }

    fn session_for(orchestrator: &Orchestrator, agent: &str) -> Arc<AgentSession> {
        Arc::new(AgentSession::new(
            AgentId::new(agent),
            format!("sbx-{agent}"),
            SessionBinding::Persistent,
            Arc::clone(&orchestrator.driver),
        ))
    }

    #[tokio::test]
    async fn cap_of_zero_rejects_provisioning() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 0);

        let err = orchestrator
            .get_or_create(&AgentId::new("a1"), SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CapExceeded { limit: 0 }));
    }

    #[tokio::test]
    async fn unknown_agent_surfaces_on_control_operations() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);
        let ghost = AgentId::new("ghost");

        assert!(matches!(
            orchestrator.stop(&ghost).await,
            Err(OrchestratorError::UnknownAgent(_))
        ));
        assert!(matches!(
            orchestrator.restart(&ghost).await,
            Err(OrchestratorError::UnknownAgent(_))
        ));
        assert!(matches!(
            orchestrator.remove(&ghost).await,
            Err(OrchestratorError::UnknownAgent(_))
        ));
        assert!(matches!(
            orchestrator.status(&ghost).await,
            Err(OrchestratorError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn reap_on_empty_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);

        let report = orchestrator.reap_inactive(Duration::from_secs(1)).await;
        assert!(report.removed.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn detach_cleanup_preserves_persistent_sandbox() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);
        let session = session_for(&orchestrator, "a1");

        orchestrator.cleanup_session(&session, false).await;

        let flags = session.cleanup().lock().await;
        assert!(flags.completed);
        assert!(!flags.in_progress);
        // Detach never touches the engine, so no error can be recorded.
        assert!(flags.error.is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);
        let session = session_for(&orchestrator, "a1");

        orchestrator.cleanup_session(&session, false).await;
        orchestrator.cleanup_session(&session, false).await;
        orchestrator.cleanup_session(&session, true).await;

        let flags = session.cleanup().lock().await;
        assert!(flags.completed);
        assert!(!flags.in_progress);
    }

    #[tokio::test]
    async fn explicit_remove_cleanup_records_engine_failure_but_completes() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);
        let session = session_for(&orchestrator, "a1");

        // No engine object exists for the fake sandbox id; depending on the
        // environment the engine answers not-found (success for cleanup) or
        // is unreachable (recorded error). Either way cleanup completes.
        orchestrator.cleanup_session(&session, true).await;

        let flags = session.cleanup().lock().await;
        assert!(flags.completed);
        assert!(!flags.in_progress);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_drains_sessions() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);

        let session = session_for(&orchestrator, "a1");
        orchestrator
            .sessions
            .lock()
            .await
            .insert(AgentId::new("a1"), Arc::clone(&session));

        orchestrator.shutdown().await;
        assert!(orchestrator.sessions.lock().await.is_empty());
        assert!(session.cleanup().lock().await.completed);

        // Second shutdown is a no-op.
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn reaper_task_starts_and_stops_with_shutdown() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, 5);

        orchestrator.spawn_reaper();
        assert!(orchestrator.reaper.lock().unwrap().is_some());

        orchestrator.shutdown().await;
        assert!(orchestrator.reaper.lock().unwrap().is_none());
    }
}
