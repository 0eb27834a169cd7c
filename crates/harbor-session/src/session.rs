//! The in-broker handle to one live sandbox + bridge pair.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use harbor_core::{
    AgentId, BridgeStatus, SessionBinding, INCOMING_FIFO, PROCESSING_SENTINEL, RESPONSE_FILE,
    STATUS_FILE,
};
use harbor_docker::SandboxDriver;

use crate::error::{Result, SessionError};

/// User every in-sandbox exec runs as.
const SANDBOX_USER: &str = "codex";

/// Cleanup bookkeeping guarded by the session's cleanup lock.
#[derive(Debug, Default)]
pub struct CleanupFlags {
    pub in_progress: bool,
    pub completed: bool,
    pub error: Option<String>,
}

/// The broker's handle to one agent's sandbox.
///
/// Exactly one turn may be in flight at a time; the turn lock also makes
/// this session the sole writer of the sandbox's incoming FIFO. The cleanup
/// lock and flags implement the race-safe teardown protocol.
#[derive(Debug)]
pub struct AgentSession {
    agent_id: AgentId,
    sandbox_id: String,
    binding: SessionBinding,
    driver: Arc<SandboxDriver>,

    turn_lock: Mutex<()>,
    poll_interval: Duration,

    conversation_active: AtomicBool,
    auth_setup_complete: AtomicBool,
    last_interaction: AtomicI64,
    turn_count: AtomicU64,

    cleanup: Mutex<CleanupFlags>,
}

impl AgentSession {
    pub fn new(
        agent_id: AgentId,
        sandbox_id: String,
        binding: SessionBinding,
        driver: Arc<SandboxDriver>,
    ) -> Self {
        Self {
            agent_id,
            sandbox_id,
            binding,
            driver,
            turn_lock: Mutex::new(()),
            poll_interval: Duration::from_secs(2),
            conversation_active: AtomicBool::new(true),
            auth_setup_complete: AtomicBool::new(false),
            last_interaction: AtomicI64::new(chrono::Utc::now().timestamp()),
            turn_count: AtomicU64::new(0),
            cleanup: Mutex::new(CleanupFlags::default()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn binding(&self) -> SessionBinding {
        self.binding
    }

    pub fn last_interaction(&self) -> i64 {
        self.last_interaction.load(Ordering::Relaxed)
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count.load(Ordering::Relaxed)
    }

    pub fn conversation_active(&self) -> bool {
        self.conversation_active.load(Ordering::Relaxed)
    }

    pub fn mark_auth_complete(&self) {
        self.auth_setup_complete.store(true, Ordering::Relaxed);
    }

    pub fn auth_setup_complete(&self) -> bool {
        self.auth_setup_complete.load(Ordering::Relaxed)
    }

    /// The cleanup lock + flags; held across the whole teardown sequence.
    pub fn cleanup(&self) -> &Mutex<CleanupFlags> {
        &self.cleanup
    }

    /// Claim the single in-flight turn slot, failing fast with `Busy`.
    pub fn try_begin_turn(&self) -> Result<MutexGuard<'_, ()>> {
        self.turn_lock.try_lock().map_err(|_| SessionError::Busy)
    }

    /// Send one turn and wait for the aggregated reply.
    ///
    /// A second concurrent call fails with [`SessionError::Busy`]. On
    /// deadline the session returns a timeout annotated with the last
    /// observed bridge status; the Assistant is left running so the next
    /// turn sees a consistent state.
    pub async fn send_turn(&self, text: &str, deadline: Duration) -> Result<String> {
        let _turn = self.try_begin_turn()?;

        debug!(agent_id = %self.agent_id, preview = %preview(text), "sending turn");

        // Clear the previous reply so the poll below cannot read stale text.
        let cleared = self
            .driver
            .exec(
                &self.sandbox_id,
                vec!["rm".into(), "-f".into(), RESPONSE_FILE.into()],
                SANDBOX_USER,
                None,
                None,
                None,
            )
            .await?;
        if !cleared.success() {
            return Err(SessionError::TurnFailed(format!(
                "failed to clear response file: {}",
                cleared.output.trim()
            )));
        }

        // Stream the payload to the FIFO through the exec's stdin. No shell
        // ever sees the text, so metacharacters and newlines pass verbatim.
        let mut payload = text.as_bytes().to_vec();
        if !payload.ends_with(b"\n") {
            payload.push(b'\n');
        }
        let written = self
            .driver
            .exec(
                &self.sandbox_id,
                vec!["sh".into(), "-c".into(), format!("cat > {INCOMING_FIFO}")],
                SANDBOX_USER,
                None,
                None,
                Some(&payload),
            )
            .await?;
        if !written.success() {
            return Err(SessionError::TurnFailed(format!(
                "failed to write submission: {}",
                written.output.trim()
            )));
        }

        let reply = self.await_reply(deadline).await?;

        self.last_interaction
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        self.turn_count.fetch_add(1, Ordering::Relaxed);

        info!(
            agent_id = %self.agent_id,
            reply_len = reply.len(),
            turns = self.turn_count(),
            "turn complete"
        );
        Ok(reply)
    }

    /// Poll the response and status files until the reply is finalized.
    async fn await_reply(&self, deadline: Duration) -> Result<String> {
        let started = tokio::time::Instant::now();
        let mut last_status = BridgeStatus::Processing.as_str().to_string();

        loop {
            if started.elapsed() >= deadline {
                warn!(agent_id = %self.agent_id, last_status = %last_status, "turn deadline elapsed");
                return Err(SessionError::TurnTimeout { last_status });
            }

            match self.read_file(RESPONSE_FILE).await {
                Ok(Some(raw)) => {
                    if let Some(reply) = finalized_reply(&raw) {
                        return Ok(reply);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(agent_id = %self.agent_id, error = %e, "response poll failed");
                }
            }

            // Surface terminal bridge states promptly instead of burning the
            // whole deadline.
            if let Ok(Some(raw)) = self.read_file(STATUS_FILE).await {
                if let Ok(status) = raw.trim().parse::<BridgeStatus>() {
                    last_status = status.as_str().to_string();
                    if status == BridgeStatus::Failed {
                        return Err(SessionError::AssistantFailed {
                            status: last_status,
                        });
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let result = self
            .driver
            .exec(
                &self.sandbox_id,
                vec!["cat".into(), path.into()],
                SANDBOX_USER,
                None,
                None,
                None,
            )
            .await?;
        if result.success() {
            Ok(Some(result.output))
        } else {
            Ok(None)
        }
    }

    /// Best-effort request for the Assistant to wind down, used by cleanup.
    pub async fn end_conversation(&self) {
        if !self.conversation_active.swap(false, Ordering::Relaxed) {
            return;
        }
        let result = self
            .driver
            .exec(
                &self.sandbox_id,
                vec!["sh".into(), "-c".into(), format!("cat > {INCOMING_FIFO}")],
                SANDBOX_USER,
                None,
                None,
                Some(b"exit\n"),
            )
            .await;
        if let Err(e) = result {
            debug!(agent_id = %self.agent_id, error = %e, "assistant exit request failed");
        }
    }
}

/// A reply is final once the response file is non-empty and no longer the
/// in-flight sentinel.
fn finalized_reply(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == PROCESSING_SENTINEL {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn preview(text: &str) -> String {
    let mut p: String = text.chars().take(80).collect();
    if text.chars().count() > 80 {
        p.push('…');
    }
    p
}
