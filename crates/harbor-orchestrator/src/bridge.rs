//! Host side of the bridge contract: shipping the program into the sandbox
//! and probing its status file for readiness.

use std::time::Duration;

use tracing::debug;

use harbor_core::{BridgeStatus, STATUS_FILE};
use harbor_docker::{DriverError, SandboxDriver};

use crate::error::{OrchestratorError, Result};

/// Heredoc delimiter used when copying the bridge into the sandbox. The
/// launch command is invalid if this string appears in the script body; a
/// test pins that down.
const HEREDOC_DELIMITER: &str = "__HARBOR_BRIDGE__";

/// Path the bridge program is written to inside the sandbox.
const BRIDGE_PATH: &str = "/tmp/agent_bridge.py";

/// The bridge program shipped into every sandbox.
pub fn bridge_script() -> &'static str {
    include_str!("../assets/agent_bridge.py")
}

/// Shell command that materializes the bridge inside the sandbox and execs
/// it as the container's long-running process.
pub fn bridge_launch_command(workspace_dir: &str) -> Vec<String> {
    let script = format!(
        "cat <<'{delim}' > {path}\n{script}\n{delim}\nchmod 755 {path}\ncd {workspace}\nexec python3 {path}\n",
        delim = HEREDOC_DELIMITER,
        path = BRIDGE_PATH,
        script = bridge_script(),
        workspace = workspace_dir,
    );
    vec!["bash".to_string(), "-lc".to_string(), script]
}

/// Poll the bridge status file until it reports a ready state.
///
/// `Failed` aborts immediately; anything else keeps polling until the
/// deadline, after which provisioning is rolled back by the caller.
pub async fn await_bridge_ready(
    driver: &SandboxDriver,
    sandbox_id: &str,
    user: &str,
    deadline: Duration,
    interval: Duration,
) -> Result<()> {
    let started = tokio::time::Instant::now();

    loop {
        if started.elapsed() >= deadline {
            return Err(OrchestratorError::BridgeNotReady(format!(
                "no ready status within {}s",
                deadline.as_secs()
            )));
        }

        match driver
            .exec(
                sandbox_id,
                vec!["cat".to_string(), STATUS_FILE.to_string()],
                user,
                None,
                None,
                None,
            )
            .await
        {
            Ok(result) if result.success() => {
                match result.output.trim().parse::<BridgeStatus>() {
                    Ok(status) if status.is_ready() => {
                        debug!(sandbox_id = %&sandbox_id[..sandbox_id.len().min(12)], %status, "bridge ready");
                        return Ok(());
                    }
                    Ok(BridgeStatus::Failed) => {
                        return Err(OrchestratorError::BridgeNotReady(
                            "bridge reported failed".to_string(),
                        ));
                    }
                    Ok(status) => {
                        debug!(%status, "bridge not ready yet");
                    }
                    Err(e) => {
                        debug!(error = %e, "unreadable bridge status");
                    }
                }
            }
            Ok(_) => {
                // Status file not written yet.
            }
            Err(DriverError::NotFound(ctx)) => {
                return Err(OrchestratorError::Driver(DriverError::NotFound(ctx)));
            }
            Err(e) => {
                debug!(error = %e, "bridge status probe failed");
            }
        }

        tokio::time::sleep(interval).await;
    }
}
