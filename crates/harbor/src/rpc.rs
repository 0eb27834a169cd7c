//! Newline-delimited JSON adapter over the orchestrator surface.
//!
//! This is the transport boundary: each request carries either an explicit
//! `agent_id` or a transport `session_key`, which is resolved to a stable
//! agent id through the session registry before anything reaches the
//! orchestrator. The RPC framing itself stays deliberately minimal; richer
//! transports layer on top of the same operations.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use harbor_core::AgentId;
use harbor_orchestrator::{Orchestrator, SessionConfig};
use harbor_session::SessionRegistry;

/// One request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

/// Caller identity: an explicit agent id, or a transport session key the
/// registry resolves.
#[derive(Debug, Deserialize)]
pub struct Caller {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    GetOrCreate {
        #[serde(flatten)]
        caller: Caller,
        #[serde(default)]
        model: Option<String>,
    },
    Turn {
        #[serde(flatten)]
        caller: Caller,
        text: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    List,
    Status {
        #[serde(flatten)]
        caller: Caller,
    },
    Stop {
        #[serde(flatten)]
        caller: Caller,
    },
    Restart {
        #[serde(flatten)]
        caller: Caller,
    },
    Remove {
        #[serde(flatten)]
        caller: Caller,
    },
    ReapInactive {
        threshold_secs: u64,
    },
    EndSession {
        session_key: String,
    },
    Shutdown,
}

/// One response line.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: u64, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Dispatches parsed requests into the orchestrator.
pub struct RpcHandler {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<SessionRegistry>,
}

impl RpcHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }

    fn resolve(&self, caller: &Caller) -> Result<AgentId, String> {
        if let Some(agent_id) = &caller.agent_id {
            if let Some(key) = &caller.session_key {
                self.registry.touch(key);
            }
            return Ok(AgentId::new(agent_id.clone()));
        }
        if let Some(key) = &caller.session_key {
            return Ok(self.registry.resolve_or_create(key));
        }
        Err("request needs agent_id or session_key".to_string())
    }

    /// Handle one request line. Returns `None` once the broker should exit.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparsable request line");
                return Some(Response::err(0, format!("bad request: {e}")));
            }
        };

        let id = request.id;
        debug!(id, "dispatching request");

        let response = match request.op {
            Op::GetOrCreate { caller, model } => match self.resolve(&caller) {
                Ok(agent_id) => {
                    let config = SessionConfig {
                        model,
                        ..SessionConfig::default()
                    };
                    match self.orchestrator.get_or_create(&agent_id, config).await {
                        Ok(session) => Response::ok(
                            id,
                            json!({
                                "agent_id": session.agent_id(),
                                "sandbox_id": session.sandbox_id(),
                                "binding": session.binding(),
                            }),
                        ),
                        Err(e) => Response::err(id, e),
                    }
                }
                Err(e) => Response::err(id, e),
            },

            Op::Turn {
                caller,
                text,
                timeout_secs,
            } => match self.resolve(&caller) {
                Ok(agent_id) => {
                    let deadline = timeout_secs.map(Duration::from_secs);
                    match self.orchestrator.turn(&agent_id, &text, deadline).await {
                        Ok(reply) => Response::ok(id, json!({ "reply": reply })),
                        Err(e) => Response::err(id, e),
                    }
                }
                Err(e) => Response::err(id, e),
            },

            Op::List => {
                let sessions = self.orchestrator.list().await;
                Response::ok(id, json!({ "sessions": sessions }))
            }

            Op::Status { caller } => match self.resolve(&caller) {
                Ok(agent_id) => match self.orchestrator.status(&agent_id).await {
                    Ok(detail) => Response::ok(id, json!(detail)),
                    Err(e) => Response::err(id, e),
                },
                Err(e) => Response::err(id, e),
            },

            Op::Stop { caller } => match self.resolve(&caller) {
                Ok(agent_id) => match self.orchestrator.stop(&agent_id).await {
                    Ok(()) => Response::ok(id, json!({ "stopped": agent_id })),
                    Err(e) => Response::err(id, e),
                },
                Err(e) => Response::err(id, e),
            },

            Op::Restart { caller } => match self.resolve(&caller) {
                Ok(agent_id) => match self.orchestrator.restart(&agent_id).await {
                    Ok(()) => Response::ok(id, json!({ "restarted": agent_id })),
                    Err(e) => Response::err(id, e),
                },
                Err(e) => Response::err(id, e),
            },

            Op::Remove { caller } => match self.resolve(&caller) {
                Ok(agent_id) => match self.orchestrator.remove(&agent_id).await {
                    Ok(()) => Response::ok(id, json!({ "removed": agent_id })),
                    Err(e) => Response::err(id, e),
                },
                Err(e) => Response::err(id, e),
            },

            Op::ReapInactive { threshold_secs } => {
                let report = self
                    .orchestrator
                    .reap_inactive(Duration::from_secs(threshold_secs))
                    .await;
                Response::ok(id, json!(report))
            }

            Op::EndSession { session_key } => {
                let agent_id = self.registry.end(&session_key);
                if let Some(agent_id) = &agent_id {
                    // Ephemeral sessions die with their transport mapping;
                    // persistent ones survive for the agent's return.
                    self.orchestrator.detach_agent(agent_id).await;
                }
                Response::ok(id, json!({ "agent_id": agent_id }))
            }

            Op::Shutdown => {
                self.orchestrator.shutdown().await;
                return None;
            }
        };

        Some(response)
    }
}
