//! Contract between the broker and the in-sandbox bridge program.
//!
//! The bridge runs inside every sandbox, launches the Assistant in its
//! protocol-stream mode, and proxies submissions and events through a small
//! set of message files. Both sides of that channel are described here: the
//! well-known paths, the closed status set, and the JSON envelopes written
//! to the Assistant's stdin / read from its stdout.

use serde::{Deserialize, Serialize};

/// Root of the message-file set inside the sandbox.
pub const MESSAGE_DIR: &str = "/tmp/agent_bridge";
/// FIFO (mode 0600) the broker writes one submission line into.
pub const INCOMING_FIFO: &str = "/tmp/agent_bridge/incoming.msg";
/// Regular file holding the latest turn's aggregated reply.
pub const RESPONSE_FILE: &str = "/tmp/agent_bridge/response.msg";
/// Regular file holding one of the [`BridgeStatus`] strings.
pub const STATUS_FILE: &str = "/tmp/agent_bridge/status";
/// Append-only log of raw Assistant events, one JSON object per line.
pub const EVENTS_LOG_FILE: &str = "/tmp/agent_bridge/events.log";

/// Sentinel the bridge writes to the response file while a turn is in flight.
pub const PROCESSING_SENTINEL: &str = "PROCESSING";

/// Lifecycle states reported by the bridge through the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Initializing,
    AgentReady,
    WaitingForMessage,
    Processing,
    Failed,
    ShuttingDown,
}

impl BridgeStatus {
    /// States in which the bridge accepts a new submission.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::AgentReady | Self::WaitingForMessage | Self::Processing)
    }

    /// States from which the bridge will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::ShuttingDown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AgentReady => "agent_ready",
            Self::WaitingForMessage => "waiting_for_message",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BridgeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "initializing" => Ok(Self::Initializing),
            "agent_ready" => Ok(Self::AgentReady),
            "waiting_for_message" => Ok(Self::WaitingForMessage),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "shutting_down" => Ok(Self::ShuttingDown),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A status-file value outside the closed set.
#[derive(Debug, thiserror::Error)]
#[error("unknown bridge status: {0:?}")]
pub struct UnknownStatus(pub String);

/// Submission envelope the bridge writes to the Assistant's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub op: SubmissionOp,
}

impl Submission {
    /// Wrap one user turn in the Assistant protocol envelope.
    pub fn user_input(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op: SubmissionOp::UserInput {
                items: vec![InputItem::Text { text: text.into() }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmissionOp {
    UserInput { items: Vec<InputItem> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text { text: String },
}

/// Event envelope read from the Assistant's stdout, one per line.
///
/// The `id` echoes a submission id or the session id for session-scoped
/// events. Unknown event types decode to [`EventMsg::Unknown`] so a newer
/// Assistant never breaks the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    SessionConfigured,
    AgentMessageDelta {
        #[serde(default)]
        delta: String,
    },
    AgentMessage {
        #[serde(default)]
        message: String,
    },
    TaskStarted {
        #[serde(default)]
        label: String,
    },
    TaskComplete,
    AgentReasoningDelta {
        #[serde(default)]
        delta: String,
    },
    AgentReasoning {
        #[serde(default)]
        text: String,
    },
    AgentReasoningSectionBreak,
    UserMessage,
    TokenCount {
        #[serde(default)]
        total: TokenTotals,
    },
    ExecApprovalRequest,
    StreamError {
        #[serde(default)]
        error: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl EventMsg {
    /// The event's wire-level type tag, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionConfigured => "session_configured",
            Self::AgentMessageDelta { .. } => "agent_message_delta",
            Self::AgentMessage { .. } => "agent_message",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskComplete => "task_complete",
            Self::AgentReasoningDelta { .. } => "agent_reasoning_delta",
            Self::AgentReasoning { .. } => "agent_reasoning",
            Self::AgentReasoningSectionBreak => "agent_reasoning_section_break",
            Self::UserMessage => "user_message",
            Self::TokenCount { .. } => "token_count",
            Self::ExecApprovalRequest => "exec_approval_request",
            Self::StreamError { .. } => "stream_error",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_envelope_matches_assistant_protocol() {
        let sub = Submission::user_input("write a hello world in python");
        let json = serde_json::to_value(&sub).unwrap();

        assert_eq!(json["op"]["type"], "user_input");
        assert_eq!(json["op"]["items"][0]["type"], "text");
        assert_eq!(json["op"]["items"][0]["text"], "write a hello world in python");
        assert!(!json["id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn submission_ids_are_unique() {
        let a = Submission::user_input("x");
        let b = Submission::user_input("x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn event_decodes_by_type_tag() {
        let line = r#"{"id":"sub-1","msg":{"type":"agent_message_delta","delta":"hel"}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        assert_eq!(event.id, "sub-1");
        match event.msg {
            EventMsg::AgentMessageDelta { delta } => assert_eq!(delta, "hel"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_do_not_break_decoding() {
        let line = r#"{"id":"s","msg":{"type":"brand_new_event","payload":1}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        assert!(matches!(event.msg, EventMsg::Unknown));
        assert_eq!(event.msg.kind(), "unknown");
    }

    #[test]
    fn kind_matches_the_wire_tag() {
        let line = r#"{"id":"s","msg":{"type":"task_started","label":"build"}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        assert_eq!(event.msg.kind(), "task_started");
    }

    #[test]
    fn token_count_reads_totals() {
        let line = r#"{"id":"s","msg":{"type":"token_count","total":{"input_tokens":10,"output_tokens":4}}}"#;
        let event: Event = serde_json::from_str(line).unwrap();
        match event.msg {
            EventMsg::TokenCount { total } => {
                assert_eq!(total.input_tokens, 10);
                assert_eq!(total.output_tokens, 4);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            BridgeStatus::Initializing,
            BridgeStatus::AgentReady,
            BridgeStatus::WaitingForMessage,
            BridgeStatus::Processing,
            BridgeStatus::Failed,
            BridgeStatus::ShuttingDown,
        ] {
            let parsed: BridgeStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("gone_fishing".parse::<BridgeStatus>().is_err());
    }

    #[test]
    fn ready_and_terminal_sets_are_disjoint() {
        assert!(BridgeStatus::AgentReady.is_ready());
        assert!(BridgeStatus::Processing.is_ready());
        assert!(!BridgeStatus::Failed.is_ready());
        assert!(BridgeStatus::Failed.is_terminal());
        assert!(BridgeStatus::ShuttingDown.is_terminal());
        assert!(!BridgeStatus::Initializing.is_terminal());
    }

    #[test]
    fn message_paths_live_under_the_message_dir() {
        for path in [INCOMING_FIFO, RESPONSE_FILE, STATUS_FILE, EVENTS_LOG_FILE] {
            assert!(path.starts_with(MESSAGE_DIR));
        }
    }
}
