//! Core types shared across the Harbor broker.
//!
//! This crate sits at the bottom of the workspace dependency hierarchy: it
//! defines the identifiers, the sandbox binding model, and the bridge
//! message-channel contract that the broker and the in-sandbox bridge
//! program agree on. It has zero internal crate dependencies.

pub mod bridge;
pub mod ids;

pub use bridge::{
    BridgeStatus, Event, EventMsg, InputItem, Submission, SubmissionOp, UnknownStatus,
    EVENTS_LOG_FILE, INCOMING_FIFO, MESSAGE_DIR, PROCESSING_SENTINEL, RESPONSE_FILE, STATUS_FILE,
};
pub use ids::{AgentId, SessionBinding};
