//! Harness adapters: one uniform operation set over every agent backend.
//!
//! This module defines the [`Harness`] trait, the backend-neutral types it
//! speaks ([`ConversationRef`], [`TurnRef`], [`TurnHandle`], [`RawEvent`])
//! and one implementation per protocol family.
//!
//! # Architecture
//!
//! ```text
//! AgentRegistry --instantiate("codex")--> Arc<dyn Harness>
//!                                              |
//!   start_turn(workspace, request) ------------+
//!        |
//!        v
//!   Supervisor::acquire --> Lease (session busy until the turn ends)
//!        |
//!        v
//!   Multiplexer::call("turn/start") + notifications()
//!        |
//!        v
//!   Pump --filter by conversation/turn, answer approvals--> RawEventStream
//! ```

pub mod codex;
pub mod opencode;
mod pump;
pub mod trait_def;
pub mod types;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use codex::CodexHarness;
pub use opencode::OpencodeHarness;
pub use trait_def::Harness;
pub use types::{
    ConversationOptions, ConversationPage, ConversationRef, ConversationSummary, HarnessContext,
    ModelInfo, RawEvent, RawEventStream, ReviewRequest, ReviewTarget, TurnHandle, TurnRef,
    TurnRequest,
};

pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

pub(crate) fn insert_opt(params: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        params.insert(key.to_string(), Value::String(value.to_string()));
    }
}

pub(crate) fn require_text(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}
