//! Raw backend events to the canonical event vocabulary.
//!
//! Every raw event becomes exactly one [`CanonicalEvent`]. Events this
//! module does not know are forwarded as [`CanonicalKind::Unrecognized`]
//! with the raw payload attached, never dropped.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::Error;
use crate::harness::{ConversationRef, RawEvent, RawEventStream, TurnRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalKind {
    TurnStarted,
    TurnCompleted,
    ItemStarted,
    ItemCompleted,
    Delta,
    ToolCall,
    ToolResult,
    ApprovalRequested,
    TokenUsage,
    Error,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    /// Strictly increasing within one normalizer run, starting at 1.
    pub seq: u64,
    pub kind: CanonicalKind,
    pub conversation_id: String,
    pub turn_id: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

pub type CanonicalEventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// Normalizes the raw events of one turn.
#[derive(Debug)]
pub struct EventNormalizer {
    conversation: ConversationRef,
    turn: TurnRef,
    next_seq: u64,
}

impl EventNormalizer {
    pub fn new(conversation: ConversationRef, turn: TurnRef) -> Self {
        Self {
            conversation,
            turn,
            next_seq: 1,
        }
    }

    pub fn normalize(&mut self, raw: &RawEvent) -> CanonicalEvent {
        let (kind, payload) = classify(raw);
        if kind == CanonicalKind::Unrecognized {
            debug!(kind = %raw.kind, "forwarding unrecognized event");
        }
        self.emit(kind, payload)
    }

    /// Canonical form of a stream failure (backend gone, mostly).
    pub fn failure(&mut self, err: &Error) -> CanonicalEvent {
        self.emit(
            CanonicalKind::Error,
            json!({
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            }),
        )
    }

    fn emit(&mut self, kind: CanonicalKind, payload: Value) -> CanonicalEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        CanonicalEvent {
            seq,
            kind,
            conversation_id: self.conversation.to_string(),
            turn_id: self.turn.to_string(),
            payload,
            at: Utc::now(),
        }
    }
}

/// Normalize a whole turn. A stream error becomes a final
/// [`CanonicalKind::Error`] event.
pub fn normalize_stream(
    conversation: ConversationRef,
    turn: TurnRef,
    mut raw: RawEventStream,
) -> CanonicalEventStream {
    let mut normalizer = EventNormalizer::new(conversation, turn);
    Box::pin(async_stream::stream! {
        while let Some(item) = raw.next().await {
            match item {
                Ok(event) => yield normalizer.normalize(&event),
                Err(e) => {
                    yield normalizer.failure(&e);
                    break;
                }
            }
        }
    })
}

fn text(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn classify(raw: &RawEvent) -> (CanonicalKind, Value) {
    let p = &raw.payload;
    match raw.kind.as_str() {
        // codex app-server
        "turn/started" => (CanonicalKind::TurnStarted, json!({ "turn": text(p, "/turn") })),
        "turn/completed" => (
            CanonicalKind::TurnCompleted,
            json!({
                "status": text(p, "/turn/status"),
                "error": text(p, "/turn/error"),
            }),
        ),
        "item/started" | "item/completed" => {
            let item = text(p, "/item");
            let tool = matches!(
                item.get("type").and_then(Value::as_str),
                Some("commandExecution" | "mcpToolCall" | "fileChange")
            );
            let kind = match (raw.kind.as_str(), tool) {
                ("item/started", true) => CanonicalKind::ToolCall,
                ("item/started", false) => CanonicalKind::ItemStarted,
                (_, true) => CanonicalKind::ToolResult,
                (_, false) => CanonicalKind::ItemCompleted,
            };
            (kind, json!({ "item": item }))
        }
        "item/agentMessage/delta" => delta("message", text(p, "/delta")),
        "item/reasoning/textDelta" | "item/reasoning/summaryTextDelta" => {
            delta("reasoning", text(p, "/delta"))
        }
        "item/commandExecution/outputDelta" => delta("output", text(p, "/delta")),
        "thread/tokenUsage/updated" => (
            CanonicalKind::TokenUsage,
            json!({ "usage": text(p, "/tokenUsage") }),
        ),
        "error" => (
            CanonicalKind::Error,
            json!({
                "message": text(p, "/error/message"),
                "will_retry": text(p, "/willRetry"),
            }),
        ),
        "item/commandExecution/requestApproval"
        | "item/fileChange/requestApproval"
        | "execCommandApproval"
        | "applyPatchApproval"
        | "session/request_permission" => (
            CanonicalKind::ApprovalRequested,
            json!({ "method": raw.kind, "request": p }),
        ),

        // ACP
        "prompt/started" => (CanonicalKind::TurnStarted, json!({})),
        "prompt/finished" => (
            CanonicalKind::TurnCompleted,
            json!({ "status": text(p, "/stopReason") }),
        ),
        "session/update" => classify_session_update(raw),

        _ => unrecognized(raw),
    }
}

fn classify_session_update(raw: &RawEvent) -> (CanonicalKind, Value) {
    let update = text(&raw.payload, "/update");
    let tag = update.get("sessionUpdate").and_then(Value::as_str);
    match tag {
        Some("agent_message_chunk") => delta("message", text(&update, "/content/text")),
        Some("agent_thought_chunk") => delta("reasoning", text(&update, "/content/text")),
        Some("user_message_chunk") => delta("user", text(&update, "/content/text")),
        Some("tool_call") => (CanonicalKind::ToolCall, json!({ "item": update })),
        Some("tool_call_update") => {
            let done = matches!(
                update.get("status").and_then(Value::as_str),
                Some("completed" | "failed")
            );
            let kind = if done {
                CanonicalKind::ToolResult
            } else {
                CanonicalKind::ItemStarted
            };
            (kind, json!({ "item": update }))
        }
        Some("plan") => (
            CanonicalKind::ItemCompleted,
            json!({ "item": { "type": "plan", "entries": text(&update, "/entries") } }),
        ),
        _ => unrecognized(raw),
    }
}

fn delta(stream: &str, text: Value) -> (CanonicalKind, Value) {
    (CanonicalKind::Delta, json!({ "stream": stream, "text": text }))
}

fn unrecognized(raw: &RawEvent) -> (CanonicalKind, Value) {
    (
        CanonicalKind::Unrecognized,
        json!({ "raw_kind": raw.kind, "raw": raw.payload }),
    )
}
