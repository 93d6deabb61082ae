//! Answers to server-initiated approval requests.
//!
//! A harness that sees an approval request in a turn's traffic asks the
//! configured [`ApprovalResponder`] and encodes the decision in its own
//! protocol's shape. Without an explicit responder the answer is
//! [`ApprovalDecision::Decline`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Run a shell command.
    Command,
    /// Apply file edits.
    FileChange,
    /// Anything else the agent asks permission for.
    Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Decline,
}

/// One approval prompt, lifted out of the backend's wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub agent: String,
    pub kind: ApprovalKind,
    pub conversation: String,
    pub turn: Option<String>,
    /// Backend method that carried the request.
    pub method: String,
    /// Short human-readable description (the command, the reason, a title).
    pub summary: String,
    /// Untouched request params.
    pub payload: Value,
}

#[async_trait]
pub trait ApprovalResponder: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Declines everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineAll;

#[async_trait]
impl ApprovalResponder for DeclineAll {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        debug!(method = %request.method, summary = %request.summary, "declining approval request");
        ApprovalDecision::Decline
    }
}

/// Accepts everything. Only sensible inside a sandbox.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ApprovalResponder for AcceptAll {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        debug!(method = %request.method, summary = %request.summary, "accepting approval request");
        ApprovalDecision::Accept
    }
}

/// A request awaiting a decision from whoever holds the receiving end of a
/// [`ChannelResponder`].
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub reply: oneshot::Sender<ApprovalDecision>,
}

/// Forwards each request over a channel and waits for the reply.
///
/// A closed channel or a dropped reply sender counts as a decline.
#[derive(Debug, Clone)]
pub struct ChannelResponder {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelResponder {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalResponder for ChannelResponder {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let (reply, decision) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            warn!(method = %request.method, "approval channel closed; declining");
            return ApprovalDecision::Decline;
        }
        decision.await.unwrap_or_else(|_| {
            warn!(method = %request.method, "approval reply dropped; declining");
            ApprovalDecision::Decline
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            agent: "codex".to_string(),
            kind: ApprovalKind::Command,
            conversation: "thr_1".to_string(),
            turn: Some("turn_1".to_string()),
            method: "item/commandExecution/requestApproval".to_string(),
            summary: "rm -rf target".to_string(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn fixed_responders() {
        assert_eq!(DeclineAll.decide(&request()).await, ApprovalDecision::Decline);
        assert_eq!(AcceptAll.decide(&request()).await, ApprovalDecision::Accept);
    }

    #[tokio::test]
    async fn channel_responder_relays_decision() {
        let (responder, mut rx) = ChannelResponder::new(4);
        let surface = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.summary, "rm -rf target");
            pending.reply.send(ApprovalDecision::Accept).unwrap();
        });
        assert_eq!(responder.decide(&request()).await, ApprovalDecision::Accept);
        surface.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_reply_declines() {
        let (responder, mut rx) = ChannelResponder::new(1);
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            drop(pending);
        });
        assert_eq!(responder.decide(&request()).await, ApprovalDecision::Decline);
    }

    #[tokio::test]
    async fn closed_channel_declines() {
        let (responder, rx) = ChannelResponder::new(1);
        drop(rx);
        assert_eq!(responder.decide(&request()).await, ApprovalDecision::Decline);
    }
}
