//! Types shared by every harness: backend-neutral identifiers, request
//! shapes, and the raw event stream.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ApprovalResponder, DeclineAll};
use crate::error::Result;
use crate::rpc::RequestId;
use crate::supervisor::Supervisor;

/// Backend-assigned conversation id. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationRef(String);

/// Backend-assigned (or, for backends without turn ids, minted) turn id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnRef(String);

macro_rules! opaque_ref {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

opaque_ref!(ConversationRef);
opaque_ref!(TurnRef);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub conversation: ConversationRef,
    pub preview: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One page of a conversation listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationSummary>,
    /// Pass back to fetch the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Optional knobs for a new conversation. Values are passed through to
/// the backend uninterpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationOptions {
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation: ConversationRef,
    pub input: String,
    pub model: Option<String>,
    pub effort: Option<String>,
}

impl TurnRequest {
    pub fn new(conversation: ConversationRef, input: impl Into<String>) -> Self {
        Self {
            conversation,
            input: input.into(),
            model: None,
            effort: None,
        }
    }
}

/// What a review looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReviewTarget {
    UncommittedChanges,
    BaseBranch {
        branch: String,
    },
    Commit {
        sha: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Custom {
        instructions: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub conversation: ConversationRef,
    pub target: ReviewTarget,
}

/// One backend event, as the backend named it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawEvent {
    /// Notification or request method, e.g. `item/agentMessage/delta`.
    pub kind: String,
    pub payload: Value,
    /// Set when the event was a server-initiated request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl RawEvent {
    pub fn notification(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: None,
        }
    }
}

/// Raw events for one turn. Ends after the backend reports the turn
/// finished, or with an error if the backend went away first.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// A running turn: its ids and its event stream.
pub struct TurnHandle {
    pub conversation: ConversationRef,
    pub turn: TurnRef,
    pub events: RawEventStream,
}

impl fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnHandle")
            .field("conversation", &self.conversation)
            .field("turn", &self.turn)
            .finish_non_exhaustive()
    }
}

/// What every harness is built from.
#[derive(Clone)]
pub struct HarnessContext {
    pub supervisor: Supervisor,
    pub approvals: Arc<dyn ApprovalResponder>,
    /// Deadline for ordinary requests. Turn execution is not bounded.
    pub request_timeout: Duration,
}

impl HarnessContext {
    /// A context that declines every approval request.
    pub fn new(supervisor: Supervisor) -> Self {
        let request_timeout = supervisor.config().request_timeout();
        Self {
            supervisor,
            approvals: Arc::new(DeclineAll),
            request_timeout,
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalResponder>) -> Self {
        self.approvals = approvals;
        self
    }
}

impl fmt::Debug for HarnessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessContext")
            .field("supervisor", &self.supervisor)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
