//! The `Harness` trait -- the uniform operation set over agent backends.
//!
//! Each protocol family (codex app-server, ACP) implements this trait on
//! top of sessions obtained from the [`crate::supervisor::Supervisor`].
//! The trait is object-safe so the registry can hand out
//! `Arc<dyn Harness>`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::types::{
    ConversationOptions, ConversationPage, ConversationRef, ModelInfo, RawEventStream,
    ReviewRequest, TurnHandle, TurnRef, TurnRequest,
};
use crate::config::ProtocolFamily;
use crate::error::Result;

/// Backend adapter exposing conversation and turn operations.
///
/// Every operation takes the workspace it runs in and acquires that
/// workspace's session itself; callers never handle sessions directly.
/// Failures are typed [`crate::error::Error`]s, never raw protocol errors.
#[async_trait]
pub trait Harness: Send + Sync {
    /// Registry id of the agent this harness drives (e.g. "codex").
    fn agent_id(&self) -> &str;

    fn protocol(&self) -> ProtocolFamily;

    /// Start (or reuse) the workspace's session and return what the agent
    /// reported about itself during the handshake.
    async fn ensure_ready(&self, workspace: &Path) -> Result<Value>;

    async fn model_catalog(&self, workspace: &Path) -> Result<Vec<ModelInfo>>;

    async fn new_conversation(
        &self,
        workspace: &Path,
        options: &ConversationOptions,
    ) -> Result<ConversationRef>;

    /// One page of stored conversations, newest first where the backend
    /// orders them.
    async fn list_conversations(
        &self,
        workspace: &Path,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<ConversationPage>;

    /// Reattach a stored conversation to the workspace's live session.
    async fn resume_conversation(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
    ) -> Result<ConversationRef>;

    /// Start a turn. The session stays busy (and so safe from eviction)
    /// until the turn ends.
    async fn start_turn(&self, workspace: &Path, request: &TurnRequest) -> Result<TurnHandle>;

    async fn start_review(&self, workspace: &Path, request: &ReviewRequest) -> Result<TurnHandle>;

    /// Ask the backend to stop a running turn. Best effort: the turn's
    /// event stream still ends only when the backend reports completion.
    async fn interrupt(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        turn: &TurnRef,
    ) -> Result<()>;

    /// A fresh view of a running turn's raw events from now on. Observers
    /// never answer approval requests; the turn's own stream does that.
    async fn stream_events(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        turn: &TurnRef,
    ) -> Result<RawEventStream>;
}

// Compile-time assertion: Harness must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};
