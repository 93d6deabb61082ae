//! Agent Client Protocol harness, as spoken by `opencode acp`.
//!
//! ACP sessions are conversations. A prompt is one request that resolves
//! when the turn ends, and the protocol has no turn ids, so this harness
//! mints one per prompt and publishes synthetic events around it:
//! `prompt/started` before the request goes out, then `prompt/finished`
//! (carrying the stop reason) once it resolves, or `prompt/failed` when the
//! agent rejects it. A prompt cut short by the process dying publishes
//! nothing; the turn ends on the disconnect itself. Cancellation is the
//! `session/cancel` notification.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pump::{Dialect, Pump, Route, TurnBook, TurnOwner, TurnScope, unclaimed_policy};
use super::trait_def::Harness;
use super::types::{
    ConversationOptions, ConversationPage, ConversationRef, HarnessContext, ModelInfo, RawEvent,
    RawEventStream, ReviewRequest, TurnHandle, TurnRef, TurnRequest,
};
use super::{require_text, str_at};
use crate::approval::{ApprovalDecision, ApprovalKind, ApprovalRequest};
use crate::config::{LaunchSpec, ProtocolFamily};
use crate::error::{Error, Result};
use crate::registry::Capability;
use crate::rpc::{ErrorObject, RpcError};
use crate::session::{Handshake, Lease, SessionBlueprint};

pub const PROTOCOL_VERSION: u64 = 1;

pub(crate) const PROMPT_STARTED: &str = "prompt/started";
pub(crate) const PROMPT_FINISHED: &str = "prompt/finished";
pub(crate) const PROMPT_FAILED: &str = "prompt/failed";
const PERMISSION_REQUEST: &str = "session/request_permission";
const SYNTHETIC_CAPACITY: usize = 256;

pub struct OpencodeHarness {
    agent: String,
    blueprint: SessionBlueprint,
    ctx: HarnessContext,
    dialect: Arc<AcpDialect>,
    turns: TurnBook,
    synthetic: broadcast::Sender<RawEvent>,
}

impl std::fmt::Debug for OpencodeHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpencodeHarness")
            .field("agent", &self.agent)
            .field("launch", &self.blueprint.launch)
            .finish()
    }
}

impl OpencodeHarness {
    pub const DEFAULT_COMMAND: &'static [&'static str] = &["opencode", "acp"];

    pub fn new(agent_id: impl Into<String>, launch: LaunchSpec, ctx: HarnessContext) -> Self {
        let agent = agent_id.into();
        let (synthetic, _) = broadcast::channel(SYNTHETIC_CAPACITY);
        let dialect = Arc::new(AcpDialect);
        Self {
            blueprint: SessionBlueprint {
                agent: agent.clone(),
                launch,
                handshake: Self::handshake(),
                unclaimed: unclaimed_policy(Arc::clone(&dialect)),
            },
            agent,
            ctx,
            dialect,
            turns: TurnBook::default(),
            synthetic,
        }
    }

    pub fn default_launch() -> LaunchSpec {
        LaunchSpec::new(Self::DEFAULT_COMMAND[0]).arg(Self::DEFAULT_COMMAND[1])
    }

    /// ACP's `initialize`. The protocol has no acknowledgement
    /// notification, so the handshake's second step is empty.
    pub fn handshake() -> Handshake {
        Handshake {
            method: "initialize".to_string(),
            params: json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {
                    "fs": { "readTextFile": false, "writeTextFile": false },
                    "terminal": false,
                },
            }),
            ack: None,
        }
    }

    async fn acquire(&self, workspace: &Path) -> Result<Lease> {
        self.ctx.supervisor.acquire(&self.blueprint, workspace).await
    }

    fn unsupported(&self, capability: Capability) -> Error {
        Error::unsupported(&self.agent, capability)
    }

    fn prompt_event(kind: &str, scope: &TurnScope, extra: Value) -> RawEvent {
        let mut payload = json!({
            "sessionId": scope.conversation,
            "turnId": scope.turn,
        });
        if let (Value::Object(payload), Value::Object(extra)) = (&mut payload, extra) {
            payload.extend(extra);
        }
        RawEvent::notification(kind, payload)
    }

    /// The synthetic event that ends a prompt, or `None` when the session
    /// itself went away and the disconnect will end the turn.
    fn prompt_outcome(scope: &TurnScope, outcome: std::result::Result<Value, RpcError>) -> Option<RawEvent> {
        let error = match outcome {
            Ok(result) => {
                let extra = json!({
                    "stopReason": result.get("stopReason").cloned().unwrap_or(Value::Null),
                });
                return Some(Self::prompt_event(PROMPT_FINISHED, scope, extra));
            }
            Err(RpcError::Closed | RpcError::Disconnected { .. }) => return None,
            Err(RpcError::Rejected(error)) => error,
            Err(other) => ErrorObject {
                code: -32603,
                message: other.to_string(),
                data: None,
            },
        };
        Some(Self::prompt_event(PROMPT_FAILED, scope, json!({ "error": error })))
    }
}

#[async_trait]
impl Harness for OpencodeHarness {
    fn agent_id(&self) -> &str {
        &self.agent
    }

    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::Acp
    }

    async fn ensure_ready(&self, workspace: &Path) -> Result<Value> {
        let lease = self.acquire(workspace).await?;
        Ok(lease.server_info().unwrap_or(Value::Null))
    }

    async fn model_catalog(&self, _workspace: &Path) -> Result<Vec<ModelInfo>> {
        Err(self.unsupported(Capability::ModelListing))
    }

    async fn new_conversation(
        &self,
        workspace: &Path,
        options: &ConversationOptions,
    ) -> Result<ConversationRef> {
        if options.model.is_some() || options.approval_policy.is_some() || options.sandbox.is_some() {
            warn!(agent = %self.agent, "conversation options are not understood over ACP; ignoring them");
        }
        let lease = self.acquire(workspace).await?;
        let client = lease.client()?;
        let result = client
            .call(
                "session/new",
                json!({
                    "cwd": lease.workspace().path().display().to_string(),
                    "mcpServers": [],
                }),
                Some(self.ctx.request_timeout),
            )
            .await?;
        let session = str_at(&result, "/sessionId")
            .ok_or_else(|| Error::malformed("session/new", "sessionId"))?;
        info!(agent = %self.agent, workspace = %lease.workspace(), session, "conversation created");
        Ok(ConversationRef::new(session))
    }

    async fn list_conversations(
        &self,
        _workspace: &Path,
        _cursor: Option<&str>,
        _limit: Option<u32>,
    ) -> Result<ConversationPage> {
        Err(self.unsupported(Capability::ConversationListing))
    }

    async fn resume_conversation(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
    ) -> Result<ConversationRef> {
        require_text("conversation id", conversation.as_str())?;
        let lease = self.acquire(workspace).await?;
        let can_load = lease
            .server_info()
            .and_then(|info| info.pointer("/agentCapabilities/loadSession").and_then(Value::as_bool))
            .unwrap_or(false);
        if !can_load {
            return Err(self.unsupported(Capability::ConversationResume));
        }

        let client = lease.client()?;
        client
            .call(
                "session/load",
                json!({
                    "sessionId": conversation,
                    "cwd": lease.workspace().path().display().to_string(),
                    "mcpServers": [],
                }),
                Some(self.ctx.request_timeout),
            )
            .await?;
        Ok(conversation.clone())
    }

    async fn start_turn(&self, workspace: &Path, request: &TurnRequest) -> Result<TurnHandle> {
        require_text("conversation id", request.conversation.as_str())?;
        require_text("turn input", &request.input)?;

        let lease = self.acquire(workspace).await?;
        let client = lease.client()?;
        let scope = TurnScope {
            conversation: request.conversation.clone(),
            turn: TurnRef::new(Uuid::new_v4().to_string()),
        };
        let inbound = client.notifications();
        let synthetic_rx = self.synthetic.subscribe();
        let owner = TurnOwner::claim(&self.dialect, &client, &scope.conversation, Arc::clone(&self.ctx.approvals));
        let entry = self.turns.open(scope.clone());

        let prompt_client = Arc::clone(&client);
        let synthetic = self.synthetic.clone();
        let params = json!({
            "sessionId": scope.conversation,
            "prompt": [{ "type": "text", "text": request.input }],
        });
        let prompt_scope = scope.clone();
        tokio::spawn(async move {
            // No deadline: the prompt resolves when the turn ends.
            let outcome = prompt_client.call("session/prompt", params, None).await;
            match Self::prompt_outcome(&prompt_scope, outcome) {
                Some(event) => {
                    let _ = synthetic.send(event);
                }
                None => debug!(turn = %prompt_scope.turn, "prompt cut short by disconnect"),
            }
        });
        info!(
            agent = %self.agent,
            workspace = %lease.workspace(),
            conversation = %scope.conversation,
            turn = %scope.turn,
            "turn started"
        );

        let conversation = scope.conversation.clone();
        let turn = scope.turn.clone();
        let events = Pump {
            dialect: Arc::clone(&self.dialect),
            agent: self.agent.clone(),
            prelude: vec![Self::prompt_event(PROMPT_STARTED, &scope, json!({}))],
            scope,
            client,
            inbound,
            synthetic: Some(synthetic_rx),
            owner: Some(owner),
            lease,
            entry: Some(entry),
        }
        .spawn();

        Ok(TurnHandle {
            conversation,
            turn,
            events,
        })
    }

    async fn start_review(&self, _workspace: &Path, _request: &ReviewRequest) -> Result<TurnHandle> {
        Err(self.unsupported(Capability::Review))
    }

    async fn interrupt(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        turn: &TurnRef,
    ) -> Result<()> {
        let lease = self.acquire(workspace).await?;
        lease
            .client()?
            .notify("session/cancel", json!({ "sessionId": conversation }))?;
        info!(agent = %self.agent, conversation = %conversation, turn = %turn, "cancel sent");
        Ok(())
    }

    async fn stream_events(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        turn: &TurnRef,
    ) -> Result<RawEventStream> {
        self.turns.require_running(conversation, turn)?;
        let lease = self.acquire(workspace).await?;
        let client = lease.client()?;
        Ok(Pump {
            dialect: Arc::clone(&self.dialect),
            agent: self.agent.clone(),
            scope: TurnScope {
                conversation: conversation.clone(),
                turn: turn.clone(),
            },
            inbound: client.notifications(),
            client,
            synthetic: Some(self.synthetic.subscribe()),
            owner: None,
            lease,
            prelude: Vec::new(),
            entry: None,
        }
        .spawn())
    }
}

/// Scoping and permission encoding for ACP.
#[derive(Debug, Default)]
pub(crate) struct AcpDialect;

impl Dialect for AcpDialect {
    fn route(&self, scope: &TurnScope, method: &str, params: &Value) -> Route {
        match method {
            PROMPT_STARTED | PROMPT_FINISHED | PROMPT_FAILED => {
                if str_at(params, "/turnId") != Some(scope.turn.as_str()) {
                    Route::Ignore
                } else if method == PROMPT_FINISHED {
                    Route::Finish
                } else if method == PROMPT_FAILED {
                    Route::Fail
                } else {
                    Route::Forward
                }
            }
            _ if str_at(params, "/sessionId") == Some(scope.conversation.as_str()) => Route::Forward,
            _ => Route::Ignore,
        }
    }

    fn owns_request(&self, scope: &TurnScope, _method: &str, params: &Value) -> bool {
        self.claims(&scope.conversation, params)
    }

    fn claims(&self, conversation: &ConversationRef, params: &Value) -> bool {
        str_at(params, "/sessionId").is_none_or(|session| session == conversation.as_str())
    }

    fn is_approval(&self, method: &str) -> bool {
        method == PERMISSION_REQUEST
    }

    fn approval(&self, agent: &str, scope: &TurnScope, method: &str, params: &Value) -> Option<ApprovalRequest> {
        if method != PERMISSION_REQUEST {
            return None;
        }
        let kind = match str_at(params, "/toolCall/kind") {
            Some("execute") => ApprovalKind::Command,
            Some("edit") | Some("delete") | Some("move") => ApprovalKind::FileChange,
            _ => ApprovalKind::Permission,
        };
        Some(ApprovalRequest {
            agent: agent.to_string(),
            kind,
            conversation: scope.conversation.to_string(),
            turn: Some(scope.turn.to_string()),
            method: method.to_string(),
            summary: str_at(params, "/toolCall/title")
                .unwrap_or("permission requested")
                .to_string(),
            payload: params.clone(),
        })
    }

    fn answer(&self, _method: &str, params: &Value, decision: ApprovalDecision) -> Value {
        let preferred: &[&str] = match decision {
            ApprovalDecision::Accept => &["allow_once", "allow_always"],
            ApprovalDecision::Decline => &["reject_once", "reject_always"],
        };
        let options = params
            .get("options")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let chosen = preferred.iter().find_map(|wanted| {
            options
                .iter()
                .find(|option| str_at(option, "/kind") == Some(*wanted))
                .and_then(|option| str_at(option, "/optionId"))
        });
        match chosen {
            Some(option_id) => json!({ "outcome": { "outcome": "selected", "optionId": option_id } }),
            None => json!({ "outcome": { "outcome": "cancelled" } }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> TurnScope {
        TurnScope {
            conversation: ConversationRef::new("ses_1"),
            turn: TurnRef::new("t-1"),
        }
    }

    fn permission() -> Value {
        json!({
            "sessionId": "ses_1",
            "toolCall": { "toolCallId": "call_1", "title": "Run ls", "kind": "execute" },
            "options": [
                { "optionId": "once", "name": "Allow once", "kind": "allow_once" },
                { "optionId": "always", "name": "Always", "kind": "allow_always" },
                { "optionId": "no", "name": "Reject", "kind": "reject_once" }
            ]
        })
    }

    #[test]
    fn routes_session_updates_and_synthetic_events() {
        let d = AcpDialect;
        let s = scope();
        assert_eq!(
            d.route(&s, "session/update", &json!({"sessionId": "ses_1", "update": {}})),
            Route::Forward
        );
        assert_eq!(
            d.route(&s, "session/update", &json!({"sessionId": "ses_2"})),
            Route::Ignore
        );
        assert_eq!(
            d.route(&s, PROMPT_FINISHED, &json!({"sessionId": "ses_1", "turnId": "t-1"})),
            Route::Finish
        );
        assert_eq!(
            d.route(&s, PROMPT_FINISHED, &json!({"sessionId": "ses_1", "turnId": "t-0"})),
            Route::Ignore
        );
    }

    #[test]
    fn permission_answers_pick_matching_option() {
        let d = AcpDialect;
        assert_eq!(
            d.answer(PERMISSION_REQUEST, &permission(), ApprovalDecision::Accept),
            json!({"outcome": {"outcome": "selected", "optionId": "once"}})
        );
        assert_eq!(
            d.answer(PERMISSION_REQUEST, &permission(), ApprovalDecision::Decline),
            json!({"outcome": {"outcome": "selected", "optionId": "no"}})
        );
        assert_eq!(
            d.answer(PERMISSION_REQUEST, &json!({"options": []}), ApprovalDecision::Decline),
            json!({"outcome": {"outcome": "cancelled"}})
        );
    }

    #[test]
    fn permission_request_becomes_command_approval() {
        let request = AcpDialect
            .approval("opencode", &scope(), PERMISSION_REQUEST, &permission())
            .unwrap();
        assert_eq!(request.kind, ApprovalKind::Command);
        assert_eq!(request.summary, "Run ls");
        assert_eq!(request.turn.as_deref(), Some("t-1"));
        assert!(AcpDialect.approval("opencode", &scope(), "fs/read_text_file", &json!({})).is_none());
    }

    #[test]
    fn failed_prompt_routes_to_failure_and_disconnect_publishes_nothing() {
        let s = scope();
        let rejected = RpcError::Rejected(ErrorObject {
            code: -32002,
            message: "session not found".to_string(),
            data: None,
        });
        let event = OpencodeHarness::prompt_outcome(&s, Err(rejected)).unwrap();
        assert_eq!(event.kind, PROMPT_FAILED);
        assert_eq!(event.payload["error"]["code"], -32002);
        assert_eq!(AcpDialect.route(&s, &event.kind, &event.payload), Route::Fail);

        let gone = RpcError::Disconnected { exit_status: Some(7) };
        assert!(OpencodeHarness::prompt_outcome(&s, Err(gone)).is_none());

        let done = OpencodeHarness::prompt_outcome(&s, Ok(json!({"stopReason": "end_turn"}))).unwrap();
        assert_eq!(done.kind, PROMPT_FINISHED);
        assert_eq!(AcpDialect.route(&s, &done.kind, &done.payload), Route::Finish);
    }

    #[test]
    fn unclaimed_permission_requests_are_rejected() {
        let policy = unclaimed_policy(Arc::new(AcpDialect));
        assert_eq!(
            policy.answer(PERMISSION_REQUEST, &permission()),
            Ok(json!({"outcome": {"outcome": "selected", "optionId": "no"}}))
        );
        assert!(policy.answer("fs/read_text_file", &json!({})).is_err());
    }

    #[test]
    fn prompt_events_carry_scope() {
        let event = OpencodeHarness::prompt_event(PROMPT_FINISHED, &scope(), json!({"stopReason": "end_turn"}));
        assert_eq!(event.kind, PROMPT_FINISHED);
        assert_eq!(
            event.payload,
            json!({"sessionId": "ses_1", "turnId": "t-1", "stopReason": "end_turn"})
        );
    }
}
