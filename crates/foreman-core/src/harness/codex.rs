//! Codex app-server harness.
//!
//! Speaks the `codex app-server` JSON-RPC dialect: threads are
//! conversations, turns carry their own ids, and every turn-scoped
//! notification names its `threadId` and `turnId`. A turn ends with
//! `turn/completed`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::pump::{Dialect, Pump, Route, TurnBook, TurnOwner, TurnScope, unclaimed_policy};
use super::trait_def::Harness;
use super::types::{
    ConversationOptions, ConversationPage, ConversationRef, ConversationSummary, HarnessContext,
    ModelInfo, RawEventStream, ReviewRequest, TurnHandle, TurnRef, TurnRequest,
};
use super::{insert_opt, require_text, str_at};
use crate::approval::{ApprovalDecision, ApprovalKind, ApprovalRequest};
use crate::config::{LaunchSpec, ProtocolFamily};
use crate::error::{Error, Result};
use crate::session::{Handshake, Lease, SessionBlueprint};

/// Guard against a backend that never stops handing out cursors.
const MAX_MODEL_PAGES: usize = 16;

const COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
const FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";
const LEGACY_COMMAND_APPROVAL: &str = "execCommandApproval";
const LEGACY_PATCH_APPROVAL: &str = "applyPatchApproval";

pub struct CodexHarness {
    agent: String,
    blueprint: SessionBlueprint,
    ctx: HarnessContext,
    dialect: Arc<CodexDialect>,
    turns: TurnBook,
}

impl std::fmt::Debug for CodexHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexHarness")
            .field("agent", &self.agent)
            .field("launch", &self.blueprint.launch)
            .finish()
    }
}

impl CodexHarness {
    /// Command used when configuration does not override it.
    pub const DEFAULT_COMMAND: &'static [&'static str] = &["codex", "app-server"];

    pub fn new(agent_id: impl Into<String>, launch: LaunchSpec, ctx: HarnessContext) -> Self {
        let agent = agent_id.into();
        let dialect = Arc::new(CodexDialect);
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
        }
    }

    pub fn default_launch() -> LaunchSpec {
        LaunchSpec::new(Self::DEFAULT_COMMAND[0]).arg(Self::DEFAULT_COMMAND[1])
    }

    /// `initialize` with our client identity, acknowledged by
    /// `initialized`.
    pub fn handshake() -> Handshake {
        Handshake {
            method: "initialize".to_string(),
            params: json!({
                "clientInfo": {
                    "name": "foreman",
                    "title": "Foreman",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            ack: Some("initialized".to_string()),
        }
    }

    async fn acquire(&self, workspace: &Path) -> Result<Lease> {
        self.ctx.supervisor.acquire(&self.blueprint, workspace).await
    }

    async fn request(&self, lease: &Lease, method: &str, params: Value) -> Result<Value> {
        let client = lease.client()?;
        let result = client
            .call(method, params, Some(self.ctx.request_timeout))
            .await?;
        Ok(result)
    }

    /// Send a turn-starting request and attach a pump to the turn it
    /// reports. The subscription is taken before the request goes out so
    /// events racing the response are kept.
    async fn begin_turn(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        method: &str,
        params: Value,
    ) -> Result<TurnHandle> {
        let lease = self.acquire(workspace).await?;
        let client = lease.client()?;
        let inbound = client.notifications();
        let owner = TurnOwner::claim(&self.dialect, &client, conversation, Arc::clone(&self.ctx.approvals));

        let result = client
            .call(method, params, Some(self.ctx.request_timeout))
            .await?;
        let turn = str_at(&result, "/turn/id")
            .map(TurnRef::new)
            .ok_or_else(|| Error::malformed(method, "turn.id"))?;
        info!(
            agent = %self.agent,
            workspace = %lease.workspace(),
            conversation = %conversation,
            turn = %turn,
            "turn started"
        );

        let scope = TurnScope {
            conversation: conversation.clone(),
            turn: turn.clone(),
        };
        let events = Pump {
            dialect: Arc::clone(&self.dialect),
            agent: self.agent.clone(),
            entry: Some(self.turns.open(scope.clone())),
            scope,
            client,
            inbound,
            synthetic: None,
            owner: Some(owner),
            lease,
            prelude: Vec::new(),
        }
        .spawn();

        Ok(TurnHandle {
            conversation: conversation.clone(),
            turn,
            events,
        })
    }
}

#[async_trait]
impl Harness for CodexHarness {
    fn agent_id(&self) -> &str {
        &self.agent
    }

    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::Codex
    }

    async fn ensure_ready(&self, workspace: &Path) -> Result<Value> {
        let lease = self.acquire(workspace).await?;
        Ok(lease.server_info().unwrap_or(Value::Null))
    }

    async fn model_catalog(&self, workspace: &Path) -> Result<Vec<ModelInfo>> {
        let lease = self.acquire(workspace).await?;
        let mut models = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_MODEL_PAGES {
            let mut params = Map::new();
            insert_opt(&mut params, "cursor", cursor.as_deref());
            let page = self.request(&lease, "model/list", Value::Object(params)).await?;
            let data = page
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::malformed("model/list", "data"))?;
            models.extend(data.iter().filter_map(parse_model));

            cursor = str_at(&page, "/nextCursor").map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        debug!(agent = %self.agent, count = models.len(), "fetched model catalog");
        Ok(models)
    }

    async fn new_conversation(
        &self,
        workspace: &Path,
        options: &ConversationOptions,
    ) -> Result<ConversationRef> {
        let lease = self.acquire(workspace).await?;
        let mut params = Map::new();
        params.insert(
            "cwd".to_string(),
            Value::String(lease.workspace().path().display().to_string()),
        );
        insert_opt(&mut params, "model", options.model.as_deref());
        insert_opt(&mut params, "approvalPolicy", options.approval_policy.as_deref());
        insert_opt(&mut params, "sandbox", options.sandbox.as_deref());
        insert_opt(&mut params, "baseInstructions", options.instructions.as_deref());

        let result = self.request(&lease, "thread/start", Value::Object(params)).await?;
        let thread = str_at(&result, "/thread/id")
            .ok_or_else(|| Error::malformed("thread/start", "thread.id"))?;
        info!(agent = %self.agent, workspace = %lease.workspace(), thread, "conversation created");
        Ok(ConversationRef::new(thread))
    }

    async fn list_conversations(
        &self,
        workspace: &Path,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<ConversationPage> {
        if limit == Some(0) {
            return Err(Error::InvalidArgument("limit must be positive".to_string()));
        }
        let lease = self.acquire(workspace).await?;
        let mut params = Map::new();
        insert_opt(&mut params, "cursor", cursor);
        if let Some(limit) = limit {
            params.insert("limit".to_string(), json!(limit));
        }

        let result = self.request(&lease, "thread/list", Value::Object(params)).await?;
        let data = result
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed("thread/list", "data"))?;
        Ok(ConversationPage {
            conversations: data.iter().filter_map(parse_thread).collect(),
            next_cursor: str_at(&result, "/nextCursor").map(str::to_string),
        })
    }

    async fn resume_conversation(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
    ) -> Result<ConversationRef> {
        require_text("conversation id", conversation.as_str())?;
        let lease = self.acquire(workspace).await?;
        let result = self
            .request(&lease, "thread/resume", json!({ "threadId": conversation }))
            .await?;
        let thread = str_at(&result, "/thread/id").unwrap_or(conversation.as_str());
        Ok(ConversationRef::new(thread))
    }

    async fn start_turn(&self, workspace: &Path, request: &TurnRequest) -> Result<TurnHandle> {
        require_text("conversation id", request.conversation.as_str())?;
        require_text("turn input", &request.input)?;

        let mut params = Map::new();
        params.insert("threadId".to_string(), json!(request.conversation));
        params.insert(
            "input".to_string(),
            json!([{ "type": "text", "text": request.input }]),
        );
        insert_opt(&mut params, "model", request.model.as_deref());
        insert_opt(&mut params, "effort", request.effort.as_deref());

        self.begin_turn(workspace, &request.conversation, "turn/start", Value::Object(params))
            .await
    }

    async fn start_review(&self, workspace: &Path, request: &ReviewRequest) -> Result<TurnHandle> {
        require_text("conversation id", request.conversation.as_str())?;
        let params = json!({
            "threadId": request.conversation,
            "target": request.target,
            "delivery": "inline",
        });
        self.begin_turn(workspace, &request.conversation, "review/start", params)
            .await
    }

    async fn interrupt(
        &self,
        workspace: &Path,
        conversation: &ConversationRef,
        turn: &TurnRef,
    ) -> Result<()> {
        let lease = self.acquire(workspace).await?;
        self.request(
            &lease,
            "turn/interrupt",
            json!({ "threadId": conversation, "turnId": turn }),
        )
        .await?;
        info!(agent = %self.agent, conversation = %conversation, turn = %turn, "interrupt requested");
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
            synthetic: None,
            owner: None,
            lease,
            prelude: Vec::new(),
            entry: None,
        }
        .spawn())
    }
}

fn parse_model(item: &Value) -> Option<ModelInfo> {
    let id = str_at(item, "/model").or_else(|| str_at(item, "/id"))?;
    Some(ModelInfo {
        id: id.to_string(),
        display_name: str_at(item, "/displayName").map(str::to_string),
        description: str_at(item, "/description").map(str::to_string),
        is_default: item.get("isDefault").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_thread(item: &Value) -> Option<ConversationSummary> {
    let id = str_at(item, "/id")?;
    let updated_at = item
        .get("updatedAt")
        .or_else(|| item.get("createdAt"))
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    Some(ConversationSummary {
        conversation: ConversationRef::new(id),
        preview: str_at(item, "/preview").map(str::to_string),
        updated_at,
    })
}

/// Scoping and approval encoding for the codex dialect.
#[derive(Debug, Default)]
pub(crate) struct CodexDialect;

impl CodexDialect {
    fn thread_of(params: &Value) -> Option<&str> {
        str_at(params, "/threadId").or_else(|| str_at(params, "/conversationId"))
    }

    fn turn_of(params: &Value) -> Option<&str> {
        str_at(params, "/turnId").or_else(|| str_at(params, "/turn/id"))
    }
}

impl Dialect for CodexDialect {
    fn route(&self, scope: &TurnScope, method: &str, params: &Value) -> Route {
        if Self::thread_of(params) != Some(scope.conversation.as_str()) {
            return Route::Ignore;
        }
        match Self::turn_of(params) {
            Some(turn) if turn != scope.turn.as_str() => Route::Ignore,
            Some(_) if method == "turn/completed" => Route::Finish,
            _ => Route::Forward,
        }
    }

    fn owns_request(&self, scope: &TurnScope, _method: &str, params: &Value) -> bool {
        match Self::thread_of(params) {
            None => true,
            Some(thread) if thread != scope.conversation.as_str() => false,
            Some(_) => Self::turn_of(params).is_none_or(|turn| turn == scope.turn.as_str()),
        }
    }

    fn claims(&self, conversation: &ConversationRef, params: &Value) -> bool {
        Self::thread_of(params).is_none_or(|thread| thread == conversation.as_str())
    }

    fn is_approval(&self, method: &str) -> bool {
        matches!(
            method,
            COMMAND_APPROVAL | FILE_CHANGE_APPROVAL | LEGACY_COMMAND_APPROVAL | LEGACY_PATCH_APPROVAL
        )
    }

    fn approval(&self, agent: &str, scope: &TurnScope, method: &str, params: &Value) -> Option<ApprovalRequest> {
        let kind = match method {
            COMMAND_APPROVAL | LEGACY_COMMAND_APPROVAL => ApprovalKind::Command,
            FILE_CHANGE_APPROVAL | LEGACY_PATCH_APPROVAL => ApprovalKind::FileChange,
            _ => return None,
        };
        let summary = command_text(params)
            .or_else(|| str_at(params, "/reason").map(str::to_string))
            .unwrap_or_else(|| match kind {
                ApprovalKind::FileChange => "apply file changes".to_string(),
                _ => method.to_string(),
            });
        Some(ApprovalRequest {
            agent: agent.to_string(),
            kind,
            conversation: scope.conversation.to_string(),
            turn: Self::turn_of(params).map(str::to_string),
            method: method.to_string(),
            summary,
            payload: params.clone(),
        })
    }

    fn answer(&self, method: &str, _params: &Value, decision: ApprovalDecision) -> Value {
        let legacy = matches!(method, LEGACY_COMMAND_APPROVAL | LEGACY_PATCH_APPROVAL);
        let decision = match (legacy, decision) {
            (false, ApprovalDecision::Accept) => "accept",
            (false, ApprovalDecision::Decline) => "decline",
            (true, ApprovalDecision::Accept) => "approved",
            (true, ApprovalDecision::Decline) => "denied",
        };
        json!({ "decision": decision })
    }
}

/// `command` is a string in the current dialect and an argv array in the
/// legacy one.
fn command_text(params: &Value) -> Option<String> {
    match params.get("command")? {
        Value::String(command) => Some(command.clone()),
        Value::Array(argv) => Some(
            argv.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> TurnScope {
        TurnScope {
            conversation: ConversationRef::new("thr_1"),
            turn: TurnRef::new("turn_1"),
        }
    }

    #[test]
    fn routes_by_thread_and_turn() {
        let d = CodexDialect;
        let s = scope();
        assert_eq!(
            d.route(&s, "item/agentMessage/delta", &json!({"threadId": "thr_1", "turnId": "turn_1"})),
            Route::Forward
        );
        assert_eq!(
            d.route(&s, "item/agentMessage/delta", &json!({"threadId": "thr_1", "turnId": "turn_0"})),
            Route::Ignore
        );
        assert_eq!(
            d.route(&s, "item/agentMessage/delta", &json!({"threadId": "thr_2", "turnId": "turn_1"})),
            Route::Ignore
        );
        assert_eq!(
            d.route(&s, "turn/completed", &json!({"threadId": "thr_1", "turn": {"id": "turn_1"}})),
            Route::Finish
        );
        assert_eq!(d.route(&s, "account/updated", &json!({})), Route::Ignore);
    }

    #[test]
    fn approval_answers_follow_dialect_generation() {
        let d = CodexDialect;
        assert_eq!(
            d.answer(COMMAND_APPROVAL, &Value::Null, ApprovalDecision::Accept),
            json!({"decision": "accept"})
        );
        assert_eq!(
            d.answer(FILE_CHANGE_APPROVAL, &Value::Null, ApprovalDecision::Decline),
            json!({"decision": "decline"})
        );
        assert_eq!(
            d.answer(LEGACY_COMMAND_APPROVAL, &Value::Null, ApprovalDecision::Accept),
            json!({"decision": "approved"})
        );
        assert_eq!(
            d.answer(LEGACY_PATCH_APPROVAL, &Value::Null, ApprovalDecision::Decline),
            json!({"decision": "denied"})
        );
    }

    #[test]
    fn approval_summary_prefers_command() {
        let d = CodexDialect;
        let request = d
            .approval(
                "codex",
                &scope(),
                LEGACY_COMMAND_APPROVAL,
                &json!({"conversationId": "thr_1", "command": ["cargo", "test"], "reason": "run tests"}),
            )
            .unwrap();
        assert_eq!(request.kind, ApprovalKind::Command);
        assert_eq!(request.summary, "cargo test");

        assert!(d.approval("codex", &scope(), "item/tool/call", &json!({})).is_none());
    }

    #[test]
    fn unscoped_server_requests_are_owned() {
        let d = CodexDialect;
        assert!(d.owns_request(&scope(), "whatever", &json!({})));
        assert!(!d.owns_request(&scope(), COMMAND_APPROVAL, &json!({"threadId": "thr_9"})));
        assert!(d.owns_request(
            &scope(),
            COMMAND_APPROVAL,
            &json!({"threadId": "thr_1", "turnId": "turn_1"})
        ));
    }

    #[test]
    fn turns_claim_their_thread_and_unclaimed_approvals_are_declined() {
        let d = Arc::new(CodexDialect);
        let thread = ConversationRef::new("thr_1");
        assert!(d.claims(&thread, &json!({"threadId": "thr_1", "turnId": "turn_7"})));
        assert!(d.claims(&thread, &json!({})));
        assert!(!d.claims(&thread, &json!({"conversationId": "thr_2"})));

        let policy = unclaimed_policy(d);
        assert_eq!(
            policy.answer(COMMAND_APPROVAL, &json!({"threadId": "thr_9"})),
            Ok(json!({"decision": "decline"}))
        );
        assert_eq!(
            policy.answer(LEGACY_PATCH_APPROVAL, &json!({})),
            Ok(json!({"decision": "denied"}))
        );
        assert_eq!(policy.answer("item/tool/call", &json!({})).unwrap_err().code, -32601);
    }

    #[test]
    fn parses_models_and_threads() {
        let model = parse_model(&json!({"id": "m1", "model": "gpt-5", "displayName": "GPT-5", "isDefault": true})).unwrap();
        assert_eq!(model.id, "gpt-5");
        assert!(model.is_default);

        let thread = parse_thread(&json!({"id": "thr_1", "preview": "fix bug", "updatedAt": 1_700_000_000})).unwrap();
        assert_eq!(thread.conversation.as_str(), "thr_1");
        assert_eq!(thread.updated_at.unwrap().timestamp(), 1_700_000_000);
        assert!(parse_thread(&json!({"preview": "no id"})).is_none());
    }
}
