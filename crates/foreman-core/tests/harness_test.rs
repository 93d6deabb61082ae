//! Integration tests for the codex and ACP harnesses against fake agents,
//! including event normalization and approval handling.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use foreman_core::approval::AcceptAll;
use foreman_core::config::{AgentManifest, LaunchSpec, SupervisorConfig};
use foreman_core::harness::{
    CodexHarness, ConversationOptions, ConversationRef, Harness, HarnessContext, OpencodeHarness,
    RawEvent, ReviewRequest, ReviewTarget, TurnHandle, TurnRef, TurnRequest,
};
use foreman_core::normalize::{CanonicalEvent, CanonicalEventStream, CanonicalKind, normalize_stream};
use foreman_core::registry::{AgentRegistry, Capability};
use foreman_core::supervisor::Supervisor;
use foreman_core::Error;
use foreman_test_utils::{FakeAgent, TurnMode, workspace};

fn supervisor() -> Supervisor {
    Supervisor::new(SupervisorConfig {
        handshake_timeout_secs: 10,
        request_timeout_secs: 10,
        shutdown_grace_secs: 1,
        ..Default::default()
    })
}

fn codex(agent: &FakeAgent, ctx: HarnessContext) -> CodexHarness {
    CodexHarness::new("codex", LaunchSpec::new(agent.program_str()), ctx)
}

fn opencode(agent: &FakeAgent, ctx: HarnessContext) -> OpencodeHarness {
    OpencodeHarness::new("opencode", LaunchSpec::new(agent.program_str()), ctx)
}

fn canonical(turn: TurnHandle) -> CanonicalEventStream {
    normalize_stream(turn.conversation, turn.turn, turn.events)
}

async fn collect(events: CanonicalEventStream) -> Vec<CanonicalEvent> {
    tokio::time::timeout(Duration::from_secs(10), events.collect())
        .await
        .expect("turn did not finish")
}

async fn next(events: &mut CanonicalEventStream) -> Option<CanonicalEvent> {
    tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .expect("no event in time")
}

fn kinds(events: &[CanonicalEvent]) -> Vec<CanonicalKind> {
    events.iter().map(|e| e.kind).collect()
}

async fn collect_raw(turn: TurnHandle) -> Vec<foreman_core::Result<RawEvent>> {
    tokio::time::timeout(Duration::from_secs(10), turn.events.collect())
        .await
        .expect("turn did not finish")
}

async fn wait_for_log(agent: &FakeAgent, line: &str) {
    for _ in 0..250 {
        if agent.log_lines().iter().any(|l| l == line) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("fake agent never logged {line:?}; log: {:?}", agent.log_lines());
}

async fn wait_idle(supervisor: &Supervisor) {
    for _ in 0..250 {
        if supervisor.snapshot().iter().all(|s| s.active_operations == 0) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session still busy after the turn ended");
}

// ---------------------------------------------------------------------------
// codex
// ---------------------------------------------------------------------------

#[tokio::test]
async fn codex_conversation_lifecycle() {
    let agent = FakeAgent::codex(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let info = harness.ensure_ready(ws.path()).await.unwrap();
    assert_eq!(info["userAgent"], "fake-codex/0.0.0");

    let models = harness.model_catalog(ws.path()).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "gpt-fake");
    assert!(models[0].is_default);

    let conversation = harness
        .new_conversation(ws.path(), &ConversationOptions::default())
        .await
        .unwrap();
    assert_eq!(conversation.as_str(), "thr_1");

    let page = harness.list_conversations(ws.path(), None, Some(10)).await.unwrap();
    assert_eq!(page.conversations.len(), 1);
    assert_eq!(page.next_cursor.as_deref(), Some("page-2"));

    let resumed = harness.resume_conversation(ws.path(), &conversation).await.unwrap();
    assert_eq!(resumed, conversation);
    assert_eq!(agent.handshakes(), 1);

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_turn_is_normalized_and_keeps_unrecognized_events() {
    let agent = FakeAgent::codex(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let request = TurnRequest::new(ConversationRef::new("thr_1"), "say hello");
    let turn = harness.start_turn(ws.path(), &request).await.unwrap();
    assert_eq!(turn.turn.as_str(), "turn_1");

    let events = collect(canonical(turn)).await;
    assert_eq!(
        kinds(&events),
        vec![
            CanonicalKind::TurnStarted,
            CanonicalKind::Delta,
            CanonicalKind::Unrecognized,
            CanonicalKind::TurnCompleted,
        ]
    );
    assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(events[1].payload["text"], "Hello");
    assert_eq!(events[2].payload["raw_kind"], "vendor/sparkle");
    assert_eq!(events[2].payload["raw"]["glitter"], 3);
    assert_eq!(events[3].payload["status"], "completed");

    wait_idle(&supervisor).await;
    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_interrupt_ends_the_stream() {
    let agent = FakeAgent::codex(TurnMode::Hold);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let request = TurnRequest::new(ConversationRef::new("thr_1"), "long task");
    let turn = harness.start_turn(ws.path(), &request).await.unwrap();
    let (conversation, turn_ref) = (turn.conversation.clone(), turn.turn.clone());
    let mut events = canonical(turn);

    for expected in [CanonicalKind::TurnStarted, CanonicalKind::Delta, CanonicalKind::Unrecognized] {
        assert_eq!(next(&mut events).await.unwrap().kind, expected);
    }
    assert_eq!(supervisor.snapshot()[0].active_operations, 1);

    harness.interrupt(ws.path(), &conversation, &turn_ref).await.unwrap();

    let done = next(&mut events).await.unwrap();
    assert_eq!(done.kind, CanonicalKind::TurnCompleted);
    assert_eq!(done.payload["status"], "interrupted");
    assert!(next(&mut events).await.is_none());

    wait_idle(&supervisor).await;
    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_observer_sees_the_rest_of_a_running_turn() {
    let agent = FakeAgent::codex(TurnMode::Hold);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let request = TurnRequest::new(ConversationRef::new("thr_1"), "long task");
    let turn = harness.start_turn(ws.path(), &request).await.unwrap();
    let observer = harness
        .stream_events(ws.path(), &turn.conversation, &turn.turn)
        .await
        .unwrap();

    harness
        .interrupt(ws.path(), &turn.conversation, &turn.turn)
        .await
        .unwrap();

    let seen: Vec<_> = tokio::time::timeout(Duration::from_secs(10), observer.collect::<Vec<_>>())
        .await
        .unwrap();
    let last = seen.last().unwrap().as_ref().unwrap();
    assert_eq!(last.kind, "turn/completed");

    drop(turn);
    supervisor.close_all().await;
}

#[tokio::test]
async fn stream_events_rejects_unknown_turn() {
    let agent = FakeAgent::codex(TurnMode::Complete);
    let ws = workspace();
    let harness = codex(&agent, HarnessContext::new(supervisor()));

    let err = harness
        .stream_events(ws.path(), &ConversationRef::new("thr_1"), &TurnRef::new("nope"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn codex_approvals_are_declined_by_default() {
    let agent = FakeAgent::codex(TurnMode::Approval);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "clean up"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;

    let approval = events
        .iter()
        .find(|e| e.kind == CanonicalKind::ApprovalRequested)
        .unwrap();
    assert_eq!(approval.payload["request"]["command"], "rm -rf /");
    let result = events.iter().find(|e| e.kind == CanonicalKind::ToolResult).unwrap();
    assert_eq!(result.payload["item"]["decision"], "decline");
    assert_eq!(events.last().unwrap().kind, CanonicalKind::TurnCompleted);

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_approvals_use_configured_responder() {
    let agent = FakeAgent::codex(TurnMode::Approval);
    let ws = workspace();
    let supervisor = supervisor();
    let ctx = HarnessContext::new(supervisor.clone()).with_approvals(Arc::new(AcceptAll));
    let harness = codex(&agent, ctx);

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "clean up"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;
    let result = events.iter().find(|e| e.kind == CanonicalKind::ToolResult).unwrap();
    assert_eq!(result.payload["item"]["decision"], "accept");

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_review_runs_as_a_turn() {
    let agent = FakeAgent::codex(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let review = ReviewRequest {
        conversation: ConversationRef::new("thr_1"),
        target: ReviewTarget::BaseBranch {
            branch: "main".to_string(),
        },
    };
    let turn = harness.start_review(ws.path(), &review).await.unwrap();
    let events = collect(canonical(turn)).await;
    assert_eq!(events.last().unwrap().kind, CanonicalKind::TurnCompleted);

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_crash_mid_request_is_retryable() {
    let agent = FakeAgent::codex(TurnMode::Crash);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let err = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendDisconnected { .. }), "got {err:?}");
    assert!(err.is_retryable());

    harness.ensure_ready(ws.path()).await.unwrap();
    assert_eq!(agent.handshakes(), 2);

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_death_mid_turn_fails_the_stream_and_frees_the_session() {
    let agent = FakeAgent::codex(TurnMode::Die);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "boom"))
        .await
        .unwrap();
    let events = collect_raw(turn).await;
    assert!(events.iter().any(|e| matches!(e, Ok(raw) if raw.kind == "item/agentMessage/delta")));
    match events.last().unwrap() {
        Err(err) => {
            assert!(matches!(err, Error::BackendDisconnected { .. }), "got {err:?}");
            assert!(err.is_retryable());
        }
        Ok(raw) => panic!("turn ended with {raw:?} instead of a failure"),
    }

    wait_idle(&supervisor).await;
    harness.ensure_ready(ws.path()).await.unwrap();
    assert_eq!(agent.handshakes(), 2);
    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_requests_outside_any_turn_are_answered() {
    let agent = FakeAgent::codex(TurnMode::Stray);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()).with_approvals(Arc::new(AcceptAll)));

    harness
        .new_conversation(ws.path(), &ConversationOptions::default())
        .await
        .unwrap();
    // Nobody claimed them: the approval is declined even with an
    // accepting responder, and the unknown request is refused.
    wait_for_log(&agent, "stray:decline").await;
    wait_for_log(&agent, "stray-error:-32601").await;

    supervisor.close_all().await;
}

#[tokio::test]
async fn codex_rejected_turn_is_typed() {
    let agent = FakeAgent::codex(TurnMode::Reject);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = codex(&agent, HarnessContext::new(supervisor.clone()));

    let err = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "no"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendRejected { code: -32600, .. }), "got {err:?}");
    assert!(!err.is_retryable());

    wait_idle(&supervisor).await;
    supervisor.close_all().await;
}

#[tokio::test]
async fn empty_input_is_invalid() {
    let agent = FakeAgent::codex(TurnMode::Complete);
    let ws = workspace();
    let harness = codex(&agent, HarnessContext::new(supervisor()));

    let err = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("thr_1"), "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(agent.handshakes(), 0);
}

// ---------------------------------------------------------------------------
// ACP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acp_turn_is_bracketed_by_prompt_events() {
    let agent = FakeAgent::acp(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

    let info = harness.ensure_ready(ws.path()).await.unwrap();
    assert_eq!(info["protocolVersion"], 1);

    let conversation = harness
        .new_conversation(ws.path(), &ConversationOptions::default())
        .await
        .unwrap();
    assert_eq!(conversation.as_str(), "ses_1");

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(conversation, "hi"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;
    assert_eq!(
        kinds(&events),
        vec![
            CanonicalKind::TurnStarted,
            CanonicalKind::Delta,
            CanonicalKind::ToolCall,
            CanonicalKind::TurnCompleted,
        ]
    );
    assert_eq!(events[1].payload["text"], "Hi");
    assert_eq!(events[3].payload["status"], "end_turn");

    wait_idle(&supervisor).await;
    supervisor.close_all().await;
}

#[tokio::test]
async fn acp_cancel_ends_the_stream() {
    let agent = FakeAgent::acp(TurnMode::Hold);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_1"), "wait"))
        .await
        .unwrap();
    let (conversation, turn_ref) = (turn.conversation.clone(), turn.turn.clone());
    let mut events = canonical(turn);
    for expected in [CanonicalKind::TurnStarted, CanonicalKind::Delta, CanonicalKind::ToolCall] {
        assert_eq!(next(&mut events).await.unwrap().kind, expected);
    }

    harness.interrupt(ws.path(), &conversation, &turn_ref).await.unwrap();
    let done = next(&mut events).await.unwrap();
    assert_eq!(done.kind, CanonicalKind::TurnCompleted);
    assert_eq!(done.payload["status"], "cancelled");
    assert!(next(&mut events).await.is_none());

    supervisor.close_all().await;
}

#[tokio::test]
async fn acp_permission_requests_pick_an_option() {
    let agent = FakeAgent::acp(TurnMode::Approval);
    let ws = workspace();
    let supervisor = supervisor();
    let ctx = HarnessContext::new(supervisor.clone()).with_approvals(Arc::new(AcceptAll));
    let harness = opencode(&agent, ctx);

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_1"), "ls"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;
    assert!(events.iter().any(|e| e.kind == CanonicalKind::ApprovalRequested));
    let result = events.iter().find(|e| e.kind == CanonicalKind::ToolResult).unwrap();
    assert_eq!(result.payload["item"]["choice"], "yes");

    supervisor.close_all().await;
}

#[tokio::test]
async fn acp_rejected_prompt_fails_the_turn() {
    let agent = FakeAgent::acp(TurnMode::Reject);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_404"), "hi"))
        .await
        .unwrap();
    let events = collect_raw(turn).await;
    assert!(events.iter().all(|e| !matches!(e, Ok(raw) if raw.kind == "prompt/finished")));
    match events.last().unwrap() {
        Err(Error::BackendRejected { code, message, .. }) => {
            assert_eq!(*code, -32002);
            assert_eq!(message, "session not found");
        }
        other => panic!("unexpected end of turn: {other:?}"),
    }

    wait_idle(&supervisor).await;
    supervisor.close_all().await;
}

#[tokio::test]
async fn acp_rejected_prompt_normalizes_to_error() {
    let agent = FakeAgent::acp(TurnMode::Reject);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_1"), "hi"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;
    assert_eq!(kinds(&events), vec![CanonicalKind::TurnStarted, CanonicalKind::Error]);
    assert_eq!(events[1].payload["retryable"], false);

    supervisor.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acp_death_mid_turn_fails_the_stream_and_frees_the_session() {
    for mode in [TurnMode::Die, TurnMode::Crash] {
        let agent = FakeAgent::acp(mode);
        let ws = workspace();
        let supervisor = supervisor();
        let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

        let turn = harness
            .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_1"), "boom"))
            .await
            .unwrap();
        let events = collect_raw(turn).await;
        assert!(events.iter().all(|e| !matches!(e, Ok(raw) if raw.kind == "prompt/finished")));
        match events.last().unwrap() {
            Err(err) => {
                assert!(matches!(err, Error::BackendDisconnected { .. }), "{mode:?}: got {err:?}");
                assert!(err.is_retryable());
            }
            Ok(raw) => panic!("{mode:?}: turn ended with {raw:?} instead of a failure"),
        }
        if mode == TurnMode::Die {
            assert!(events.iter().any(|e| matches!(e, Ok(raw) if raw.kind == "session/update")));
        }

        wait_idle(&supervisor).await;
        harness.ensure_ready(ws.path()).await.unwrap();
        assert_eq!(agent.handshakes(), 2);
        supervisor.close_all().await;
    }
}

#[tokio::test]
async fn acp_permission_outside_any_turn_is_rejected() {
    let agent = FakeAgent::acp(TurnMode::Stray);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()).with_approvals(Arc::new(AcceptAll)));

    harness
        .new_conversation(ws.path(), &ConversationOptions::default())
        .await
        .unwrap();
    wait_for_log(&agent, "stray:no").await;

    supervisor.close_all().await;
}

#[tokio::test]
async fn acp_unsupported_operations_are_typed() {
    let agent = FakeAgent::acp(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();
    let harness = opencode(&agent, HarnessContext::new(supervisor.clone()));

    let err = harness.model_catalog(ws.path()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapabilityUnsupported {
            capability: Capability::ModelListing,
            ..
        }
    ));
    assert!(harness.list_conversations(ws.path(), None, None).await.is_err());

    let resumed = harness
        .resume_conversation(ws.path(), &ConversationRef::new("ses_1"))
        .await
        .unwrap();
    assert_eq!(resumed.as_str(), "ses_1");

    supervisor.close_all().await;
}

// ---------------------------------------------------------------------------
// registry-driven
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plugin_agent_runs_through_the_registry() {
    let agent = FakeAgent::acp(TurnMode::Complete);
    let ws = workspace();
    let supervisor = supervisor();

    let mut manifests = BTreeMap::new();
    manifests.insert(
        "myagent".to_string(),
        AgentManifest {
            protocol: Some(foreman_core::config::ProtocolFamily::Acp),
            command: vec![agent.program_str()],
            ..Default::default()
        },
    );
    let registry = AgentRegistry::from_manifests(&manifests).unwrap();
    assert!(registry.resolve("myagent").unwrap().check_health().is_healthy());

    let harness = registry
        .require("myagent", Capability::TurnExecution)
        .unwrap()
        .instantiate(HarnessContext::new(supervisor.clone()));
    assert_eq!(harness.agent_id(), "myagent");

    let turn = harness
        .start_turn(ws.path(), &TurnRequest::new(ConversationRef::new("ses_1"), "hi"))
        .await
        .unwrap();
    let events = collect(canonical(turn)).await;
    assert_eq!(events.last().unwrap().kind, CanonicalKind::TurnCompleted);

    supervisor.close_all().await;
}
