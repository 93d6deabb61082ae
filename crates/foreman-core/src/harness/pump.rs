//! Per-turn event pump shared by the protocol families.
//!
//! A pump filters one session's inbound traffic down to a single turn,
//! answers the server requests its turn claimed, and forwards everything
//! it keeps as [`RawEvent`]s. A pump started with a turn owns the turn's
//! [`Lease`] and keeps draining to the end of the turn even if nobody reads
//! the stream, so approval requests are always answered and eviction never
//! sees the session as idle mid-turn. Requests no turn claims are answered
//! by the session's [`unclaimed_policy`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::types::{ConversationRef, RawEvent, RawEventStream, TurnRef};
use crate::approval::{ApprovalDecision, ApprovalRequest, ApprovalResponder};
use crate::error::{Error, Result};
use crate::rpc::{Claim, ErrorObject, Inbound, InboundStream, Multiplexer, RequestId, RpcError, UnclaimedPolicy};
use crate::session::Lease;

/// The conversation and turn a pump is watching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TurnScope {
    pub conversation: ConversationRef,
    pub turn: TurnRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Ignore,
    Forward,
    /// Forward, then end the stream.
    Finish,
    /// End the stream with the failure carried in the event's `error`.
    Fail,
}

/// How one protocol family scopes its traffic and encodes approvals.
pub(crate) trait Dialect: Send + Sync + 'static {
    /// Decide what a notification means for `scope`.
    fn route(&self, scope: &TurnScope, method: &str, params: &Value) -> Route;

    /// Whether a server-initiated request belongs to `scope`. Requests that
    /// name no conversation at all belong to whoever sees them.
    fn owns_request(&self, scope: &TurnScope, method: &str, params: &Value) -> bool;

    /// Whether a turn in `conversation` should answer the request. Checked
    /// before the turn id is known, so only the conversation counts.
    fn claims(&self, conversation: &ConversationRef, params: &Value) -> bool;

    fn is_approval(&self, method: &str) -> bool;

    /// Lift a server request into an approval prompt, if it is one.
    fn approval(&self, agent: &str, scope: &TurnScope, method: &str, params: &Value) -> Option<ApprovalRequest>;

    /// Encode `decision` as the result for the approval request.
    fn answer(&self, method: &str, params: &Value, decision: ApprovalDecision) -> Value;
}

/// Decline approval requests nobody claimed and refuse everything else.
pub(crate) fn unclaimed_policy<D: Dialect>(dialect: Arc<D>) -> UnclaimedPolicy {
    UnclaimedPolicy::new(move |method, params| {
        if dialect.is_approval(method) {
            Ok(dialect.answer(method, params, ApprovalDecision::Decline))
        } else {
            Err(ErrorObject::method_not_found(method))
        }
    })
}

/// The right of a turn's pump to answer server requests, with the
/// responder it answers approvals through.
pub(crate) struct TurnOwner {
    claim: Arc<Claim>,
    approvals: Arc<dyn ApprovalResponder>,
}

impl TurnOwner {
    /// Claim `conversation`'s server requests on `client`. Take this before
    /// the turn-starting request goes out.
    pub fn claim<D: Dialect>(
        dialect: &Arc<D>,
        client: &Multiplexer,
        conversation: &ConversationRef,
        approvals: Arc<dyn ApprovalResponder>,
    ) -> Self {
        let dialect = Arc::clone(dialect);
        let conversation = conversation.clone();
        let claim = client.claim(move |_, params| dialect.claims(&conversation, params));
        Self {
            claim: Arc::new(claim),
            approvals,
        }
    }
}

/// The error a [`Route::Fail`] event carries.
fn failure(payload: &Value) -> Error {
    let error = payload
        .get("error")
        .cloned()
        .and_then(|error| serde_json::from_value::<ErrorObject>(error).ok())
        .unwrap_or_else(|| ErrorObject {
            code: -32603,
            message: "turn failed".to_string(),
            data: Some(payload.clone()),
        });
    RpcError::Rejected(error).into()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Turns with a live pump, so observers can tell a running turn from one
/// that already ended.
#[derive(Debug, Clone, Default)]
pub(crate) struct TurnBook {
    running: Arc<Mutex<HashSet<TurnScope>>>,
}

impl TurnBook {
    pub fn open(&self, scope: TurnScope) -> TurnEntry {
        lock(&self.running).insert(scope.clone());
        TurnEntry {
            book: self.clone(),
            scope,
        }
    }

    pub fn is_running(&self, conversation: &ConversationRef, turn: &TurnRef) -> bool {
        lock(&self.running).contains(&TurnScope {
            conversation: conversation.clone(),
            turn: turn.clone(),
        })
    }

    pub fn require_running(&self, conversation: &ConversationRef, turn: &TurnRef) -> Result<()> {
        if self.is_running(conversation, turn) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "no running turn {turn} in conversation {conversation}"
            )))
        }
    }
}

pub(crate) struct TurnEntry {
    book: TurnBook,
    scope: TurnScope,
}

impl Drop for TurnEntry {
    fn drop(&mut self) {
        lock(&self.book.running).remove(&self.scope);
    }
}

pub(crate) struct Pump<D: Dialect> {
    pub dialect: Arc<D>,
    pub agent: String,
    pub scope: TurnScope,
    pub client: Arc<Multiplexer>,
    pub inbound: InboundStream,
    /// Locally generated events for families without native turn events.
    pub synthetic: Option<broadcast::Receiver<RawEvent>>,
    /// `None` for observers, which never answer server requests.
    pub owner: Option<TurnOwner>,
    pub lease: Lease,
    /// Emitted before anything read from the session.
    pub prelude: Vec<RawEvent>,
    pub entry: Option<TurnEntry>,
}

enum Step {
    Inbound(Inbound),
    Synthetic(Option<RawEvent>),
    Gone,
    Abandoned,
}

impl<D: Dialect> Pump<D> {
    /// Run the pump on its own task and hand back its output.
    pub fn spawn(self) -> RawEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(tx));
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn run(mut self, tx: mpsc::UnboundedSender<Result<RawEvent>>) {
        for event in std::mem::take(&mut self.prelude) {
            let _ = tx.send(Ok(event));
        }
        let observer = self.owner.is_none();

        loop {
            // Inbound first: everything the session sent before a synthetic
            // event was published is already buffered there.
            let step = tokio::select! {
                biased;
                inbound = self.inbound.next() => match inbound {
                    Some(inbound) => Step::Inbound(inbound),
                    None => Step::Gone,
                },
                event = next_synthetic(&mut self.synthetic) => Step::Synthetic(event),
                _ = tx.closed(), if observer => Step::Abandoned,
            };

            match step {
                Step::Inbound(Inbound::Notification { method, params }) => {
                    let route = self.dialect.route(&self.scope, &method, &params);
                    if self.forward(&tx, route, RawEvent::notification(method, params)) {
                        break;
                    }
                }
                Step::Inbound(Inbound::ServerRequest {
                    id,
                    method,
                    params,
                    owner,
                }) => {
                    let mine = match (&self.owner, owner) {
                        (Some(turn), Some(owner)) => turn.claim.id() == owner,
                        _ => false,
                    };
                    if mine {
                        self.answer(&id, &method, &params);
                    } else if !self.dialect.owns_request(&self.scope, &method, &params) {
                        continue;
                    }
                    let _ = tx.send(Ok(RawEvent {
                        kind: method,
                        payload: params,
                        request_id: Some(id),
                    }));
                }
                Step::Inbound(Inbound::Disconnected { exit_status }) => {
                    warn!(
                        agent = %self.agent,
                        conversation = %self.scope.conversation,
                        turn = %self.scope.turn,
                        ?exit_status,
                        "agent disconnected mid-turn"
                    );
                    let _ = tx.send(Err(Error::BackendDisconnected { exit_status }));
                    break;
                }
                Step::Gone => {
                    let _ = tx.send(Err(Error::BackendDisconnected { exit_status: None }));
                    break;
                }
                Step::Synthetic(Some(event)) => {
                    let route = self.dialect.route(&self.scope, &event.kind, &event.payload);
                    if self.forward(&tx, route, event) {
                        break;
                    }
                }
                Step::Synthetic(None) => self.synthetic = None,
                Step::Abandoned => {
                    debug!(turn = %self.scope.turn, "event observer went away");
                    break;
                }
            }
        }
        debug!(
            agent = %self.agent,
            turn = %self.scope.turn,
            active = self.lease.active_operations(),
            "turn stream finished"
        );
    }

    /// Returns true when the stream should end.
    fn forward(&self, tx: &mpsc::UnboundedSender<Result<RawEvent>>, route: Route, event: RawEvent) -> bool {
        match route {
            Route::Ignore => false,
            Route::Forward => {
                let _ = tx.send(Ok(event));
                false
            }
            Route::Finish => {
                info!(
                    agent = %self.agent,
                    conversation = %self.scope.conversation,
                    turn = %self.scope.turn,
                    "turn finished"
                );
                let _ = tx.send(Ok(event));
                true
            }
            Route::Fail => {
                let error = failure(&event.payload);
                warn!(
                    agent = %self.agent,
                    conversation = %self.scope.conversation,
                    turn = %self.scope.turn,
                    error = %error,
                    "turn failed"
                );
                let _ = tx.send(Err(error));
                true
            }
        }
    }

    /// Answer a claimed server request off the pump's task; a slow
    /// responder must not stall event delivery. The claim stays alive until
    /// the answer is sent.
    fn answer(&self, id: &RequestId, method: &str, params: &Value) {
        let Some(owner) = &self.owner else {
            return;
        };
        let approvals = Arc::clone(&owner.approvals);
        let claim = Arc::clone(&owner.claim);
        let request = self.dialect.approval(&self.agent, &self.scope, method, params);
        let dialect = Arc::clone(&self.dialect);
        let client = Arc::clone(&self.client);
        let id = id.clone();
        let method = method.to_string();
        let params = params.clone();

        tokio::spawn(async move {
            let outcome = match request {
                Some(request) => {
                    let decision = approvals.decide(&request).await;
                    info!(
                        method = %method,
                        summary = %request.summary,
                        ?decision,
                        "answered approval request"
                    );
                    Ok(dialect.answer(&method, &params, decision))
                }
                None => {
                    warn!(method = %method, "unsupported server request");
                    Err(ErrorObject::method_not_found(&method))
                }
            };
            if let Err(e) = client.respond(&id, outcome) {
                warn!(%id, error = %e, "failed to answer server request");
            }
            drop(claim);
        });
    }
}

async fn next_synthetic(rx: &mut Option<broadcast::Receiver<RawEvent>>) -> Option<RawEvent> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "synthetic turn events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
