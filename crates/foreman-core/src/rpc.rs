//! Request/response correlation over one [`Transport`].
//!
//! The [`Multiplexer`] assigns monotonically increasing request ids, parks
//! each caller on a oneshot until the matching response arrives, and
//! republishes everything else (notifications and server-initiated
//! requests) on a broadcast channel.
//!
//! Every pending request is resolved exactly once: by its response, by its
//! deadline, or by the channel closing. Removal from the pending table is
//! the single point where that decision is made.
//!
//! Server-initiated requests get exactly one answer too. Each is offered to
//! the registered [`Claim`]s in registration order and the first match owns
//! it; a request nobody claims is answered on the spot by the
//! multiplexer's [`UnclaimedPolicy`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

use crate::transport::{SendError, Transport, TransportEvent};

const JSONRPC_VERSION: &str = "2.0";
const INBOUND_CAPACITY: usize = 1024;

/// Identifier of a request on the wire. Ours are always numeric; servers
/// may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl RequestId {
    /// Our ids go out as numbers, so only a numeric id can answer one.
    fn as_local(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => u64::try_from(*n).ok(),
            RequestId::String(_) => None,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl ErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not supported by client: {method}"),
            data: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The multiplexer was already closed when the call was issued.
    #[error("channel closed")]
    Closed,
    /// The channel closed while the request was outstanding.
    #[error("disconnected while waiting for response")]
    Disconnected { exit_status: Option<i32> },
    #[error("{method} timed out after {after:?}")]
    TimedOut { method: String, after: Duration },
    #[error("server error: {0}")]
    Rejected(ErrorObject),
    #[error("failed to encode request: {0}")]
    Encode(serde_json::Error),
}

/// Anything inbound that is not a response to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Fire-and-forget message from the server.
    Notification { method: String, params: Value },
    /// Request initiated by the server. `owner` is the [`Claim`] that must
    /// answer it with [`Multiplexer::respond`]; `None` means the
    /// multiplexer already answered it.
    ServerRequest {
        id: RequestId,
        method: String,
        params: Value,
        owner: Option<u64>,
    },
    /// The channel closed. Always the last item.
    Disconnected { exit_status: Option<i32> },
}

pub type InboundStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

type AnswerFn = dyn Fn(&str, &Value) -> Result<Value, ErrorObject> + Send + Sync;
type ClaimFilter = Box<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Answer for server requests that no [`Claim`] owns, including requests
/// whose owner went away before answering.
#[derive(Clone)]
pub struct UnclaimedPolicy(Arc<AnswerFn>);

impl UnclaimedPolicy {
    pub fn new(answer: impl Fn(&str, &Value) -> Result<Value, ErrorObject> + Send + Sync + 'static) -> Self {
        Self(Arc::new(answer))
    }

    pub fn answer(&self, method: &str, params: &Value) -> Result<Value, ErrorObject> {
        (self.0)(method, params)
    }
}

impl Default for UnclaimedPolicy {
    /// Refuse everything as an unsupported method.
    fn default() -> Self {
        Self::new(|method, _| Err(ErrorObject::method_not_found(method)))
    }
}

impl std::fmt::Debug for UnclaimedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UnclaimedPolicy")
    }
}

impl PartialEq for UnclaimedPolicy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Open,
    Closed { exit_status: Option<i32> },
}

/// An outstanding request awaiting its response.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct PendingTable {
    /// `Some(exit_status)` once the channel has closed.
    closed: Option<Option<i32>>,
    entries: HashMap<u64, PendingRequest>,
}

/// A server request still waiting for its answer.
struct Unanswered {
    owner: Option<u64>,
    method: String,
    params: Value,
}

struct Shared {
    transport: Weak<Transport>,
    pending: Mutex<PendingTable>,
    /// Lock order: `unanswered` before `claims`.
    unanswered: Mutex<HashMap<RequestId, Unanswered>>,
    claims: Mutex<Vec<(u64, ClaimFilter)>>,
    next_claim: AtomicU64,
    unclaimed: UnclaimedPolicy,
    inbound: broadcast::Sender<Inbound>,
    link: watch::Sender<LinkState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    /// Fail every pending request and publish the disconnect. Returns
    /// `false` if the channel was already closed.
    fn shut(&self, exit_status: Option<i32>) -> bool {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = lock(&self.pending);
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(exit_status);
            table.entries.drain().collect()
        };

        if !drained.is_empty() {
            warn!(
                pending = drained.len(),
                ?exit_status,
                "channel closed with requests outstanding"
            );
        }
        for (id, request) in drained {
            debug!(id, method = %request.method, "failing pending request");
            let _ = request.tx.send(Err(RpcError::Disconnected { exit_status }));
        }

        lock(&self.unanswered).clear();
        self.link.send_replace(LinkState::Closed { exit_status });
        let _ = self.inbound.send(Inbound::Disconnected { exit_status });
        true
    }

    /// Record a server request and pick its owner: the first claim whose
    /// filter matches.
    fn admit(&self, id: &RequestId, method: &str, params: &Value) -> Option<u64> {
        let mut unanswered = lock(&self.unanswered);
        let owner = lock(&self.claims)
            .iter()
            .find(|(_, filter)| filter(method, params))
            .map(|(claim, _)| *claim);
        unanswered.insert(
            id.clone(),
            Unanswered {
                owner,
                method: method.to_string(),
                params: params.clone(),
            },
        );
        owner
    }

    fn answer_unclaimed(&self, id: &RequestId, method: &str, params: &Value) {
        let outcome = self.unclaimed.answer(method, params);
        debug!(%id, method, "answering unclaimed server request");
        if let Err(e) = self.respond(id, outcome) {
            warn!(%id, error = %e, "failed to answer server request");
        }
    }

    /// Drop a claim and hand whatever it still owns to the unclaimed policy.
    fn release(&self, claim: u64) {
        let orphaned: Vec<(RequestId, String, Value)> = {
            let unanswered = lock(&self.unanswered);
            lock(&self.claims).retain(|(id, _)| *id != claim);
            unanswered
                .iter()
                .filter(|(_, entry)| entry.owner == Some(claim))
                .map(|(id, entry)| (id.clone(), entry.method.clone(), entry.params.clone()))
                .collect()
        };
        for (id, method, params) in orphaned {
            self.answer_unclaimed(&id, &method, &params);
        }
    }

    fn respond(&self, id: &RequestId, outcome: Result<Value, ErrorObject>) -> Result<(), RpcError> {
        let closed = lock(&self.pending).closed.is_some();
        if lock(&self.unanswered).remove(id).is_none() {
            if closed {
                debug!(%id, "dropping answer to server request: channel closed");
            } else {
                warn!(%id, "ignoring answer to unknown or already answered server request");
            }
            return Ok(());
        }
        let Some(transport) = self.transport.upgrade() else {
            debug!(%id, "dropping answer to server request: channel closed");
            return Ok(());
        };

        let (result, error) = match &outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        let message = OutgoingResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
            error,
        };
        match transport.send(&message) {
            Ok(()) => Ok(()),
            Err(SendError::Closed) => {
                debug!(%id, "dropping answer to server request: channel closed");
                Ok(())
            }
            Err(SendError::Encode(e)) => Err(RpcError::Encode(e)),
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value, RpcError>) {
        let request = lock(&self.pending).entries.remove(&id);
        match request {
            Some(request) => {
                debug!(
                    id,
                    method = %request.method,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    "response received"
                );
                let _ = request.tx.send(outcome);
            }
            None => debug!(id, "discarding unmatched response"),
        }
    }
}

/// Removes the pending entry if the caller stops waiting early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).entries.remove(&self.id);
    }
}

fn is_null(value: &&Value) -> bool {
    value.is_null()
}

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    params: &'a Value,
}

#[derive(Serialize)]
struct OutgoingNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    params: &'a Value,
}

#[derive(Serialize)]
struct OutgoingResponse<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

/// Classification of one inbound JSON value.
#[derive(Debug, PartialEq)]
enum Classified {
    Response {
        id: RequestId,
        outcome: Result<Value, ErrorObject>,
    },
    Inbound(Inbound),
    Invalid,
}

fn classify(value: Value) -> Classified {
    let Value::Object(mut map) = value else {
        return Classified::Invalid;
    };
    let id = map
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
    let method = map
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let params = map.remove("params").unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), Some(method)) => Classified::Inbound(Inbound::ServerRequest {
            id,
            method,
            params,
            owner: None,
        }),
        (None, Some(method)) => Classified::Inbound(Inbound::Notification { method, params }),
        (Some(id), None) => {
            if let Some(error) = map.remove("error") {
                let error = serde_json::from_value(error.clone()).unwrap_or(ErrorObject {
                    code: -32603,
                    message: "malformed error object".to_string(),
                    data: Some(error),
                });
                Classified::Response {
                    id,
                    outcome: Err(error),
                }
            } else if let Some(result) = map.remove("result") {
                Classified::Response {
                    id,
                    outcome: Ok(result),
                }
            } else {
                Classified::Invalid
            }
        }
        (None, None) => Classified::Invalid,
    }
}

/// The right to answer server requests matching a filter. Dropping it
/// answers whatever it still owns with the unclaimed policy.
pub struct Claim {
    id: u64,
    shared: Arc<Shared>,
}

impl Claim {
    /// Compare with [`Inbound::ServerRequest`]'s `owner`.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Claim").field(&self.id).finish()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// Correlates concurrent requests over one transport.
pub struct Multiplexer {
    transport: Arc<Transport>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    link: watch::Receiver<LinkState>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("transport", &self.transport)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Multiplexer {
    /// Start demultiplexing `transport`'s inbound events, refusing every
    /// unclaimed server request.
    pub fn new(transport: Transport) -> Self {
        Self::with_policy(transport, UnclaimedPolicy::default())
    }

    pub fn with_policy(transport: Transport, unclaimed: UnclaimedPolicy) -> Self {
        let transport = Arc::new(transport);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (link_tx, link_rx) = watch::channel(LinkState::Open);
        let shared = Arc::new(Shared {
            transport: Arc::downgrade(&transport),
            pending: Mutex::new(PendingTable::default()),
            unanswered: Mutex::new(HashMap::new()),
            claims: Mutex::new(Vec::new()),
            next_claim: AtomicU64::new(1),
            unclaimed,
            inbound,
            link: link_tx,
        });

        match transport.receive() {
            Some(events) => {
                tokio::spawn(dispatch(events, Arc::clone(&shared)));
            }
            None => {
                warn!("transport events already taken; multiplexer starts closed");
                shared.shut(None);
            }
        }

        Self {
            transport,
            shared,
            next_id: AtomicU64::new(1),
            link: link_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Send `method` and wait for its result.
    ///
    /// With a `deadline`, the request resolves locally as
    /// [`RpcError::TimedOut`] on expiry; a late response is then discarded.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut table = lock(&self.shared.pending);
            if table.closed.is_some() {
                return Err(RpcError::Closed);
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let message = OutgoingRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: &params,
        };
        self.transport.send(&message).map_err(|e| match e {
            SendError::Closed => RpcError::Closed,
            SendError::Encode(e) => RpcError::Encode(e),
        })?;
        debug!(id, method, "request sent");

        let received = match deadline {
            Some(after) => match tokio::time::timeout(after, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    let removed = lock(&self.shared.pending).entries.remove(&id);
                    if removed.is_none() {
                        // Resolved between the deadline firing and the removal.
                        if let Ok(outcome) = rx.try_recv() {
                            return outcome;
                        }
                    }
                    warn!(id, method, ?after, "request timed out");
                    return Err(RpcError::TimedOut {
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };

        received.unwrap_or(Err(RpcError::Disconnected { exit_status: None }))
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let message = OutgoingNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params: &params,
        };
        self.transport.send(&message).map_err(|e| match e {
            SendError::Closed => RpcError::Closed,
            SendError::Encode(e) => RpcError::Encode(e),
        })
    }

    /// Answer a server-initiated request.
    ///
    /// At most one answer is sent per id. Answering an unknown or
    /// already-answered id, or answering after the channel closed, is a
    /// logged no-op.
    pub fn respond(&self, id: &RequestId, outcome: Result<Value, ErrorObject>) -> Result<(), RpcError> {
        self.shared.respond(id, outcome)
    }

    /// Register to answer server requests for which `filter` holds. Claims
    /// registered earlier win ties.
    pub fn claim(&self, filter: impl Fn(&str, &Value) -> bool + Send + Sync + 'static) -> Claim {
        let id = self.shared.next_claim.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.claims).push((id, Box::new(filter)));
        Claim {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Subscribe to notifications and server requests from this point on.
    ///
    /// The subscription is taken eagerly, so nothing published after this
    /// call returns is missed. The stream ends after
    /// [`Inbound::Disconnected`].
    pub fn notifications(&self) -> InboundStream {
        let mut rx = self.shared.inbound.subscribe();
        let state = *self.link.borrow();
        Box::pin(async_stream::stream! {
            if let LinkState::Closed { exit_status } = state {
                yield Inbound::Disconnected { exit_status };
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let last = matches!(event, Inbound::Disconnected { .. });
                        yield event;
                        if last {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.link.borrow(), LinkState::Closed { .. })
    }

    /// Resolve once the channel has closed, yielding the exit status if known.
    pub async fn closed(&self) -> Option<i32> {
        let mut link = self.link.clone();
        loop {
            if let LinkState::Closed { exit_status } = *link.borrow_and_update() {
                return exit_status;
            }
            if link.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).entries.len()
    }

    /// Tear down: fail all pending requests and terminate the process.
    pub async fn close(&self) {
        self.shared.shut(None);
        self.transport.close().await;
    }
}

async fn dispatch(mut events: crate::transport::EventStream, shared: Arc<Shared>) {
    let mut exit_status = None;
    while let Some(event) = events.next().await {
        match event {
            TransportEvent::Message(value) => match classify(value) {
                Classified::Response { id, outcome } => match id.as_local() {
                    Some(local) => shared.complete(local, outcome.map_err(RpcError::Rejected)),
                    None => debug!(%id, "discarding response with foreign id"),
                },
                Classified::Inbound(Inbound::ServerRequest { id, method, params, .. }) => {
                    let owner = shared.admit(&id, &method, &params);
                    debug!(%id, method = %method, ?owner, "server request received");
                    let unclaimed = owner.is_none().then(|| (id.clone(), method.clone(), params.clone()));
                    let _ = shared.inbound.send(Inbound::ServerRequest {
                        id,
                        method,
                        params,
                        owner,
                    });
                    if let Some((id, method, params)) = unclaimed {
                        shared.answer_unclaimed(&id, &method, &params);
                    }
                }
                Classified::Inbound(inbound) => {
                    // No subscribers is fine; nobody asked for events yet.
                    let _ = shared.inbound.send(inbound);
                }
                Classified::Invalid => warn!("ignoring inbound message that is neither request, response nor notification"),
            },
            TransportEvent::ParseError { .. } => {}
            TransportEvent::Closed { exit_status: status } => {
                exit_status = status;
                break;
            }
        }
    }
    shared.shut(exit_status);
}
