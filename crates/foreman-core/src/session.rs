//! One agent process bound to one workspace.
//!
//! A [`SessionHandle`] starts unstarted, runs the two-step handshake
//! exactly once under its start mutex, and is then ready for domain calls.
//! Work against a handle is counted through [`Lease`]s: the count is what
//! keeps eviction away from in-flight turns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LaunchSpec;
use crate::error::{Error, Result};
use crate::rpc::{Multiplexer, RpcError, UnclaimedPolicy};
use crate::transport::Transport;
use crate::workspace::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Ready,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The startup exchange: one request awaiting a result, then an optional
/// fire-and-forget acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub method: String,
    pub params: Value,
    pub ack: Option<String>,
}

/// Everything needed to start a session for some workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBlueprint {
    /// Agent id; sessions of different agents never share a process.
    pub agent: String,
    pub launch: LaunchSpec,
    pub handshake: Handshake,
    /// How server requests that no running turn claims get answered.
    pub unclaimed: UnclaimedPolicy,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionTiming {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

struct Inner {
    state: SessionState,
    client: Option<Arc<Multiplexer>>,
    server_info: Option<Value>,
}

pub struct SessionHandle {
    instance: Uuid,
    workspace: WorkspaceId,
    blueprint: SessionBlueprint,
    timing: SessionTiming,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
    active_ops: AtomicUsize,
    start_lock: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("instance", &self.instance)
            .field("agent", &self.blueprint.agent)
            .field("workspace", &self.workspace)
            .field("state", &self.state())
            .field("active_ops", &self.active_operations())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionHandle {
    pub(crate) fn new(workspace: WorkspaceId, blueprint: SessionBlueprint, timing: SessionTiming) -> Self {
        Self {
            instance: Uuid::new_v4(),
            workspace,
            blueprint,
            timing,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
            active_ops: AtomicUsize::new(0),
            start_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SessionState::Unstarted,
                client: None,
                server_info: None,
            }),
        }
    }

    /// Unique per handle; a restarted workspace gets a new instance id.
    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn agent(&self) -> &str {
        &self.blueprint.agent
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        let inner = lock(&self.inner);
        match (&inner.state, &inner.client) {
            (SessionState::Ready, Some(client)) if client.is_closed() => SessionState::Closed,
            (state, _) => *state,
        }
    }

    /// Result of the `initialize` exchange, once ready.
    pub fn server_info(&self) -> Option<Value> {
        lock(&self.inner).server_info.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).client.as_ref().and_then(|c| c.pid())
    }

    pub fn active_operations(&self) -> usize {
        self.active_ops.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// The ready client, or `NotReady` before the handshake completed.
    pub fn client(&self) -> Result<Arc<Multiplexer>> {
        let inner = lock(&self.inner);
        match (&inner.state, &inner.client) {
            (SessionState::Ready, Some(client)) if !client.is_closed() => Ok(Arc::clone(client)),
            (SessionState::Ready, Some(_)) | (SessionState::Closed, _) => Err(Error::TransportClosed),
            (state, _) => Err(Error::NotReady(format!("session is {state}"))),
        }
    }

    /// Count one operation against this handle until the lease drops.
    pub fn begin_operation(self: &Arc<Self>) -> Lease {
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Lease {
            handle: Arc::clone(self),
        }
    }

    /// Run the handshake if nobody has yet; otherwise wait for the one in
    /// flight. Exactly one handshake is attempted per handle.
    pub async fn start(&self) -> Result<Arc<Multiplexer>> {
        if let Ok(client) = self.client() {
            return Ok(client);
        }

        let _start = self.start_lock.lock().await;
        let previous = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            if matches!(previous, SessionState::Unstarted | SessionState::Starting) {
                inner.state = SessionState::Starting;
            }
            previous
        };
        if matches!(previous, SessionState::Ready | SessionState::Closed) {
            return self.client();
        }

        info!(
            agent = %self.blueprint.agent,
            workspace = %self.workspace,
            "starting agent session"
        );
        match self.handshake().await {
            Ok((client, server_info)) => {
                let mut inner = lock(&self.inner);
                inner.state = SessionState::Ready;
                inner.client = Some(Arc::clone(&client));
                inner.server_info = Some(server_info);
                debug!(workspace = %self.workspace, pid = ?client.pid(), "session ready");
                Ok(client)
            }
            Err(e) => {
                warn!(
                    agent = %self.blueprint.agent,
                    workspace = %self.workspace,
                    error = %e,
                    "session failed to start"
                );
                lock(&self.inner).state = SessionState::Closed;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(Arc<Multiplexer>, Value)> {
        let transport = Transport::spawn(
            &self.blueprint.launch,
            self.workspace.path(),
            self.timing.shutdown_grace,
        )?;
        let client = Arc::new(Multiplexer::with_policy(transport, self.blueprint.unclaimed.clone()));
        let handshake = &self.blueprint.handshake;

        let result = client
            .call(
                &handshake.method,
                handshake.params.clone(),
                Some(self.timing.handshake_timeout),
            )
            .await;
        let server_info = match result {
            Ok(info) => info,
            Err(e) => {
                client.close().await;
                return Err(handshake_error(&handshake.method, e));
            }
        };

        if let Some(ack) = &handshake.ack {
            if let Err(e) = client.notify(ack, Value::Null) {
                client.close().await;
                return Err(handshake_error(ack, e));
            }
        }
        Ok((client, server_info))
    }

    /// Terminate the process and fail anything still waiting on it.
    pub async fn shutdown(&self) {
        let client = {
            let mut inner = lock(&self.inner);
            inner.state = SessionState::Closed;
            inner.client.take()
        };
        if let Some(client) = client {
            client.close().await;
        }
    }
}

fn handshake_error(method: &str, err: RpcError) -> Error {
    Error::HandshakeFailed(format!("{method}: {err}"))
}

/// Counts one in-flight operation on a session; decrements on drop, on
/// every exit path.
pub struct Lease {
    handle: Arc<SessionHandle>,
}

impl Lease {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn client(&self) -> Result<Arc<Multiplexer>> {
        self.handle.client()
    }
}

impl std::ops::Deref for Lease {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.handle).finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.handle.touch();
        self.handle.active_ops.fetch_sub(1, Ordering::AcqRel);
    }
}
