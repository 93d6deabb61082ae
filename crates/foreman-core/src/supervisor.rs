//! The pool of live sessions: one per (agent, workspace).
//!
//! Creation is serialized per key by a slot gate, never by a global lock,
//! so a slow handshake for one workspace cannot delay another. The gate is
//! also what eviction takes before looking at a handle's active-operation
//! count; because [`Supervisor::acquire`] raises that count while still
//! holding the gate, a handle observed idle under the gate really is idle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::session::{Lease, SessionBlueprint, SessionHandle, SessionState, SessionTiming};
use crate::workspace::WorkspaceId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    agent: String,
    workspace: WorkspaceId,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.agent, self.workspace)
    }
}

/// Per-key cell. `handle` and `retired` are only mutated while `gate` is
/// held; readers may look at them without it.
#[derive(Default)]
struct Slot {
    gate: tokio::sync::Mutex<()>,
    handle: Mutex<Option<Arc<SessionHandle>>>,
    retired: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Slot {
    fn current(&self) -> Option<Arc<SessionHandle>> {
        lock(&self.handle).clone()
    }

    fn set(&self, handle: Option<Arc<SessionHandle>>) {
        *lock(&self.handle) = handle;
    }
}

/// Point-in-time view of one live session, for status tooling.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub agent: String,
    pub workspace: PathBuf,
    pub state: SessionState,
    pub active_operations: usize,
    pub idle_secs: u64,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

struct Inner {
    config: SupervisorConfig,
    slots: Mutex<HashMap<SessionKey, Arc<Slot>>>,
    /// Set by `close_all` under the `slots` lock; no slot is created after.
    closed: AtomicBool,
    sessions_started: AtomicU64,
}

/// Owns every [`SessionHandle`] in the process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.inner.config)
            .field("live", &self.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                sessions_started: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Number of handshakes that have succeeded over this supervisor's life.
    pub fn sessions_started(&self) -> u64 {
        self.inner.sessions_started.load(Ordering::Relaxed)
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        lock(&self.inner.slots)
            .values()
            .filter(|slot| slot.current().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the ready session for `workspace`, starting one if needed, and
    /// count one operation against it until the returned lease drops.
    ///
    /// Concurrent callers for the same key queue behind the one handshake
    /// in flight. A failed start leaves nothing registered. Fails once
    /// [`Supervisor::close_all`] has run.
    pub async fn acquire(&self, blueprint: &SessionBlueprint, workspace: &Path) -> Result<Lease> {
        let key = SessionKey {
            agent: blueprint.agent.clone(),
            workspace: WorkspaceId::resolve_async(workspace).await?,
        };

        loop {
            let Some(slot) = self.inner.slot_for(&key) else {
                return Err(Error::NotReady("supervisor is shut down".to_string()));
            };
            let gate = slot.gate.lock().await;
            if slot.retired.load(Ordering::Acquire) {
                // Evicted or torn down while we queued; look again.
                continue;
            }

            let (handle, fresh) = match slot.current() {
                Some(handle) if handle.state() != SessionState::Closed => (handle, false),
                stale => {
                    if let Some(stale) = stale {
                        debug!(key = %key, instance = %stale.instance_id(), "replacing closed session");
                        stale.shutdown().await;
                    }
                    let handle = Arc::new(SessionHandle::new(
                        key.workspace.clone(),
                        blueprint.clone(),
                        self.inner.timing(),
                    ));
                    slot.set(Some(Arc::clone(&handle)));
                    (handle, true)
                }
            };

            let lease = handle.begin_operation();
            match handle.start().await {
                Ok(client) => {
                    if fresh {
                        self.inner.sessions_started.fetch_add(1, Ordering::Relaxed);
                        self.spawn_monitor(key.clone(), Arc::clone(&handle), client);
                    }
                    drop(gate);
                    if fresh {
                        self.enforce_capacity().await;
                    }
                    return Ok(lease);
                }
                Err(e) => {
                    drop(lease);
                    self.inner.retire(&key, &slot);
                    drop(gate);
                    handle.shutdown().await;
                    return Err(e);
                }
            }
        }
    }

    fn spawn_monitor(
        &self,
        key: SessionKey,
        handle: Arc<SessionHandle>,
        client: Arc<crate::rpc::Multiplexer>,
    ) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit_status = client.closed().await;
            drop(client);
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.on_disconnect(&key, &handle, exit_status).await;
        });
    }

    /// Run one eviction pass: idle-TTL first, then count pressure.
    /// Returns the number of handles evicted.
    pub async fn sweep(&self) -> usize {
        let ttl = self.inner.config.idle_ttl();
        let slots = self.inner.slots_snapshot();
        let mut victims = Vec::new();

        for (key, slot) in &slots {
            let Ok(_gate) = slot.gate.try_lock() else {
                continue;
            };
            let Some(handle) = slot.current() else {
                continue;
            };
            if handle.active_operations() == 0 && handle.idle_for() > ttl {
                info!(key = %key, idle_secs = handle.idle_for().as_secs(), "evicting idle session");
                self.inner.retire(key, slot);
                victims.push(handle);
            }
        }

        victims.extend(self.inner.evict_over_capacity());
        let evicted = victims.len();
        for handle in victims {
            handle.shutdown().await;
        }
        evicted
    }

    async fn enforce_capacity(&self) {
        for handle in self.inner.evict_over_capacity() {
            handle.shutdown().await;
        }
    }

    /// Run [`Supervisor::sweep`] every `sweep_interval` until cancelled.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = supervisor.sweep().await;
                        if evicted > 0 {
                            debug!(evicted, "reaper sweep");
                        }
                    }
                }
            }
        })
    }

    /// Evict every handle regardless of activity and refuse new sessions
    /// from here on. For process shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<(SessionKey, Arc<Slot>)> = {
            let mut slots = lock(&self.inner.slots);
            self.inner.closed.store(true, Ordering::Release);
            slots.drain().collect()
        };
        let mut handles = Vec::new();
        for (key, slot) in slots {
            let _gate = slot.gate.lock().await;
            slot.retired.store(true, Ordering::Release);
            if let Some(handle) = lock(&slot.handle).take() {
                debug!(key = %key, active = handle.active_operations(), "closing session");
                handles.push(handle);
            }
        }
        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.shutdown())).await;
        if count > 0 {
            info!(count, "closed all agent sessions");
        }
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .inner
            .slots_snapshot()
            .into_iter()
            .filter_map(|(key, slot)| {
                let handle = slot.current()?;
                Some(SessionInfo {
                    agent: key.agent.clone(),
                    workspace: key.workspace.path().to_path_buf(),
                    state: handle.state(),
                    active_operations: handle.active_operations(),
                    idle_secs: handle.idle_for().as_secs(),
                    pid: handle.pid(),
                    created_at: handle.created_at(),
                })
            })
            .collect();
        infos.sort_by(|a, b| (&a.agent, &a.workspace).cmp(&(&b.agent, &b.workspace)));
        infos
    }
}

impl Inner {
    fn timing(&self) -> SessionTiming {
        SessionTiming {
            handshake_timeout: self.config.handshake_timeout(),
            shutdown_grace: self.config.shutdown_grace(),
        }
    }

    fn slot_for(&self, key: &SessionKey) -> Option<Arc<Slot>> {
        let mut slots = lock(&self.slots);
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(Arc::clone(slots.entry(key.clone()).or_default()))
    }

    fn slots_snapshot(&self) -> Vec<(SessionKey, Arc<Slot>)> {
        lock(&self.slots)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Clear and unregister `slot`. Caller holds the slot's gate.
    fn retire(&self, key: &SessionKey, slot: &Arc<Slot>) {
        slot.set(None);
        slot.retired.store(true, Ordering::Release);
        let mut slots = lock(&self.slots);
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Pick zero-activity handles, oldest first, until the live count is
    /// within bounds. Busy handles are never chosen.
    fn evict_over_capacity(&self) -> Vec<Arc<SessionHandle>> {
        let max = self.config.max_sessions;
        let mut victims = Vec::new();
        loop {
            let live: Vec<(SessionKey, Arc<Slot>, Arc<SessionHandle>)> = self
                .slots_snapshot()
                .into_iter()
                .filter_map(|(key, slot)| {
                    let handle = slot.current()?;
                    Some((key, slot, handle))
                })
                .collect();
            if live.len() <= max {
                break;
            }

            let mut candidates: Vec<_> = live
                .into_iter()
                .filter(|(_, _, handle)| handle.active_operations() == 0)
                .collect();
            candidates.sort_by_key(|(_, _, handle)| handle.last_used());

            let mut evicted_one = false;
            for (key, slot, handle) in candidates {
                let Ok(_gate) = slot.gate.try_lock() else {
                    continue;
                };
                let still_current = slot.current().is_some_and(|h| Arc::ptr_eq(&h, &handle));
                if !still_current || handle.active_operations() != 0 {
                    continue;
                }
                info!(key = %key, max, "evicting least recently used session over capacity");
                self.retire(&key, &slot);
                victims.push(handle);
                evicted_one = true;
                break;
            }
            if !evicted_one {
                debug!(max, "over capacity but every session is busy");
                break;
            }
        }
        victims
    }

    async fn on_disconnect(&self, key: &SessionKey, handle: &Arc<SessionHandle>, exit_status: Option<i32>) {
        let slot = lock(&self.slots).get(key).cloned();
        let Some(slot) = slot else {
            return;
        };
        let gate = slot.gate.lock().await;
        let registered = slot.current().is_some_and(|h| Arc::ptr_eq(&h, handle));
        if !registered {
            // Evicted or replaced already; that path did the teardown.
            return;
        }

        let active = handle.active_operations();
        if active == 0 {
            info!(key = %key, ?exit_status, "agent exited while idle; session removed");
        } else {
            warn!(
                key = %key,
                ?exit_status,
                active,
                "agent exited with operations in flight; they fail as disconnected"
            );
        }
        self.retire(key, &slot);
        drop(gate);
        handle.shutdown().await;
    }
}
