use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rendezvous_proto::Message;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Work items for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Message),
    Close { reason: String },
}

#[derive(Debug, Error)]
#[error("connection {0} is closed")]
pub struct ConnectionClosed(pub Uuid);

/// The server's side of one accepted duplex connection.
///
/// Only the connection's own writer task touches the socket. Everyone else
/// enqueues through [`ConnectionHandle::send`], so writes are serialized
/// without any lock shared between connections.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
    last_activity: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        shutdown: Arc<Notify>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            outbound,
            shutdown,
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, message: Message) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(Outbound::Frame(message))
            .map_err(|_| ConnectionClosed(self.id))
    }

    /// Asks the writer to send a close frame and wakes the read loop.
    /// Safe to call more than once.
    pub fn close(&self, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            reason: reason.to_string(),
        });
        self.shutdown.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called or the writer died.
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// One identity bound to one live connection.
#[derive(Debug)]
pub struct RegisteredConnection {
    identity: String,
    auth_code: String,
    version: u64,
    connection: Arc<ConnectionHandle>,
    /// Identities this endpoint has reached with their secret; they may
    /// answer back without knowing ours.
    answer_grants: Mutex<HashSet<String>>,
}

impl RegisteredConnection {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// Whether a message from `from` carrying `presented` may be delivered here.
    pub fn authorizes(&self, presented: Option<&str>, from: &str) -> bool {
        if presented == Some(self.auth_code.as_str()) {
            return true;
        }
        self.answer_grants.lock().contains(from)
    }

    pub fn grant_answer(&self, identity: &str) {
        self.answer_grants.lock().insert(identity.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Replaced,
    Disconnected,
    WriteFailed,
    Idle,
}

impl EvictReason {
    pub fn label(self) -> &'static str {
        match self {
            EvictReason::Replaced => "replaced",
            EvictReason::Disconnected => "disconnected",
            EvictReason::WriteFailed => "write_failed",
            EvictReason::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub identity: String,
    pub version: u64,
    pub connection_id: Uuid,
    pub remote_addr: Option<String>,
    pub idle_ms: u64,
}

/// Maps each identity to the connection it is currently reachable on.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: DashMap<String, Arc<RegisteredConnection>>,
    /// Serializes insert/evict. Lookups go straight to `entries`.
    structural: Mutex<()>,
    next_version: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `connection`, evicting whatever held it before.
    pub fn register(
        &self,
        identity: String,
        auth_code: String,
        connection: Arc<ConnectionHandle>,
    ) -> Arc<RegisteredConnection> {
        let _guard = self.inner.structural.lock();

        let previous = self
            .inner
            .entries
            .get(&identity)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(previous) = previous {
            if previous.connection.id == connection.id {
                // Same socket registering again: keep it open.
                self.remove_if_current(&previous);
            } else {
                self.evict_locked(&previous, EvictReason::Replaced);
            }
        }

        let version = self.inner.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Arc::new(RegisteredConnection {
            identity: identity.clone(),
            auth_code,
            version,
            connection,
            answer_grants: Mutex::new(HashSet::new()),
        });
        self.inner.entries.insert(identity, Arc::clone(&entry));

        counter!("rendezvous_registrations_total").increment(1);
        gauge!("rendezvous_registered_identities").set(self.inner.entries.len() as f64);
        info!(
            identity = %entry.identity,
            version,
            connection_id = %entry.connection.id,
            "identity registered"
        );
        entry
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<RegisteredConnection>> {
        self.inner
            .entries
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Closes the entry's transport and drops the mapping if it still points
    /// at this exact registration. Returns whether the mapping was removed.
    pub fn evict(&self, entry: &RegisteredConnection, reason: EvictReason) -> bool {
        let _guard = self.inner.structural.lock();
        self.evict_locked(entry, reason)
    }

    fn evict_locked(&self, entry: &RegisteredConnection, reason: EvictReason) -> bool {
        entry.connection.close(reason.label());
        let removed = self.remove_if_current(entry);
        if removed {
            counter!("rendezvous_evictions_total", "reason" => reason.label()).increment(1);
            info!(
                identity = %entry.identity,
                version = entry.version,
                connection_id = %entry.connection.id,
                reason = reason.label(),
                "identity evicted"
            );
        } else {
            debug!(
                identity = %entry.identity,
                version = entry.version,
                reason = reason.label(),
                "eviction skipped; identity already re-registered or gone"
            );
        }
        removed
    }

    fn remove_if_current(&self, entry: &RegisteredConnection) -> bool {
        let removed = self
            .inner
            .entries
            .remove_if(&entry.identity, |_, current| current.version == entry.version)
            .is_some();
        if removed {
            gauge!("rendezvous_registered_identities").set(self.inner.entries.len() as f64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let now = now_millis();
        let mut entries: Vec<EntrySnapshot> = self
            .inner
            .entries
            .iter()
            .map(|entry| {
                let value = entry.value();
                EntrySnapshot {
                    identity: value.identity.clone(),
                    version: value.version,
                    connection_id: value.connection.id,
                    remote_addr: value.connection.remote_addr.map(|addr| addr.to_string()),
                    idle_ms: now.saturating_sub(value.connection.last_activity()),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    /// Entries whose connection has been silent for longer than `timeout`.
    pub fn collect_idle(&self, now: u64, timeout: Duration) -> Vec<Arc<RegisteredConnection>> {
        let limit = timeout.as_millis() as u64;
        self.inner
            .entries
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().connection.last_activity()) > limit)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn evict_idle(&self, now: u64, timeout: Duration) -> usize {
        let idle = self.collect_idle(now, timeout);
        let mut evicted = 0usize;
        for entry in idle {
            info!(
                identity = %entry.identity,
                connection_id = %entry.connection.id,
                "no heartbeat within idle timeout"
            );
            if self.evict(&entry, EvictReason::Idle) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Periodically evicts identities whose connection stopped talking.
    pub fn spawn_reaper(&self, idle_timeout: Duration, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(now_millis(), idle_timeout);
                if evicted > 0 {
                    debug!(evicted, "idle reaper pass");
                }
            }
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
