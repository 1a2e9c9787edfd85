//! # Session Registry & Idle/Session Reaper
//!
//! Thread-safe mapping from client identifier to per-connection bookkeeping,
//! plus the background sweep that evicts connections exceeding their idle or
//! total-session budgets.
//!
//! ## Locking discipline:
//! The registry map has its own lock, held only briefly during insert, remove
//! and the sweep's read pass. Per-connection state lives inside each relay
//! actor; the only shared pieces are the two timestamps in
//! [`ConnectionEntry`], and the reaper reads one connection's activity lock
//! at a time. Eviction itself is delivered as a [`ForceClose`] actor message,
//! so it serializes with in-flight client/provider message handling for that
//! connection through the actor mailbox — the sweep never races a transition.

use crate::config::AppConfig;

use actix::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why the reaper evicted a connection. On the wire both close with the
/// description "timeout"; logs keep the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// No client frames within the idle budget
    Idle,

    /// Total connection age exceeded the session budget
    SessionBudget,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::Idle => "idle_timeout",
            EvictReason::SessionBudget => "session_timeout",
        }
    }
}

/// Actor message forcing a connection into its closing transition.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ForceClose {
    pub reason: EvictReason,
}

/// Registry-side view of one live connection.
pub struct ConnectionEntry {
    /// When the socket was accepted
    pub created_at: Instant,

    /// Updated by the relay actor on every inbound client frame; shared with
    /// the reaper, which only ever reads it
    pub last_activity: Arc<RwLock<Instant>>,

    /// Mailbox address for eviction
    pub recipient: Recipient<ForceClose>,
}

/// Idle and total-session budgets for one sweep.
#[derive(Debug, Clone, Copy)]
pub struct ReaperPolicy {
    pub idle_budget: Duration,
    pub session_budget: Duration,
}

/// Decide whether a connection is overdue. Idle wins when both budgets are
/// exceeded, since it is the condition that fired first.
pub fn eviction_reason(
    created_at: Instant,
    last_activity: Instant,
    now: Instant,
    policy: &ReaperPolicy,
) -> Option<EvictReason> {
    if now.duration_since(last_activity) >= policy.idle_budget {
        return Some(EvictReason::Idle);
    }
    if now.duration_since(created_at) >= policy.session_budget {
        return Some(EvictReason::SessionBudget);
    }
    None
}

/// Thread-safe client-id → connection map. Insertion on accept, removal on
/// the `closed` transition; cheap to clone and share.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn insert(&self, client_id: String, entry: ConnectionEntry) {
        self.inner.write().unwrap().insert(client_id, entry);
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.inner.write().unwrap().remove(client_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// One reaper pass: find overdue connections and send each a
    /// [`ForceClose`]. Returns what was evicted (for logs and tests).
    ///
    /// The map lock is released before any message is sent; `do_send` never
    /// blocks, so a slow connection cannot stall the sweep of the others.
    /// Removal from the map happens in the evicted actor's own `closed`
    /// transition, not here.
    pub fn sweep(&self, now: Instant, policy: &ReaperPolicy) -> Vec<(String, EvictReason)> {
        let mut overdue = Vec::new();
        {
            let map = self.inner.read().unwrap();
            for (client_id, entry) in map.iter() {
                let last_activity = *entry.last_activity.read().unwrap();
                if let Some(reason) =
                    eviction_reason(entry.created_at, last_activity, now, policy)
                {
                    overdue.push((client_id.clone(), reason, entry.recipient.clone()));
                }
            }
        }

        let mut evicted = Vec::with_capacity(overdue.len());
        for (client_id, reason, recipient) in overdue {
            warn!(%client_id, reason = reason.as_str(), "evicting overdue connection");
            recipient.do_send(ForceClose { reason });
            evicted.push((client_id, reason));
        }
        evicted
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the periodic reaper. Budgets are re-read from configuration on every
/// tick so runtime tuning applies to the next sweep.
pub fn spawn_reaper(
    registry: SessionRegistry,
    config: Arc<RwLock<AppConfig>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.read().unwrap().limits.reaper_interval();
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; skip it so a fresh server
        // doesn't sweep an empty map at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let policy = {
                let cfg = config.read().unwrap();
                ReaperPolicy {
                    idle_budget: cfg.limits.idle_budget(),
                    session_budget: cfg.limits.session_budget(),
                }
            };
            let evicted = registry.sweep(Instant::now(), &policy);
            if evicted.is_empty() {
                debug!(connections = registry.len(), "reaper sweep: nothing overdue");
            }
        }
    })
}
