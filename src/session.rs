//! Live session tracking shared by the SSH and SOCKS5 gateways.
//!
//! Both gateways register their authenticated connections here so a single
//! background flusher can account usage for every live session, and so
//! shutdown can run one final unconditional flush.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::meter::{Direction, UsageMeter};
use crate::store::{Account, AccountStore};

/// How often live sessions are flushed to the store.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Ephemeral per-connection state, created after authentication.
#[derive(Debug)]
pub struct TunnelSession {
    pub id: u64,
    pub account_id: i64,
    pub username: String,
    pub peer_addr: Option<SocketAddr>,
    pub started_at: DateTime<Utc>,
    pub meter: UsageMeter,
    close: CancellationToken,
    closed: AtomicBool,
}

impl TunnelSession {
    /// Token the session's copy pumps select on; fires when either side of
    /// the tunnel must come down.
    pub fn close_signal(&self) -> &CancellationToken {
        &self.close
    }

    /// Close both directions of the tunnel. Idempotent; the first caller
    /// wins and every pump unblocks.
    pub fn close_both(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Session {} closing both directions", self.id);
            self.close.cancel();
        }
    }
}

/// Registry of live sessions, keyed by session id.
///
/// Read-hot (flusher iteration, channel opens), write-rare (create/destroy).
/// Session close tokens are children of the gateway shutdown token, so a
/// process-wide cancel unblocks every copy pump.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Arc<TunnelSession>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Create and register a session for an authenticated account. The
    /// meter's base/limit are snapshotted from the account record.
    pub async fn open(
        &self,
        account: &Account,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<TunnelSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(TunnelSession {
            id,
            account_id: account.id,
            username: account.username.clone(),
            peer_addr,
            started_at: Utc::now(),
            meter: UsageMeter::new(account.traffic_used, account.traffic_limit),
            close: self.shutdown.child_token(),
            closed: AtomicBool::new(false),
        });
        self.sessions.write().await.insert(id, session.clone());
        info!(
            "Session {} opened for '{}' from {:?}",
            id, account.username, peer_addr
        );
        session
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<TunnelSession>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Write every live session's unflushed delta to the store.
pub async fn flush_all(registry: &SessionRegistry, store: &AccountStore) {
    for session in registry.list().await {
        let delta = session.meter.take_unflushed();
        if delta == 0 {
            continue;
        }
        if let Err(e) = store.add_usage(session.account_id, delta).await {
            warn!(
                "Failed to flush {} bytes for '{}': {}",
                delta, session.username, e
            );
        }
    }
}

/// Tear down a session: force-close both pumps, flush the remaining delta,
/// and drop the record.
pub async fn finish_session(registry: &SessionRegistry, store: &AccountStore, id: u64) {
    let Some(session) = registry.remove(id).await else {
        return;
    };
    session.close_both();

    let delta = session.meter.take_unflushed();
    if delta > 0 {
        if let Err(e) = store.add_usage(session.account_id, delta).await {
            warn!(
                "Failed to flush {} bytes for '{}': {}",
                delta, session.username, e
            );
        }
    }
    info!(
        "Session {} for '{}' finished: {} up / {} down",
        id,
        session.username,
        session.meter.bytes_up(),
        session.meter.bytes_down()
    );
}

/// Pump both directions of a tunnel through the session's meter until one
/// side closes, errors, or exhausts the quota; the close-both-once guard
/// then tears the other direction down too.
pub async fn run_session_pumps<C, U>(client: C, upstream: U, session: Arc<TunnelSession>)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let up = tokio::spawn(pump_guarded(
        client_read,
        upstream_write,
        session.clone(),
        Direction::Up,
    ));
    let down = tokio::spawn(pump_guarded(
        upstream_read,
        client_write,
        session.clone(),
        Direction::Down,
    ));

    let _ = up.await;
    let _ = down.await;
}

async fn pump_guarded<R, W>(reader: R, writer: W, session: Arc<TunnelSession>, direction: Direction)
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::select! {
        _ = session.close_signal().cancelled() => {}
        result = crate::meter::pump(reader, writer, &session.meter, direction) => {
            match result {
                Ok(copied) => debug!(
                    "Session {} {:?} pump done after {} bytes",
                    session.id, direction, copied
                ),
                Err(crate::error::GatewayError::QuotaExhausted) => info!(
                    "Session {} for '{}' exhausted its traffic quota",
                    session.id, session.username
                ),
                Err(e) => debug!("Session {} {:?} pump ended: {}", session.id, direction, e),
            }
        }
    }
    // First direction to finish takes the peer down with it.
    session.close_both();
}

/// Spawn the background usage flusher. Runs until `shutdown` fires, then
/// performs one final unconditional flush before exiting.
pub fn spawn_usage_flusher(
    registry: Arc<SessionRegistry>,
    store: Arc<AccountStore>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => flush_all(&registry, &store).await,
            }
        }

        flush_all(&registry, &store).await;
        debug!("Usage flusher stopped");
    })
}
