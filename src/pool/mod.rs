//! SSH connection pool
//!
//! A reference-counted cache of live connections keyed by
//! `(host, port, user)`. Many concurrent steps against the same endpoint
//! share one authenticated transport; each command still gets its own
//! session channel.
//!
//! Lifecycle of an entry:
//! - created by the first [`ConnectionPool::get`] for a key with no live entry
//! - borrowed by every later `get` whose liveness probe succeeds
//! - returned with [`ConnectionPool::release`], which never closes it
//! - closed by the idle sweep once unborrowed for longer than the idle
//!   timeout, by a failed probe, or by [`ConnectionPool::close_all`]
//! - if its liveness check fails while borrowed, unlinked and closed by the
//!   release that drops its refcount to zero
//!
//! Refcounts are only touched under the pool lock. Dialing runs outside it.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod client;
pub mod connector;
pub mod retry;

pub use client::{RemoteOutput, RemoteStatus, RusshConnector, SshConnection};
pub use connector::{auth_methods, AuthMethod, Connector, DialError};
pub use retry::RetryConfig;

use crate::config::SshConfig;

/// The pool used by SSH runners.
pub type SshPool = ConnectionPool<RusshConnector>;

/// Identifies one logical remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    pub fn from_config(config: &SshConfig) -> Self {
        Self::new(config.host.clone(), config.port(), config.user.clone())
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no authentication method configured for {0} (need key_file or password)")]
    NoAuthMethod(String),

    #[error("failed to connect to {addr}: {source}")]
    Dial { addr: String, source: DialError },

    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    DialExhausted {
        addr: String,
        attempts: u32,
        source: DialError,
    },
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::NoAuthMethod(_) => false,
            PoolError::Dial { source, .. } => source.is_transient(),
            PoolError::DialExhausted { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Unborrowed entries idle longer than this are closed by the sweep
    pub idle_timeout: Duration,
    /// How often the background sweep runs
    pub cleanup_interval: Duration,
    /// Per-attempt dial timeout
    pub connect_timeout: Duration,
    pub dial_retry: RetryConfig,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            dial_retry: RetryConfig::default(),
        }
    }
}

struct PooledConnection<T> {
    conn: Arc<T>,
    key: PoolKey,
    id: u64,
    last_used: Instant,
    ref_count: usize,
}

impl<T> PooledConnection<T> {
    fn lease(&self) -> Lease<T> {
        Lease {
            key: self.key.clone(),
            id: self.id,
            conn: self.conn.clone(),
        }
    }
}

/// A borrowed pooled connection. Hand it back with
/// [`ConnectionPool::release`]; the lease is consumed so it cannot be
/// released twice.
pub struct Lease<T> {
    key: PoolKey,
    id: u64,
    conn: Arc<T>,
}

impl<T> Lease<T> {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn connection(&self) -> &Arc<T> {
        &self.conn
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub ref_count: usize,
    pub idle: Duration,
}

struct Entries<T> {
    live: HashMap<PoolKey, PooledConnection<T>>,
    /// Entries unlinked by a failed liveness check while still borrowed,
    /// keyed by lease id. The last release closes them.
    detached: HashMap<u64, PooledConnection<T>>,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            live: HashMap::new(),
            detached: HashMap::new(),
        }
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    entries: Mutex<Entries<C::Connection>>,
    next_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    cleanup_running: Arc<AtomicBool>,
}

/// Clears the running flag when the cleanup task ends or is dropped with its
/// runtime.
struct CleanupGuard(Arc<AtomicBool>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// A standalone pool. The cleanup loop is not running until
    /// [`start_cleanup`](Self::start_cleanup) is called; SSH runners call it
    /// on every pooled setup.
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            connector,
            settings,
            entries: Mutex::new(Entries::default()),
            next_id: AtomicU64::new(1),
            stop_tx,
            stopped: AtomicBool::new(false),
            cleanup_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Borrow a connection for `config`'s endpoint, dialing one if needed.
    ///
    /// Cancel-safe: a refcount is only taken in the same critical section
    /// that hands out the lease.
    pub async fn get(&self, config: &SshConfig) -> Result<Lease<C::Connection>, PoolError> {
        let key = PoolKey::from_config(config);
        let auth = auth_methods(config);

        loop {
            if let Some(lease) = self.borrow_live(&key).await {
                return Ok(lease);
            }
            let auth = auth.as_ref().map_err(Clone::clone)?;
            let conn = self.dial(&key, auth).await?;

            let mut entries = self.entries.lock().await;
            if entries.live.contains_key(&key) {
                drop(entries);
                debug!(%key, "another caller connected first, closing duplicate connection");
                self.connector.close(&conn).await;
                continue;
            }

            let entry = PooledConnection {
                conn: Arc::new(conn),
                key: key.clone(),
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                last_used: Instant::now(),
                ref_count: 1,
            };
            let lease = entry.lease();
            entries.live.insert(key.clone(), entry);
            info!(%key, "opened pooled ssh connection");
            return Ok(lease);
        }
    }

    /// Lease the live entry for `key` if it is still alive. A dead entry is
    /// unlinked: closed now when unborrowed, else parked until its last
    /// release.
    async fn borrow_live(&self, key: &PoolKey) -> Option<Lease<C::Connection>> {
        let mut entries = self.entries.lock().await;
        let conn = entries.live.get(key)?.conn.clone();
        if self.connector.is_alive(&conn).await {
            let entry = entries.live.get_mut(key)?;
            entry.ref_count += 1;
            entry.last_used = Instant::now();
            debug!(%key, ref_count = entry.ref_count, "reusing pooled connection");
            return Some(entry.lease());
        }

        let dead = entries.live.remove(key)?;
        warn!(
            %key,
            ref_count = dead.ref_count,
            "pooled connection failed liveness check, discarding"
        );
        if dead.ref_count > 0 {
            entries.detached.insert(dead.id, dead);
            return None;
        }
        drop(entries);
        self.connector.close(&dead.conn).await;
        None
    }

    /// Dial a connection the pool does not track. The caller owns it and
    /// must close it.
    pub async fn dial_unpooled(&self, config: &SshConfig) -> Result<C::Connection, PoolError> {
        let key = PoolKey::from_config(config);
        let auth = auth_methods(config)?;
        self.dial(&key, &auth).await
    }

    /// Dial outside the pool lock, retrying transient network failures.
    async fn dial(&self, key: &PoolKey, auth: &[AuthMethod]) -> Result<C::Connection, PoolError> {
        let retry = &self.settings.dial_retry;
        let attempts = retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .connector
                .connect(key, auth, self.settings.connect_timeout)
                .await
            {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(%key, attempt, "ssh dial succeeded after retry");
                    }
                    return Ok(conn);
                }
                Err(err) if err.is_transient() => {
                    warn!(%key, attempt, max_attempts = attempts, error = %err, "ssh dial failed");
                    last_error = Some(err);
                }
                Err(err) => {
                    return Err(PoolError::Dial {
                        addr: key.addr(),
                        source: err,
                    });
                }
            }

            if attempt < attempts {
                let delay = retry.delay_after(attempt);
                debug!(%key, delay_ms = delay.as_millis() as u64, "retrying ssh dial");
                tokio::time::sleep(delay).await;
            }
        }

        Err(PoolError::DialExhausted {
            addr: key.addr(),
            attempts,
            source: last_error.unwrap_or_else(|| DialError::Other("no attempts made".into())),
        })
    }

    /// Return a borrowed connection. The connection stays open for reuse,
    /// unless its entry was discarded and this was the last borrower.
    pub async fn release(&self, lease: Lease<C::Connection>) {
        let orphan = {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.live.get_mut(&lease.key).filter(|e| e.id == lease.id) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.last_used = Instant::now();
                debug!(key = %lease.key, ref_count = entry.ref_count, "released pooled connection");
                return;
            }
            let Some(entry) = entries.detached.get_mut(&lease.id) else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return;
            }
            entries.detached.remove(&lease.id)
        };

        if let Some(entry) = orphan {
            debug!(key = %entry.key, "closing discarded connection after last release");
            self.connector.close(&entry.conn).await;
        }
    }

    /// Close and evict unborrowed entries idle past the timeout. Returns the
    /// number evicted.
    pub async fn sweep(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let expired: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<PoolKey> = entries
                .live
                .iter()
                .filter(|(_, e)| e.ref_count == 0 && e.last_used.elapsed() > idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.live.remove(&k))
                .collect()
        };

        for entry in &expired {
            info!(key = %entry.key, "closing idle ssh connection");
            self.connector.close(&entry.conn).await;
        }
        expired.len()
    }

    /// Force-close every entry, borrowed or not. For process shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let Entries { live, detached } = &mut *entries;
            live.drain()
                .map(|(_, e)| e)
                .chain(detached.drain().map(|(_, e)| e))
                .collect()
        };
        let closes = drained.iter().map(|entry| {
            if entry.ref_count > 0 {
                warn!(
                    key = %entry.key,
                    ref_count = entry.ref_count,
                    "closing borrowed connection at shutdown"
                );
            }
            self.connector.close(&entry.conn)
        });
        futures::future::join_all(closes).await;
    }

    /// Number of live entries. Discarded entries still borrowed are not
    /// counted.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.live.is_empty()
    }

    /// Discarded entries waiting for their last release.
    pub async fn detached_len(&self) -> usize {
        self.entries.lock().await.detached.len()
    }

    pub async fn stats(&self, key: &PoolKey) -> Option<EntryStats> {
        self.entries.lock().await.live.get(key).map(|e| EntryStats {
            ref_count: e.ref_count,
            idle: e.last_used.elapsed(),
        })
    }

    /// Halt the cleanup loop. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        debug!("ssh pool cleanup stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_running.load(Ordering::SeqCst)
    }

    /// Spawn the periodic idle sweep on the current Tokio runtime.
    ///
    /// Returns `None` without spawning when the loop is already running, the
    /// pool is stopped, or there is no runtime. A loop that ended with its
    /// runtime can be started again.
    pub fn start_cleanup(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.is_stopped() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let guard = CleanupGuard(self.cleanup_running.clone());
        let pool = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.settings.cleanup_interval;

        Some(runtime.spawn(async move {
            let _guard = guard;
            if *stop_rx.borrow_and_update() {
                return;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    // Fires on stop, or when the pool itself is dropped.
                    _ = stop_rx.changed() => break,
                }
                let Some(pool) = pool.upgrade() else { break };
                let evicted = pool.sweep().await;
                if evicted > 0 {
                    debug!(evicted, "ssh pool sweep");
                }
            }
            debug!("ssh pool cleanup loop exited");
        }))
    }
}

static GLOBAL_POOL: OnceLock<Arc<SshPool>> = OnceLock::new();

impl ConnectionPool<RusshConnector> {
    pub fn new_ssh(settings: PoolSettings) -> Self {
        Self::new(RusshConnector::new(), settings)
    }

    /// The process-wide pool, created on first use. Every call from inside
    /// a Tokio runtime makes sure its cleanup loop is running, unless the
    /// pool has been stopped.
    pub fn global() -> Arc<SshPool> {
        let pool = GLOBAL_POOL
            .get_or_init(|| Arc::new(SshPool::new_ssh(PoolSettings::default())))
            .clone();
        pool.start_cleanup();
        pool
    }

    /// Stop the global pool's sweep and close its connections.
    pub async fn shutdown_global() {
        if let Some(pool) = GLOBAL_POOL.get() {
            pool.stop();
            pool.close_all().await;
        }
    }
}
