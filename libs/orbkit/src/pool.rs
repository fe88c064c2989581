//! Per-address connection pool shared by the gRPC and DRPC transports.
//!
//! Every address owns `size` slots. A caller waits for a free slot, FIFO,
//! then gets the slot's connection, dialing a fresh one when the slot is
//! blank or its connection sat idle past the TTL. Dropping the
//! [`PooledConn`] hands the slot back; connections past their max life or
//! marked unhealthy are closed instead of being kept.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orbkit_errors::OrbError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::Instrument as _;

use crate::context::Context;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("timed out waiting for a pooled connection")]
    Timeout,
}

impl From<PoolError> for OrbError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Closed => OrbError::UNAVAILABLE.wrap(err),
            PoolError::Timeout => OrbError::TIMEOUT.wrap(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections per address.
    pub size: usize,
    /// Addresses tracked at once; the least recently used one is dropped
    /// beyond that. Zero is unbounded.
    pub hosts: usize,
    /// Idle connections older than this are redialed on their next use.
    /// Zero disables recycling.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Connections older than this are closed when released. Zero disables
    /// the limit.
    #[serde(with = "humantime_serde")]
    pub max_life: Duration,
    /// Upper bound for one dial. Zero is unbounded.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 256,
            hosts: 0,
            ttl: Duration::from_secs(30),
            max_life: Duration::ZERO,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_life(mut self, max_life: Duration) -> Self {
        self.max_life = max_life;
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

/// Dials connections for a [`Pool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Conn, OrbError>;
}

struct Live<C> {
    conn: C,
    initiated_at: Instant,
    last_used: Instant,
}

struct Slots<C> {
    permits: Arc<Semaphore>,
    size: usize,
    idle: Mutex<Vec<Live<C>>>,
    last_access: Mutex<Instant>,
}

impl<C> Slots<C> {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            idle: Mutex::new(Vec::new()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    /// No connection is checked out.
    fn is_quiet(&self) -> bool {
        self.permits.available_permits() == self.size
    }

    fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }
}

struct Inner<F: Connector> {
    connector: F,
    config: PoolConfig,
    hosts: RwLock<HashMap<String, Arc<Slots<F::Conn>>>>,
    closed: AtomicBool,
}

/// A bounded, per-address pool of connections produced by a [`Connector`].
pub struct Pool<F: Connector> {
    inner: Arc<Inner<F>>,
}

impl<F: Connector> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Connector> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("hosts", &self.inner.hosts.read().len())
            .finish_non_exhaustive()
    }
}

impl<F: Connector> Pool<F> {
    #[must_use]
    pub fn new(connector: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                hosts: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn slots(&self, address: &str) -> Result<Arc<Slots<F::Conn>>, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if let Some(slots) = self.inner.hosts.read().get(address) {
            *slots.last_access.lock() = Instant::now();
            return Ok(Arc::clone(slots));
        }

        let mut hosts = self.inner.hosts.write();
        if let Some(slots) = hosts.get(address) {
            return Ok(Arc::clone(slots));
        }
        let limit = self.inner.config.hosts;
        if limit > 0 && hosts.len() >= limit {
            // Hosts with checked-out connections stay, so the address never
            // exceeds its slot count. The limit is then exceeded until one
            // goes quiet.
            let oldest = hosts
                .iter()
                .filter(|(_, s)| s.is_quiet())
                .min_by_key(|(_, s)| *s.last_access.lock())
                .map(|(a, _)| a.clone());
            if let Some(evicted) = oldest.and_then(|a| hosts.remove(&a).map(|s| (a, s))) {
                tracing::debug!(address = %evicted.0, "evicting pooled host");
                evicted.1.close();
            }
        }
        let slots = Arc::new(Slots::new(self.inner.config.size));
        hosts.insert(address.to_owned(), Arc::clone(&slots));
        Ok(slots)
    }

    /// Takes a connection to `address`, dialing one when needed.
    ///
    /// # Errors
    /// Returns 503 when the pool is closed, 504 when no slot frees up before
    /// the context deadline, 499 when the context is cancelled, or the
    /// connector's error.
    pub async fn get(&self, ctx: &Context, address: &str) -> Result<PooledConn<F::Conn>, OrbError> {
        let slots = self.slots(address)?;
        let permit = ctx
            .run(async {
                Arc::clone(&slots.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| OrbError::from(PoolError::Closed))
            })
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OrbError::from(PoolError::Timeout)
                } else {
                    err
                }
            })?;

        let now = Instant::now();
        let ttl = self.inner.config.ttl;
        let reused = slots.idle.lock().pop();
        let live = match reused {
            Some(live) if ttl.is_zero() || now.duration_since(live.last_used) <= ttl => Some(live),
            Some(_) => {
                tracing::trace!(%address, "recycling idle connection");
                None
            }
            None => None,
        };

        let live = match live {
            Some(live) => live,
            None => {
                let conn = self.dial(ctx, address).await?;
                Live {
                    conn,
                    initiated_at: Instant::now(),
                    last_used: Instant::now(),
                }
            }
        };

        Ok(PooledConn {
            live: Some(live),
            slots,
            permit: Some(permit),
            max_life: self.inner.config.max_life,
            unhealthy: false,
        })
    }

    async fn dial(&self, ctx: &Context, address: &str) -> Result<F::Conn, OrbError> {
        let span = tracing::debug_span!("pool_dial", %address);
        let timeout = self.inner.config.dial_timeout;
        let dial = async {
            let connect = self.inner.connector.connect(address);
            if timeout.is_zero() {
                connect.await
            } else {
                tokio::time::timeout(timeout, connect)
                    .await
                    .map_err(|_| OrbError::UNAVAILABLE.wrap(format!("dial {address}: timed out")))?
            }
        };
        ctx.run(dial).instrument(span).await
    }

    /// Closes every slot; later [`Pool::get`] calls fail with 503.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let hosts = std::mem::take(&mut *self.inner.hosts.write());
        for slots in hosts.values() {
            slots.close();
        }
    }

    /// Idle connections currently parked for `address`.
    #[must_use]
    pub fn idle(&self, address: &str) -> usize {
        self.inner
            .hosts
            .read()
            .get(address)
            .map_or(0, |s| s.idle.lock().len())
    }
}

/// A connection borrowed from a [`Pool`]. Dropping it returns the slot.
pub struct PooledConn<C> {
    live: Option<Live<C>>,
    slots: Arc<Slots<C>>,
    permit: Option<OwnedSemaphorePermit>,
    max_life: Duration,
    unhealthy: bool,
}

impl<C> fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("unhealthy", &self.unhealthy)
            .field("max_life", &self.max_life)
            .finish_non_exhaustive()
    }
}

impl<C> PooledConn<C> {
    /// Closes the connection on release instead of pooling it.
    pub fn mark_unhealthy(&mut self) {
        self.unhealthy = true;
    }
}

impl<C> Deref for PooledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.live {
            Some(live) => &live.conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.live {
            Some(live) => &mut live.conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C> Drop for PooledConn<C> {
    fn drop(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        let now = Instant::now();
        if !self.max_life.is_zero() && now.duration_since(live.initiated_at) > self.max_life {
            self.unhealthy = true;
        }
        if !self.unhealthy && !self.slots.permits.is_closed() {
            live.last_used = now;
            self.slots.idle.lock().push(live);
        }
        drop(self.permit.take());
    }
}
