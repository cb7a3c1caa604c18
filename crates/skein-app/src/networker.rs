//! The networker: dial and listen over skein routes.
//!
//! `dial` reserves an ephemeral local port and asks the router for a
//! circuit; `listen` claims the requested port and, on first use, starts
//! the single accept loop that dispatches accepted circuits to the
//! matching listener by local port.

use crate::error::{AppError, Result};
use crate::porter::{PortGuard, Porter};
use async_trait::async_trait;
use skein_router::{RouteGroup, Router};
use skein_routing::Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of one listener's pending-connection queue.
const LISTENER_BACKLOG: usize = 1024;

type ConnSender = mpsc::Sender<AppConn>;
type PortValue = Option<ConnSender>;

/// App-level networking over some route fabric.
#[async_trait]
pub trait Networker: Send + Sync {
    /// Open a bidirectional connection to `addr`.
    async fn dial(&self, addr: Addr) -> Result<AppConn>;

    /// Listen for inbound connections on `addr.port`.
    async fn listen(&self, addr: Addr) -> Result<AppListener>;
}

impl std::fmt::Debug for dyn Networker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Networker").finish()
    }
}

/// Networker over the skein router.
pub struct SkeinNetworker {
    router: Arc<Router>,
    porter: Porter<PortValue>,
    serving: AtomicBool,
}

impl SkeinNetworker {
    /// Networker over `router`.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            router,
            porter: Porter::new(),
            serving: AtomicBool::new(false),
        })
    }
}

/// Accept circuits and hand each to the listener bound on its local
/// port. Started at most once per networker, by the first `listen`.
async fn serve_loop(router: Arc<Router>, porter: Porter<PortValue>) {
    loop {
        let group = match router.accept_routes().await {
            Ok(group) => group,
            Err(err) => {
                tracing::debug!(%err, "stopped accepting route groups");
                return;
            }
        };
        dispatch(&porter, group).await;
    }
}

async fn dispatch(porter: &Porter<PortValue>, group: Arc<RouteGroup>) {
    let port = group.local_addr().port;
    let Some(Some(tx)) = porter.value(port) else {
        tracing::warn!(port, "no listener for accepted route group");
        group.close().await;
        return;
    };
    if tx.send(AppConn::new(group, None)).await.is_err() {
        tracing::warn!(port, "listener gone, dropping accepted route group");
    }
}

#[async_trait]
impl Networker for SkeinNetworker {
    async fn dial(&self, addr: Addr) -> Result<AppConn> {
        let (port, guard) = self.porter.reserve_ephemeral(None)?;
        match self.router.dial_routes(addr.pk, port, addr.port).await {
            Ok(group) => Ok(AppConn::new(group, Some(guard))),
            Err(err) => Err(err.into()), // guard drop frees the port
        }
    }

    async fn listen(&self, addr: Addr) -> Result<AppListener> {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let guard = self
            .porter
            .reserve(addr.port, Some(tx))
            .ok_or(AppError::PortBound(addr.port))?;

        if !self.serving.swap(true, Ordering::SeqCst) {
            tokio::spawn(serve_loop(Arc::clone(&self.router), self.porter.clone()));
        }

        Ok(AppListener {
            addr,
            rx,
            guard,
            closed: AtomicBool::new(false),
        })
    }
}

/// A connection over one route group.
pub struct AppConn {
    group: Arc<RouteGroup>,
    guard: Option<PortGuard<PortValue>>,
}

impl AppConn {
    fn new(group: Arc<RouteGroup>, guard: Option<PortGuard<PortValue>>) -> Self {
        Self { group, guard }
    }

    /// Local overlay address.
    #[must_use]
    pub fn local_addr(&self) -> Addr {
        self.group.local_addr()
    }

    /// Remote overlay address.
    #[must_use]
    pub fn remote_addr(&self) -> Addr {
        self.group.remote_addr()
    }

    /// Read payload bytes.
    ///
    /// # Errors
    ///
    /// `Router(ClosedPipe)` once the circuit is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.group.read(buf).await?)
    }

    /// Write `buf` as one payload.
    ///
    /// # Errors
    ///
    /// `Router(ClosedPipe)` on a closed circuit.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.group.write(buf).await?)
    }

    /// Close the circuit and release the dialing port. Idempotent.
    pub async fn close(&self) {
        self.group.close().await;
        if let Some(guard) = &self.guard {
            guard.release();
        }
    }

    /// Whether the underlying circuit closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.group.is_closed()
    }
}

/// A listener bound on one local port.
pub struct AppListener {
    addr: Addr,
    rx: mpsc::Receiver<AppConn>,
    guard: PortGuard<PortValue>,
    closed: AtomicBool,
}

impl std::fmt::Debug for AppListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppListener")
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AppListener {
    /// The listening address.
    #[must_use]
    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    /// Wait for the next inbound connection.
    ///
    /// # Errors
    ///
    /// `ListenerClosed` after close.
    pub async fn accept(&mut self) -> Result<AppConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::ListenerClosed);
        }
        self.rx.recv().await.ok_or(AppError::ListenerClosed)
    }

    /// Release the port and stop accepting. Idempotent.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.guard.release();
        self.rx.close();
    }
}

impl Drop for AppListener {
    fn drop(&mut self) {
        self.close();
    }
}
