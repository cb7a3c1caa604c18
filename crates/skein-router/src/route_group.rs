//! Route group: a bidirectional stream over a pair of routing rules.
//!
//! A group owns parallel lists of (forward rule, reverse rule, transport)
//! triples so multipath stays expressible; today's installers add exactly
//! one triple. Payloads consumed by the router land on the group's inbound
//! channel; `read` drains that channel and returns `ClosedPipe` once the
//! group closes and the buffer runs dry.

use crate::error::{Result, RouterError};
use skein_crypto::PublicKey;
use skein_routing::{
    Addr, CloseCode, Packet, RouteDescriptor, RouteId, RoutingTable, Rule,
};
use skein_transport::ManagedTransport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared handle to the router's descriptor → group map.
pub(crate) type GroupMap = Arc<Mutex<HashMap<RouteDescriptor, Arc<RouteGroup>>>>;

/// Route group tuning.
#[derive(Debug, Clone)]
pub struct RouteGroupConfig {
    /// Capacity of the inbound payload channel
    pub read_queue: usize,
    /// Keep-alive installed on the group's rules
    pub keep_alive: Duration,
}

impl Default for RouteGroupConfig {
    fn default() -> Self {
        Self {
            read_queue: 1024,
            keep_alive: Duration::from_secs(120),
        }
    }
}

/// One installed path: a forward/reverse rule pair and the first-hop
/// transport. The transport is absent if the manager no longer holds it.
#[derive(Clone)]
struct GroupPath {
    forward: Rule,
    reverse: Rule,
    transport: Option<Arc<ManagedTransport>>,
}

struct ReadState {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

/// The endpoint abstraction over a descriptor.
pub struct RouteGroup {
    desc: RouteDescriptor,
    local_pk: PublicKey,
    cfg: RouteGroupConfig,
    rt: Arc<RoutingTable>,
    groups: GroupMap,

    paths: Mutex<Vec<GroupPath>>,
    read_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    read_state: tokio::sync::Mutex<ReadState>,

    closed: AtomicBool,
    last_write: Mutex<Instant>,
    keep_alive_task: Mutex<Option<JoinHandle<()>>>,
}

impl RouteGroup {
    pub(crate) fn new(
        cfg: RouteGroupConfig,
        desc: RouteDescriptor,
        local_pk: PublicKey,
        rt: Arc<RoutingTable>,
        groups: GroupMap,
    ) -> Arc<Self> {
        let (read_tx, read_rx) = mpsc::channel(cfg.read_queue);
        Arc::new(Self {
            desc,
            local_pk,
            cfg,
            rt,
            groups,
            paths: Mutex::new(Vec::new()),
            read_tx: Mutex::new(Some(read_tx)),
            read_state: tokio::sync::Mutex::new(ReadState {
                rx: read_rx,
                leftover: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            last_write: Mutex::new(Instant::now()),
            keep_alive_task: Mutex::new(None),
        })
    }

    /// Circuit descriptor, as seen by the dialing side.
    #[must_use]
    pub fn descriptor(&self) -> RouteDescriptor {
        self.desc
    }

    /// This endpoint's overlay address.
    #[must_use]
    pub fn local_addr(&self) -> Addr {
        if self.desc.src_pk == self.local_pk {
            self.desc.src()
        } else {
            self.desc.dst()
        }
    }

    /// The remote endpoint's overlay address.
    #[must_use]
    pub fn remote_addr(&self) -> Addr {
        if self.desc.src_pk == self.local_pk {
            self.desc.dst()
        } else {
            self.desc.src()
        }
    }

    /// Whether the group has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append an installed (forward, reverse, transport) triple.
    pub(crate) fn add_path(
        &self,
        forward: Rule,
        reverse: Rule,
        transport: Option<Arc<ManagedTransport>>,
    ) {
        self.lock_paths().push(GroupPath {
            forward,
            reverse,
            transport,
        });
    }

    /// Read the next payload bytes into `buf`.
    ///
    /// Payload arriving larger than `buf` is buffered and returned by
    /// subsequent reads, preserving byte order.
    ///
    /// # Errors
    ///
    /// `ClosedPipe` once the group is closed and all buffered payloads
    /// are drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.read_state.lock().await;
        if !state.leftover.is_empty() {
            return Ok(drain_into(&mut state.leftover, buf));
        }

        match state.rx.recv().await {
            Some(mut payload) => {
                let n = drain_into(&mut payload, buf);
                state.leftover = payload;
                Ok(n)
            }
            None => Err(RouterError::ClosedPipe),
        }
    }

    /// Send `buf` as one Data packet down the first working forward path.
    ///
    /// # Errors
    ///
    /// `ClosedPipe` on a closed group; the last transport error if every
    /// installed path fails.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(RouterError::ClosedPipe);
        }

        let paths = self.snapshot_paths();
        if paths.is_empty() {
            return Err(RouterError::NotServing);
        }

        let mut last_err = RouterError::NotServing;
        for path in &paths {
            let Some(transport) = &path.transport else {
                last_err = RouterError::UnknownTransport(
                    path.forward.next_transport_id().unwrap_or_default(),
                );
                continue;
            };
            let packet = Packet::data(path.forward.next_route_id()?, buf.to_vec())?;
            match transport.write_packet(&packet).await {
                Ok(()) => {
                    self.touch_write();
                    self.touch_rules(&paths);
                    return Ok(buf.len());
                }
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    }

    /// Gracefully close: emit Close(normal) along each forward path, then
    /// tear the group down. Idempotent.
    pub async fn close(&self) {
        self.teardown(Some(CloseCode::NORMAL)).await;
    }

    /// Tear down in response to a Close packet from the remote.
    pub(crate) async fn handle_close_packet(&self, code: CloseCode) {
        tracing::debug!(desc = %self.desc, %code, "route group closed by remote");
        self.teardown(None).await;
    }

    /// Tear down after the activity sweep expired the group's rules.
    pub(crate) async fn handle_expiry(&self) {
        tracing::debug!(desc = %self.desc, "route group expired");
        self.teardown(None).await;
    }

    /// Hand an inbound payload to the reader.
    ///
    /// # Errors
    ///
    /// `ClosedPipe` if the group closed.
    pub(crate) async fn push_payload(&self, payload: Vec<u8>) -> Result<()> {
        let tx = self
            .lock_read_tx()
            .clone()
            .ok_or(RouterError::ClosedPipe)?;
        let paths = self.snapshot_paths();
        self.touch_rules(&paths);
        tx.send(payload).await.map_err(|_| RouterError::ClosedPipe)
    }

    /// Refresh local rule activity on an inbound keep-alive.
    pub(crate) fn handle_keep_alive(&self) {
        let paths = self.snapshot_paths();
        self.touch_rules(&paths);
    }

    /// Start the keep-alive ticker: every `keep_alive / 2`, if nothing was
    /// written since the previous tick, send a KeepAlive down each path.
    pub(crate) fn spawn_keep_alive(self: &Arc<Self>) {
        let interval = (self.cfg.keep_alive / 2).max(Duration::from_millis(10));
        let group = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate tick
            loop {
                ticker.tick().await;
                if group.is_closed() {
                    return;
                }
                if group.since_last_write() < interval {
                    continue;
                }
                group.send_keep_alives().await;
            }
        });
        *self
            .keep_alive_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    async fn send_keep_alives(&self) {
        let paths = self.snapshot_paths();
        for path in &paths {
            let (Ok(next), Some(transport)) = (path.forward.next_route_id(), &path.transport)
            else {
                continue;
            };
            match transport.write_packet(&Packet::keep_alive(next)).await {
                Ok(()) => self.touch_rules(std::slice::from_ref(path)),
                Err(err) => {
                    tracing::debug!(desc = %self.desc, %err, "keep-alive send failed");
                }
            }
        }
    }

    async fn teardown(&self, emit: Option<CloseCode>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let paths = self.snapshot_paths();
        if let Some(code) = emit {
            for path in &paths {
                let (Ok(next), Some(transport)) = (path.forward.next_route_id(), &path.transport)
                else {
                    continue;
                };
                if let Err(err) = transport.write_packet(&Packet::close(next, code)).await {
                    tracing::debug!(desc = %self.desc, %err, "close packet send failed");
                }
            }
        }

        let mut ids: Vec<RouteId> = Vec::with_capacity(paths.len() * 2);
        for path in &paths {
            ids.push(path.forward.key_route_id());
            ids.push(path.reverse.key_route_id());
        }
        self.rt.del_rules(&ids);

        self.groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.desc);

        *self.lock_read_tx() = None;

        if let Some(task) = self
            .keep_alive_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        tracing::debug!(desc = %self.desc, "route group torn down");
    }

    fn touch_write(&self) {
        *self
            .last_write
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    fn since_last_write(&self) -> Duration {
        self.last_write
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }

    /// Live traffic refreshes both of a path's rules so a healthy circuit
    /// never falls to the sweep.
    fn touch_rules(&self, paths: &[GroupPath]) {
        for path in paths {
            self.rt.update_activity(path.forward.key_route_id());
            self.rt.update_activity(path.reverse.key_route_id());
        }
    }

    fn snapshot_paths(&self) -> Vec<GroupPath> {
        self.lock_paths().clone()
    }

    fn lock_paths(&self) -> std::sync::MutexGuard<'_, Vec<GroupPath>> {
        self.paths
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_read_tx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.read_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RouteGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteGroup")
            .field("desc", &format_args!("{}", self.desc))
            .field("closed", &self.is_closed())
            .field("paths", &self.lock_paths().len())
            .finish()
    }
}

fn drain_into(src: &mut Vec<u8>, dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    src.drain(..n);
    n
}
