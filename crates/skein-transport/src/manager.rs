//! Transport manager: the single registry of managed transports.
//!
//! The map is keyed by the deterministic transport id, which is symmetric
//! in the two edge keys, so simultaneous dials from both sides converge on
//! one entry. One mutex protects the map and is never held across I/O.

use crate::discovery::DiscoveryClient;
use crate::entry::{transport_id, Status};
use crate::error::{Result, TransportError};
use crate::log_store::LogStore;
use crate::managed::ManagedTransport;
use crate::network::{Connection, Network, NetworkType};
use crate::TRANSPORT_PORT;
use skein_crypto::{Keypair, PublicKey};
use skein_routing::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the shared inbound packet queue.
const INBOX_CAPACITY: usize = 20;

/// Transport manager configuration.
pub struct ManagerConfig {
    /// Local visor identity
    pub keys: Keypair,
    /// Transport discovery directory
    pub discovery: Arc<dyn DiscoveryClient>,
    /// Per-transport packet accounting
    pub log_store: Arc<dyn LogStore>,
}

/// Owner of every managed transport and the shared packet inbox.
pub struct TransportManager {
    conf: ManagerConfig,
    network: Arc<Network>,
    tps: Mutex<HashMap<Uuid, Arc<ManagedTransport>>>,

    inbox_tx: mpsc::Sender<Packet>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,

    served: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportManager {
    /// Create a manager over `network`.
    #[must_use]
    pub fn new(network: Arc<Network>, conf: ManagerConfig) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            conf,
            network,
            tps: Mutex::new(HashMap::new()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            served: AtomicBool::new(false),
            closed_tx,
            closed_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Local visor key.
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.conf.keys.public
    }

    /// Kinds of every underlay this manager serves.
    #[must_use]
    pub fn networks(&self) -> Vec<NetworkType> {
        self.network.network_types()
    }

    /// Whether the manager has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Start one listener per underlay type and re-dial transports known
    /// to discovery. Idempotent.
    pub async fn serve(self: &Arc<Self>) {
        if self.served.swap(true, Ordering::SeqCst) {
            return;
        }

        for net_type in self.network.network_types() {
            let mut listener = match self.network.listen(net_type, TRANSPORT_PORT).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(%net_type, %err, "failed to listen for transports");
                    continue;
                }
            };
            tracing::info!(%net_type, "listening for transports");

            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut closed = manager.closed_rx.clone();
                loop {
                    let conn = tokio::select! {
                        _ = closed.changed() => return,
                        conn = listener.accept() => match conn {
                            Ok(conn) => conn,
                            Err(_) => return,
                        },
                    };
                    if let Err(err) = manager.handle_inbound(conn).await {
                        tracing::warn!(%err, "failed to accept inbound transport");
                    }
                }
            });
            self.push_task(handle);
        }

        self.init_transports().await;
        tracing::info!("transport manager is serving");
    }

    /// Re-dial every transport discovery already knows this visor by.
    async fn init_transports(self: &Arc<Self>) {
        let entries = match self
            .conf
            .discovery
            .get_transports_by_edge(self.local_pk())
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(%err, "no transports recovered from discovery");
                return;
            }
        };

        for entry in entries {
            let remote = entry.entry.remote_edge(self.local_pk());
            if let Err(err) = self.save_transport(remote, entry.entry.net_type).await {
                tracing::warn!(
                    id = %entry.entry.id, %remote, %err,
                    "failed to re-establish discovered transport",
                );
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, conn: Connection) -> Result<()> {
        let remote = conn.remote_pk();
        let net_type = conn.net_type();
        tracing::info!(%remote, %net_type, "inbound transport connection");

        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        let mtp = self.get_or_create(remote, net_type);
        mtp.accept(conn).await
    }

    /// Return the existing transport to `remote` or create one and dial.
    ///
    /// A stale entry mid-close answers the dial with `NotServing`; it is
    /// dropped and the dial retried exactly once with a fresh transport.
    ///
    /// # Errors
    ///
    /// `NotServing` if the manager is closed, or if the retry also hits a
    /// stale transport; dial and handshake errors surface unchanged.
    pub async fn save_transport(
        self: &Arc<Self>,
        remote: PublicKey,
        net_type: NetworkType,
    ) -> Result<Arc<ManagedTransport>> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        if !self.network.network_types().contains(&net_type) {
            return Err(TransportError::UnknownNetwork(net_type.to_string()));
        }

        for _attempt in 0..2 {
            let mtp = self.get_or_create(remote, net_type);
            if mtp.is_serving() {
                return Ok(mtp);
            }

            match mtp.dial().await {
                Ok(()) => return Ok(mtp),
                // a concurrent dial or accept bound the connection first
                Err(TransportError::AlreadyServing) => return Ok(mtp),
                Err(TransportError::NotServing) => {
                    tracing::debug!(id = %mtp.entry().id, "dropping stale transport and retrying");
                    mtp.close().await;
                    self.remove(mtp.entry().id);
                }
                Err(err) => {
                    mtp.close().await;
                    self.remove(mtp.entry().id);
                    return Err(err);
                }
            }
        }

        Err(TransportError::NotServing)
    }

    /// Deregister from discovery, close and forget the transport.
    pub async fn delete_transport(self: &Arc<Self>, id: Uuid) {
        if self.is_closed() {
            return;
        }
        let mtp = {
            let mut tps = self.lock_tps();
            tps.remove(&id)
        };
        let Some(mtp) = mtp else { return };

        if let Err(err) = self.conf.discovery.delete_transport(id).await {
            tracing::warn!(%id, %err, "failed to deregister transport from discovery");
        } else {
            tracing::info!(%id, "deregistered transport from discovery");
        }
        mtp.close().await;
    }

    /// Block on the shared inbox for the next packet from any transport.
    ///
    /// # Errors
    ///
    /// `NotServing` once the manager is closed.
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        let mut rx = self.inbox_rx.lock().await;
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            _ = closed.changed() => Err(TransportError::NotServing),
            packet = rx.recv() => packet.ok_or(TransportError::NotServing),
        }
    }

    /// Transport by id, if present.
    #[must_use]
    pub fn transport(&self, id: Uuid) -> Option<Arc<ManagedTransport>> {
        self.lock_tps().get(&id).cloned()
    }

    /// Visit every transport until `walk` returns false.
    pub fn walk_transports(&self, mut walk: impl FnMut(&Arc<ManagedTransport>) -> bool) {
        let tps: Vec<_> = self.lock_tps().values().cloned().collect();
        for tp in &tps {
            if !walk(tp) {
                break;
            }
        }
    }

    /// Close every transport and the inbox. Idempotent.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        tracing::info!("transport manager is closing");

        let tps: Vec<_> = {
            let mut map = self.lock_tps();
            map.drain().map(|(_, tp)| tp).collect()
        };

        let statuses: Vec<Status> = tps
            .iter()
            .map(|tp| Status {
                id: tp.entry().id,
                is_up: false,
            })
            .collect();
        for tp in &tps {
            tp.close().await;
        }
        if let Err(err) = self.conf.discovery.update_statuses(&statuses).await {
            tracing::warn!(%err, "failed to report transport statuses");
        }

        let tasks: Vec<_> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        tracing::info!("transport manager closed");
    }

    fn get_or_create(self: &Arc<Self>, remote: PublicKey, net_type: NetworkType) -> Arc<ManagedTransport> {
        let id = transport_id(self.local_pk(), remote, net_type);
        let mut tps = self.lock_tps();
        if let Some(existing) = tps.get(&id) {
            return Arc::clone(existing);
        }

        let mtp = Arc::new(ManagedTransport::new(
            Arc::clone(&self.network),
            self.conf.keys.secret.clone(),
            Arc::clone(&self.conf.discovery),
            Arc::clone(&self.conf.log_store),
            remote,
            net_type,
        ));
        tps.insert(id, Arc::clone(&mtp));
        drop(tps);
        tracing::info!(%id, %remote, %net_type, "registered transport");

        let manager = Arc::clone(self);
        let serving = Arc::clone(&mtp);
        let inbox = self.inbox_tx.clone();
        let handle = tokio::spawn(async move {
            serving.serve(inbox).await;
            manager.remove(serving.entry().id);
        });
        self.push_task(handle);

        mtp
    }

    fn remove(&self, id: Uuid) {
        self.lock_tps().remove(&id);
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    fn lock_tps(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<ManagedTransport>>> {
        self.tps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
