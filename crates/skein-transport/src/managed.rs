//! Managed transport: one peer link as a framed packet channel.
//!
//! A managed transport owns at most one underlay connection at a time.
//! The settlement handshake proves both identities when the connection is
//! bound; reconnects replace the connection atomically. Only the side that
//! dialed redials after a connection loss; the accept side waits for the
//! peer to come back.

use crate::discovery::DiscoveryClient;
use crate::entry::{Status, TransportEntry};
use crate::error::{Result, TransportError};
use crate::handshake::settle;
use crate::log_store::{LogStore, TransportLogEntry};
use crate::network::{Connection, Network, NetworkType};
use crate::TRANSPORT_PORT;
use skein_crypto::{PublicKey, SecretKey};
use skein_routing::Packet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Deadline applied to an underlay dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Redial backoff bounds.
const REDIAL_INITIAL: Duration = Duration::from_secs(1);
const REDIAL_MAX: Duration = Duration::from_secs(5);

type Reader = ReadHalf<Connection>;
type Writer = WriteHalf<Connection>;

/// A framed, authenticated link to one peer.
pub struct ManagedTransport {
    entry: TransportEntry,
    remote_pk: PublicKey,
    net_type: NetworkType,
    network: Arc<Network>,
    secret: SecretKey,
    discovery: Arc<dyn DiscoveryClient>,
    log_store: Arc<dyn LogStore>,

    writer: tokio::sync::Mutex<Option<Writer>>,
    reader_tx: mpsc::UnboundedSender<Reader>,
    reader_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Reader>>>,

    serving: AtomicBool,
    initiated: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,

    sent: AtomicU64,
    received: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for ManagedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransport")
            .field("remote_pk", &self.remote_pk)
            .field("net_type", &self.net_type)
            .finish()
    }
}

impl ManagedTransport {
    /// Create a transport for `remote` over `net_type`; no connection is
    /// bound until [`dial`](Self::dial) or [`accept`](Self::accept).
    #[must_use]
    pub fn new(
        network: Arc<Network>,
        secret: SecretKey,
        discovery: Arc<dyn DiscoveryClient>,
        log_store: Arc<dyn LogStore>,
        remote_pk: PublicKey,
        net_type: NetworkType,
    ) -> Self {
        let local_pk = secret.public_key();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            entry: TransportEntry::new(local_pk, remote_pk, net_type),
            remote_pk,
            net_type,
            network,
            secret,
            discovery,
            log_store,
            writer: tokio::sync::Mutex::new(None),
            reader_tx,
            reader_rx: tokio::sync::Mutex::new(Some(reader_rx)),
            serving: AtomicBool::new(false),
            initiated: AtomicBool::new(false),
            closed_tx,
            closed_rx,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Agreed transport entry.
    #[must_use]
    pub fn entry(&self) -> &TransportEntry {
        &self.entry
    }

    /// Remote visor key.
    #[must_use]
    pub fn remote(&self) -> PublicKey {
        self.remote_pk
    }

    /// Underlay kind.
    #[must_use]
    pub fn net_type(&self) -> NetworkType {
        self.net_type
    }

    /// Whether a connection is currently bound.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Whether the transport has been terminally closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Packet counters since creation.
    #[must_use]
    pub fn log_entry(&self) -> TransportLogEntry {
        TransportLogEntry {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Instant a packet last crossed this transport.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Dial the underlay and settle as initiator.
    ///
    /// # Errors
    ///
    /// `NotServing` after close, `AlreadyServing` with a connection bound,
    /// `DialTimeout` on an unresponsive underlay, `HandshakeFailed` on a
    /// settlement violation (terminal).
    pub async fn dial(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        if self.is_serving() {
            return Err(TransportError::AlreadyServing);
        }

        let dial = self
            .network
            .dial(self.net_type, self.remote_pk, TRANSPORT_PORT);
        let mut conn = match timeout(DIAL_TIMEOUT, dial).await {
            Ok(res) => res?,
            Err(_) => return Err(TransportError::DialTimeout),
        };

        let signed = match settle(&mut conn, &self.secret, true).await {
            Ok(signed) => signed,
            Err(err) => {
                if err.is_fatal() {
                    self.close().await;
                }
                return Err(err);
            }
        };

        self.initiated.store(true, Ordering::Release);
        self.register(signed).await;
        self.bind(conn).await;
        Ok(())
    }

    /// Bind an inbound underlay connection, settling as responder.
    ///
    /// # Errors
    ///
    /// Same error set as [`dial`](Self::dial).
    pub async fn accept(&self, mut conn: Connection) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        if self.is_serving() {
            return Err(TransportError::AlreadyServing);
        }

        let signed = match settle(&mut conn, &self.secret, false).await {
            Ok(signed) => signed,
            Err(err) => {
                if err.is_fatal() {
                    self.close().await;
                }
                return Err(err);
            }
        };

        self.register(signed).await;
        self.bind(conn).await;
        Ok(())
    }

    /// Serialize and write one packet.
    ///
    /// Safe under concurrent writers; a whole frame is written under the
    /// writer lock.
    ///
    /// # Errors
    ///
    /// `NotServing` when closed or mid-redial; I/O errors otherwise.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotServing)?;

        let frame = packet.encode();
        if let Err(err) = write_all_and_flush(writer, &frame).await {
            // reader side will notice the loss and drive any redial
            *guard = None;
            self.serving.store(false, Ordering::Release);
            return Err(TransportError::Io(err));
        }

        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Read loop: frames packets off the wire into `inbox` until the
    /// transport terminally closes.
    ///
    /// Non-fatal connection losses on the dialing side trigger redial with
    /// exponential backoff; the transport stays registered throughout.
    pub async fn serve(&self, inbox: mpsc::Sender<Packet>) {
        let mut reader_rx = match self.reader_rx.lock().await.take() {
            Some(rx) => rx,
            None => return, // serve already ran
        };
        let mut closed = self.closed_rx.clone();

        loop {
            if self.is_closed() {
                break;
            }
            let reader = tokio::select! {
                _ = closed.changed() => break,
                half = reader_rx.recv() => match half {
                    Some(half) => half,
                    None => break,
                },
            };

            let mut closed_during_read = self.closed_rx.clone();
            let result = tokio::select! {
                _ = closed_during_read.changed() => break,
                result = self.read_conn(reader, &inbox) => result,
            };

            match result {
                Ok(()) => break, // manager shut the inbox
                Err(TransportError::Frame(err)) => {
                    tracing::warn!(id = %self.entry.id, %err, "frame violation, closing transport");
                    self.close().await;
                    break;
                }
                Err(err) => {
                    tracing::debug!(id = %self.entry.id, %err, "connection lost");
                    self.drop_conn().await;
                    if self.initiated.load(Ordering::Acquire) {
                        if !self.redial().await {
                            break;
                        }
                    }
                    // accept side: wait for the peer to re-establish
                }
            }
        }

        self.persist_log();
    }

    /// Terminally close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        self.drop_conn().await;
        self.persist_log();
        tracing::debug!(id = %self.entry.id, "transport closed");
    }

    async fn read_conn(&self, mut reader: Reader, inbox: &mpsc::Sender<Packet>) -> Result<()> {
        loop {
            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes).await?;
            let len = u16::from_be_bytes(len_bytes) as usize;
            Packet::check_frame_len(len)?;

            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;

            let packet = match Packet::decode(&body) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(id = %self.entry.id, %err, "dropping unparseable packet");
                    continue;
                }
            };

            self.received.fetch_add(1, Ordering::Relaxed);
            self.touch();

            if inbox.send(packet).await.is_err() {
                return Ok(()); // manager closed
            }
        }
    }

    async fn redial(&self) -> bool {
        let mut backoff = REDIAL_INITIAL;
        loop {
            tokio::time::sleep(backoff).await;
            match self.dial().await {
                Ok(()) => return true,
                Err(err) if err.is_fatal() => {
                    tracing::warn!(id = %self.entry.id, %err, "redial failed terminally");
                    self.close().await;
                    return false;
                }
                Err(err) => {
                    tracing::debug!(id = %self.entry.id, %err, backoff_s = backoff.as_secs(), "redial failed");
                    backoff = (backoff * 2).min(REDIAL_MAX);
                }
            }
        }
    }

    async fn bind(&self, conn: Connection) {
        let (reader, writer) = tokio::io::split(conn);
        *self.writer.lock().await = Some(writer);
        self.serving.store(true, Ordering::Release);
        self.touch();
        // the serve loop picks the reader up; a terminally closed
        // transport simply drops it
        let _ = self.reader_tx.send(reader);

        let statuses = [Status {
            id: self.entry.id,
            is_up: true,
        }];
        if let Err(err) = self.discovery.update_statuses(&statuses).await {
            tracing::debug!(id = %self.entry.id, %err, "status update failed");
        }
    }

    async fn drop_conn(&self) {
        self.serving.store(false, Ordering::Release);
        *self.writer.lock().await = None;
    }

    async fn register(&self, signed: crate::entry::SignedTransportEntry) {
        // registration is best-effort with backoff; the link works for
        // already-connected peers regardless
        let mut backoff = Duration::from_millis(500);
        for attempt in 0..3 {
            match self.discovery.register_transports(&[signed.clone()]).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(id = %self.entry.id, attempt, %err, "discovery registration failed");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    fn persist_log(&self) {
        if let Err(err) = self.log_store.record(self.entry.id, self.log_entry()) {
            tracing::warn!(id = %self.entry.id, %err, "failed to persist transport log");
        }
    }
}

async fn write_all_and_flush(writer: &mut Writer, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
