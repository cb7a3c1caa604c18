//! TCP underlay with a static PK → address table.
//!
//! Each visor binds one TCP address. A dialer looks the remote visor up in
//! its table, connects, and opens the stream with a length-prefixed JSON
//! hello naming its own key and the destination underlay port; the
//! acceptor uses the hello to route the stream to the listener bound on
//! that port. The claimed key is proven later by the settlement handshake.

use super::{Connection, Listener, NetworkType, Underlay};
use crate::error::{Result, TransportError};
use crate::handshake::{read_frame, write_frame};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use skein_crypto::PublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const BACKLOG: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    pk: PublicKey,
    port: u16,
}

/// TCP underlay endpoint for one visor.
pub struct TcpUnderlay {
    local_pk: PublicKey,
    local_addr: SocketAddr,
    table: HashMap<PublicKey, SocketAddr>,
    listeners: Arc<DashMap<u16, mpsc::Sender<Connection>>>,
}

struct Unbind {
    listeners: Arc<DashMap<u16, mpsc::Sender<Connection>>>,
    port: u16,
}

impl Drop for Unbind {
    fn drop(&mut self) {
        self.listeners.remove(&self.port);
    }
}

impl TcpUnderlay {
    /// Bind `listen_addr` and start accepting streams.
    ///
    /// # Errors
    ///
    /// Propagates socket binding failures.
    pub async fn bind(
        local_pk: PublicKey,
        listen_addr: SocketAddr,
        table: HashMap<PublicKey, SocketAddr>,
    ) -> Result<Arc<Self>> {
        let tcp = TcpListener::bind(listen_addr).await?;
        let local_addr = tcp.local_addr()?;
        let listeners: Arc<DashMap<u16, mpsc::Sender<Connection>>> = Arc::new(DashMap::new());

        let accept_map = Arc::clone(&listeners);
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match tcp.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "tcp underlay accept failed");
                        break;
                    }
                };
                let map = Arc::clone(&accept_map);
                tokio::spawn(async move {
                    if let Err(err) = route_inbound(stream, &map).await {
                        tracing::debug!(%peer, %err, "dropping inbound tcp stream");
                    }
                });
            }
        });

        Ok(Arc::new(Self {
            local_pk,
            local_addr,
            table,
            listeners,
        }))
    }

    /// The address the accept loop is bound on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn route_inbound(
    stream: TcpStream,
    listeners: &DashMap<u16, mpsc::Sender<Connection>>,
) -> Result<()> {
    let mut stream = stream;
    let hello: Hello = read_frame(&mut stream).await?;
    let tx = listeners
        .get(&hello.port)
        .map(|e| e.value().clone())
        .ok_or(TransportError::NotServing)?;

    let conn = Connection::new(hello.pk, NetworkType::Tcp, Box::new(stream));
    tx.send(conn).await.map_err(|_| TransportError::NotServing)
}

#[async_trait]
impl Underlay for TcpUnderlay {
    fn net_type(&self) -> NetworkType {
        NetworkType::Tcp
    }

    async fn dial(&self, remote: PublicKey, port: u16) -> Result<Connection> {
        let addr = self
            .table
            .get(&remote)
            .copied()
            .ok_or_else(|| TransportError::UnknownRemote(remote.to_string()))?;

        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(
            &mut stream,
            &Hello {
                pk: self.local_pk,
                port,
            },
        )
        .await?;

        Ok(Connection::new(remote, NetworkType::Tcp, Box::new(stream)))
    }

    async fn listen(&self, port: u16) -> Result<Listener> {
        let (tx, rx) = mpsc::channel(BACKLOG);
        self.listeners.insert(port, tx);
        let guard = Unbind {
            listeners: Arc::clone(&self.listeners),
            port,
        };
        Ok(Listener::new(NetworkType::Tcp, rx, Some(Box::new(guard))))
    }
}
