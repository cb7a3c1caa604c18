//! Underlay network abstraction.
//!
//! An underlay provides raw point-to-point streams between visors over
//! some network type. The transport layer is agnostic to how a stream is
//! produced; it only requires the claimed remote key (proven later by the
//! settlement handshake) and ordered byte delivery.

pub mod memory;
pub mod tcp;

use crate::error::{Result, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_crypto::PublicKey;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Underlay network kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// In-process hub, used by tests and single-machine setups
    Memory,
    /// TCP with a static PK → address table
    Tcp,
}

impl NetworkType {
    /// Stable string form, used in transport-id derivation and discovery
    /// entries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "mem",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mem" => Ok(Self::Memory),
            "tcp" => Ok(Self::Tcp),
            other => Err(TransportError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Byte stream requirements every underlay connection satisfies.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A raw underlay connection to one remote visor.
///
/// The remote key is the dialer's claim (or the hello frame's claim on the
/// accept side); it is proven only by the settlement handshake signature.
pub struct Connection {
    remote_pk: PublicKey,
    net_type: NetworkType,
    stream: Box<dyn Stream>,
}

impl Connection {
    /// Wrap a stream with its claimed remote identity.
    #[must_use]
    pub fn new(remote_pk: PublicKey, net_type: NetworkType, stream: Box<dyn Stream>) -> Self {
        Self {
            remote_pk,
            net_type,
            stream,
        }
    }

    /// Claimed remote visor key.
    #[must_use]
    pub fn remote_pk(&self) -> PublicKey {
        self.remote_pk
    }

    /// Underlay kind this connection runs over.
    #[must_use]
    pub fn net_type(&self) -> NetworkType {
        self.net_type
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_pk", &self.remote_pk)
            .field("net_type", &self.net_type)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Inbound connection queue for one (network type, port) binding.
///
/// Dropping the listener releases the binding.
pub struct Listener {
    net_type: NetworkType,
    rx: mpsc::Receiver<Connection>,
    _guard: Option<Box<dyn std::any::Any + Send>>,
}

impl Listener {
    /// Assemble a listener from its parts; `guard` is dropped with the
    /// listener to release the underlying binding.
    #[must_use]
    pub fn new(
        net_type: NetworkType,
        rx: mpsc::Receiver<Connection>,
        guard: Option<Box<dyn std::any::Any + Send>>,
    ) -> Self {
        Self {
            net_type,
            rx,
            _guard: guard,
        }
    }

    /// Wait for the next inbound connection.
    ///
    /// # Errors
    ///
    /// `NotServing` once the underlay stops feeding this binding.
    pub async fn accept(&mut self) -> Result<Connection> {
        self.rx.recv().await.ok_or(TransportError::NotServing)
    }

    /// Underlay kind this listener is bound on.
    #[must_use]
    pub fn net_type(&self) -> NetworkType {
        self.net_type
    }
}

/// One underlay network implementation.
#[async_trait]
pub trait Underlay: Send + Sync {
    /// Kind of this underlay.
    fn net_type(&self) -> NetworkType;

    /// Open a stream to `remote` on its underlay `port`.
    async fn dial(&self, remote: PublicKey, port: u16) -> Result<Connection>;

    /// Bind an underlay `port` for inbound streams.
    async fn listen(&self, port: u16) -> Result<Listener>;
}

/// The set of underlays one visor participates in.
pub struct Network {
    local_pk: PublicKey,
    underlays: HashMap<NetworkType, Arc<dyn Underlay>>,
}

impl Network {
    /// Create a network with no underlays registered.
    #[must_use]
    pub fn new(local_pk: PublicKey) -> Self {
        Self {
            local_pk,
            underlays: HashMap::new(),
        }
    }

    /// Register an underlay, replacing any previous one of the same kind.
    #[must_use]
    pub fn with_underlay(mut self, underlay: Arc<dyn Underlay>) -> Self {
        self.underlays.insert(underlay.net_type(), underlay);
        self
    }

    /// Local visor key.
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.local_pk
    }

    /// Kinds of every registered underlay.
    #[must_use]
    pub fn network_types(&self) -> Vec<NetworkType> {
        self.underlays.keys().copied().collect()
    }

    /// Dial `remote` on `port` over the given underlay kind.
    ///
    /// # Errors
    ///
    /// `UnknownNetwork` if the kind is not registered; underlay errors
    /// otherwise.
    pub async fn dial(
        &self,
        net_type: NetworkType,
        remote: PublicKey,
        port: u16,
    ) -> Result<Connection> {
        self.underlay(net_type)?.dial(remote, port).await
    }

    /// Bind `port` on the given underlay kind.
    ///
    /// # Errors
    ///
    /// `UnknownNetwork` if the kind is not registered; underlay errors
    /// otherwise.
    pub async fn listen(&self, net_type: NetworkType, port: u16) -> Result<Listener> {
        self.underlay(net_type)?.listen(port).await
    }

    fn underlay(&self, net_type: NetworkType) -> Result<&Arc<dyn Underlay>> {
        self.underlays
            .get(&net_type)
            .ok_or_else(|| TransportError::UnknownNetwork(net_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_type_strings() {
        assert_eq!(NetworkType::Memory.as_str(), "mem");
        assert_eq!("tcp".parse::<NetworkType>().unwrap(), NetworkType::Tcp);
        assert!("quic".parse::<NetworkType>().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_underlay_rejected() {
        let net = Network::new(PublicKey::null());
        let err = net
            .dial(NetworkType::Tcp, PublicKey::null(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownNetwork(_)));
    }
}
