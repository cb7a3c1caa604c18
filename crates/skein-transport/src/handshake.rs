//! Settlement handshake.
//!
//! Once per underlay connection, both sides prove their identity by
//! signing the deterministic transport id together with the peer's key.
//! Messages are JSON, one object each direction, framed as
//! `u32 length | bytes` so a message landing on a buffer boundary cannot
//! be misparsed.

use crate::entry::{transport_id, SignedTransportEntry, TransportEntry};
use crate::error::{Result, TransportError};
use crate::network::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skein_crypto::{verify, PublicKey, SecretKey, Signature};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Upper bound on a settlement or hello frame.
pub const HANDSHAKE_FRAME_MAX: usize = 4096;

/// One direction of the settlement exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementMessage {
    /// Whether the sender dialed the underlay connection
    pub initiator: bool,
    /// The sender's view of the transport id
    pub transport_id: Uuid,
    /// Signature over `transport_id || other_public_key`
    pub signature: Signature,
    /// The sender's identity key
    pub public_key: PublicKey,
}

/// Write a length-prefixed JSON frame.
///
/// # Errors
///
/// Serialization and I/O failures.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)
        .map_err(|e| TransportError::HandshakeFailed(format!("encode: {e}")))?;
    if body.len() > HANDSHAKE_FRAME_MAX {
        return Err(TransportError::HandshakeFailed(format!(
            "frame of {} bytes exceeds {HANDSHAKE_FRAME_MAX}",
            body.len()
        )));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read a length-prefixed JSON frame.
///
/// # Errors
///
/// `HandshakeFailed` on an oversized or unparseable frame; I/O failures
/// otherwise.
pub async fn read_frame<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > HANDSHAKE_FRAME_MAX {
        return Err(TransportError::HandshakeFailed(format!(
            "frame of {len} bytes exceeds {HANDSHAKE_FRAME_MAX}"
        )));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| TransportError::HandshakeFailed(format!("decode: {e}")))
}

/// What one side signs: the transport id followed by the peer's key.
#[must_use]
pub fn settlement_payload(id: &Uuid, other: &PublicKey) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + 32);
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(other.as_bytes());
    payload
}

/// Run the settlement handshake on a fresh underlay connection.
///
/// Symmetric up to message order: the initiator writes first. Returns the
/// agreed transport entry together with the local signature to register
/// with discovery.
///
/// # Errors
///
/// `HandshakeFailed` on a transport-id mismatch, an unexpected initiator
/// flag, a peer key that differs from the connection's claim, or a bad
/// signature. All of these are fatal for the transport.
pub async fn settle(
    conn: &mut Connection,
    secret: &SecretKey,
    is_initiator: bool,
) -> Result<SignedTransportEntry> {
    let local_pk = secret.public_key();
    let remote_pk = conn.remote_pk();
    let net_type = conn.net_type();
    let id = transport_id(local_pk, remote_pk, net_type);

    let local_msg = SettlementMessage {
        initiator: is_initiator,
        transport_id: id,
        signature: secret.sign(&settlement_payload(&id, &remote_pk)),
        public_key: local_pk,
    };

    let remote_msg: SettlementMessage = if is_initiator {
        write_frame(conn, &local_msg).await?;
        read_frame(conn).await?
    } else {
        let msg = read_frame(conn).await?;
        write_frame(conn, &local_msg).await?;
        msg
    };

    verify_settlement(&remote_msg, id, remote_pk, local_pk, is_initiator)?;

    let entry = TransportEntry::new(local_pk, remote_pk, net_type);
    let mut signed = SignedTransportEntry::new(entry);
    signed.sign(&local_pk, local_msg.signature);
    signed.sign(&remote_pk, remote_msg.signature);
    Ok(signed)
}

fn verify_settlement(
    msg: &SettlementMessage,
    expected_id: Uuid,
    remote_pk: PublicKey,
    local_pk: PublicKey,
    is_initiator: bool,
) -> Result<()> {
    if msg.transport_id != expected_id {
        return Err(TransportError::HandshakeFailed(format!(
            "transport id mismatch: theirs {} ours {expected_id}",
            msg.transport_id
        )));
    }
    if msg.public_key != remote_pk {
        return Err(TransportError::HandshakeFailed(
            "peer key differs from the underlay claim".into(),
        ));
    }
    if msg.initiator == is_initiator {
        // both sides claiming the same role means a duplicate-id race
        return Err(TransportError::HandshakeFailed(
            "both sides claim the same handshake role".into(),
        ));
    }
    verify(
        &remote_pk,
        &settlement_payload(&expected_id, &local_pk),
        &msg.signature,
    )
    .map_err(|e| TransportError::HandshakeFailed(format!("signature: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::Keypair;

    #[test]
    fn test_verify_rejects_id_mismatch() {
        let local = Keypair::generate();
        let remote = Keypair::generate();
        let id = Uuid::new_v4();
        let other_id = Uuid::new_v4();

        let msg = SettlementMessage {
            initiator: false,
            transport_id: other_id,
            signature: remote
                .secret
                .sign(&settlement_payload(&other_id, &local.public)),
            public_key: remote.public,
        };
        let err = verify_settlement(&msg, id, remote.public, local.public, true).unwrap_err();
        assert!(matches!(err, TransportError::HandshakeFailed(_)));
    }

    #[test]
    fn test_verify_rejects_same_role() {
        let local = Keypair::generate();
        let remote = Keypair::generate();
        let id = Uuid::new_v4();

        let msg = SettlementMessage {
            initiator: true,
            transport_id: id,
            signature: remote.secret.sign(&settlement_payload(&id, &local.public)),
            public_key: remote.public,
        };
        assert!(verify_settlement(&msg, id, remote.public, local.public, true).is_err());
    }

    #[test]
    fn test_verify_accepts_valid_message() {
        let local = Keypair::generate();
        let remote = Keypair::generate();
        let id = Uuid::new_v4();

        let msg = SettlementMessage {
            initiator: false,
            transport_id: id,
            signature: remote.secret.sign(&settlement_payload(&id, &local.public)),
            public_key: remote.public,
        };
        verify_settlement(&msg, id, remote.public, local.public, true).unwrap();
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = SettlementMessage {
            initiator: true,
            transport_id: Uuid::new_v4(),
            signature: Keypair::generate().secret.sign(b"x"),
            public_key: Keypair::generate().public,
        };
        write_frame(&mut a, &msg).await.unwrap();
        let decoded: SettlementMessage = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.transport_id, msg.transport_id);
        assert_eq!(decoded.public_key, msg.public_key);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = a
                .write_all(&((HANDSHAKE_FRAME_MAX as u32) + 1).to_be_bytes())
                .await;
        });
        let err = read_frame::<_, SettlementMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeFailed(_)));
    }
}
