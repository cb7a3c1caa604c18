//! Setup RPC wire protocol, gateway and client.
//!
//! Requests and responses are JSON envelopes on a length-framed stream:
//! `u32 length | bytes`. Method names are literal strings, so the
//! protocol stays readable on the wire and indifferent to field order.

use super::{
    RouteGroupDialer, METHOD_ADD_EDGE_RULES, METHOD_ADD_INTERMEDIARY_RULES,
    METHOD_DIAL_ROUTE_GROUP, METHOD_RESERVE_IDS,
};
use crate::error::{Result, RouterError};
use crate::router::Router;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skein_crypto::PublicKey;
use skein_routing::{BidirectionalRoute, EdgeRules, Rule};
use skein_transport::network::{Connection, Network};
use skein_transport::SETUP_PORT;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one RPC frame. Generous enough for a 50-hop route in
/// both directions.
const RPC_FRAME_MAX: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    method: String,
    params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn write_rpc_frame<W: AsyncWrite + Unpin, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    let body =
        serde_json::to_vec(msg).map_err(|e| RouterError::SetupRejected(format!("encode: {e}")))?;
    if body.len() > RPC_FRAME_MAX {
        return Err(RouterError::SetupRejected(format!(
            "rpc frame of {} bytes exceeds {RPC_FRAME_MAX}",
            body.len()
        )));
    }
    w.write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(io_rejected)?;
    w.write_all(&body).await.map_err(io_rejected)?;
    w.flush().await.map_err(io_rejected)?;
    Ok(())
}

async fn read_rpc_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await.map_err(io_rejected)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > RPC_FRAME_MAX {
        return Err(RouterError::SetupRejected(format!(
            "rpc frame of {len} bytes exceeds {RPC_FRAME_MAX}"
        )));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(io_rejected)?;
    serde_json::from_slice(&body).map_err(|e| RouterError::SetupRejected(format!("decode: {e}")))
}

fn io_rejected(err: std::io::Error) -> RouterError {
    RouterError::SetupRejected(err.to_string())
}

/// Issue one RPC call on an established setup connection.
pub async fn call<P, R>(conn: &mut Connection, method: &str, params: &P) -> Result<R>
where
    P: Serialize,
    R: DeserializeOwned,
{
    let request = Request {
        method: method.to_string(),
        params: serde_json::to_value(params)
            .map_err(|e| RouterError::SetupRejected(format!("encode: {e}")))?,
    };
    write_rpc_frame(conn, &request).await?;

    let response: Response = read_rpc_frame(conn).await?;
    if let Some(error) = response.error {
        return Err(RouterError::SetupRejected(error));
    }
    let ok = response
        .ok
        .ok_or_else(|| RouterError::SetupRejected("empty response".into()))?;
    serde_json::from_value(ok).map_err(|e| RouterError::SetupRejected(format!("decode: {e}")))
}

/// Visor-side RPC surface served to trusted setup peers.
///
/// The router accepts the connection and checks the peer against its
/// trusted set before this gateway ever sees a request.
pub struct RpcGateway {
    router: Arc<Router>,
}

impl RpcGateway {
    /// Gateway dispatching into `router`.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Serve requests on `conn` until it drops.
    pub async fn serve_conn(&self, mut conn: Connection) {
        let peer = conn.remote_pk();
        loop {
            let request: Request = match read_rpc_frame(&mut conn).await {
                Ok(request) => request,
                Err(_) => return, // peer hung up
            };

            tracing::debug!(%peer, method = %request.method, "setup rpc request");
            let response = match self.dispatch(&request.method, request.params) {
                Ok(ok) => Response {
                    ok: Some(ok),
                    error: None,
                },
                Err(err) => Response {
                    ok: None,
                    error: Some(err.to_string()),
                },
            };

            if write_rpc_frame(&mut conn, &response).await.is_err() {
                return;
            }
        }
    }

    fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            METHOD_ADD_EDGE_RULES => {
                let rules: EdgeRules = decode_params(params)?;
                self.router.introduce_rules(rules)?;
                encode_ok(&true)
            }
            METHOD_ADD_INTERMEDIARY_RULES => {
                let rules: Vec<Rule> = decode_params(params)?;
                self.router.save_routing_rules(&rules);
                encode_ok(&true)
            }
            METHOD_RESERVE_IDS => {
                let n: u8 = decode_params(params)?;
                let ids = self.router.reserve_keys(usize::from(n))?;
                encode_ok(&ids)
            }
            other => Err(RouterError::SetupRejected(format!(
                "unknown method: {other}"
            ))),
        }
    }
}

fn decode_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| RouterError::SetupRejected(format!("params: {e}")))
}

fn encode_ok<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| RouterError::SetupRejected(format!("encode: {e}")))
}

/// Production dialer: reach a configured setup node over the underlay and
/// call `DialRouteGroup`.
pub struct SetupNodeDialer {
    network: Arc<Network>,
}

impl SetupNodeDialer {
    /// Dialer over `network`.
    #[must_use]
    pub fn new(network: Arc<Network>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl RouteGroupDialer for SetupNodeDialer {
    async fn dial_route_group(
        &self,
        setup_nodes: &[PublicKey],
        route: BidirectionalRoute,
    ) -> Result<EdgeRules> {
        let mut last_err = RouterError::SetupRejected("no setup nodes configured".into());

        for &setup_pk in setup_nodes {
            for net_type in self.network.network_types() {
                let mut conn = match self.network.dial(net_type, setup_pk, SETUP_PORT).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::debug!(%setup_pk, %net_type, %err, "setup node unreachable");
                        last_err = err.into();
                        continue;
                    }
                };

                match call(&mut conn, METHOD_DIAL_ROUTE_GROUP, &route).await {
                    Ok(rules) => return Ok(rules),
                    Err(err) => {
                        tracing::warn!(%setup_pk, %err, "setup node refused route group");
                        last_err = err;
                    }
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rpc_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = Request {
            method: METHOD_RESERVE_IDS.to_string(),
            params: serde_json::json!(4),
        };
        write_rpc_frame(&mut a, &request).await.unwrap();
        let decoded: Request = read_rpc_frame(&mut b).await.unwrap();
        assert_eq!(decoded.method, METHOD_RESERVE_IDS);
        assert_eq!(decoded.params, serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_oversized_rpc_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a
                .write_all(&((RPC_FRAME_MAX as u32) + 1).to_be_bytes())
                .await;
        });
        let err = read_rpc_frame::<_, Request>(&mut b).await.unwrap_err();
        assert!(matches!(err, RouterError::SetupRejected(_)));
    }
}
