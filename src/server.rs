use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::debug;

use crate::dht::{DhtNetwork, DhtNode};
use crate::framing::{read_frame, write_frame};
use crate::identity::short_id;
use crate::net::IrohTransport;
use crate::protocol::{self, DhtRequest, DhtResponse, GetClosestNodesResponse};

/// Serve a single inbound connection for the DHT ALPN.
///
/// One request, one response. The client reads the reply and closes the
/// connection; this side only finishes its stream.
pub async fn handle_connection<N: DhtNetwork>(node: Arc<DhtNode<N>>, conn: Connection) -> Result<()> {
    let (mut send, mut recv) = conn.accept_bi().await?;
    let Some(bytes) = read_frame(&mut recv).await? else {
        return Ok(());
    };
    let request: DhtRequest = protocol::decode(&bytes)?;

    let reply = match request {
        DhtRequest::GetClosestNodes(req) => {
            let nodes = node.handle_get_closest_nodes(&req.from, req.target).await;
            DhtResponse::GetClosestNodesResponse(GetClosestNodesResponse { nodes })
        }
        DhtRequest::Ping(req) => {
            debug!(peer = %short_id(&req.from.id), "ping");
            node.handle_ping(&req.from).await;
            DhtResponse::Pong
        }
    };

    write_frame(&mut send, &protocol::encode(&reply)?).await?;
    send.finish()?;
    Ok(())
}

fn accept_error(err: anyhow::Error) -> AcceptError {
    AcceptError::from_err(io::Error::new(io::ErrorKind::Other, err))
}

/// The router entry point for inbound [`crate::net::DHT_ALPN`] connections.
#[derive(Clone)]
pub struct DhtProtocolHandler<N: DhtNetwork> {
    node: Arc<DhtNode<N>>,
}

impl<N: DhtNetwork> DhtProtocolHandler<N> {
    pub fn new(node: Arc<DhtNode<N>>) -> Self {
        Self { node }
    }
}

impl<N: DhtNetwork> fmt::Debug for DhtProtocolHandler<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtProtocolHandler").finish()
    }
}

impl<N: DhtNetwork> ProtocolHandler for DhtProtocolHandler<N> {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let node = self.node.clone();
        async move { handle_connection(node, connection).await.map_err(accept_error) }
    }
}

/// The router entry point for inbound [`crate::net::GOSSIP_ALPN`] links.
///
/// Accepted connections are handed to the [`IrohTransport`], which then owns
/// them for the lifetime of the link.
#[derive(Clone)]
pub struct GossipProtocolHandler {
    transport: IrohTransport,
}

impl GossipProtocolHandler {
    pub fn new(transport: IrohTransport) -> Self {
        Self { transport }
    }
}

impl fmt::Debug for GossipProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipProtocolHandler").finish()
    }
}

impl ProtocolHandler for GossipProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let transport = self.transport.clone();
        async move {
            let peer = transport.accept(connection).await.map_err(accept_error)?;
            debug!(peer = %short_id(&peer), "inbound gossip link");
            Ok(())
        }
    }
}
