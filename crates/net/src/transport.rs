//! Transport bootstrap: a listening server or one outbound connection
//!
//! Sockets are optionally wrapped with mutual TLS, then handed to the
//! registry as [`Connection`]s and driven to completion. Exactly one
//! of the two roles runs per process.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{self, Connection};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::registry::Registry;
use crate::tls;

/// Run the configured role to completion.
///
/// Startup faults (bind, connect, TLS construction) propagate out and
/// are fatal; anything after that is handled per connection.
pub async fn run(config: Arc<Config>, registry: Arc<Registry>, bus: Arc<EventBus>) -> Result<()> {
    if config.serve {
        run_server(config, registry, bus).await
    } else {
        run_client(config, registry, bus).await
    }
}

/// Bind, announce, and accept until the process ends.
async fn run_server(config: Arc<Config>, registry: Arc<Registry>, bus: Arc<EventBus>) -> Result<()> {
    let acceptor = config.tls.as_ref().map(tls::server_acceptor).transpose()?;

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, tls = acceptor.is_some(), "Server started");
    bus.publish(Event::ServerStarted { addr }).await;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };
        debug!(addr = %peer, "New connection");

        // One task per client: its failures never reach the listener.
        let registry = registry.clone();
        let bus = bus.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let remote_addr = peer.ip().to_string();
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, remote_addr, registry, bus).await,
                    Err(e) => warn!(addr = %peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, remote_addr, registry, bus).await,
            }
        });
    }
}

/// Open the single outbound connection and drive it to completion.
async fn run_client(config: Arc<Config>, registry: Arc<Registry>, bus: Arc<EventBus>) -> Result<()> {
    let connector = config.tls.as_ref().map(tls::client_connector).transpose()?;

    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    let peer = stream.peer_addr()?;
    info!(addr = %peer, tls = connector.is_some(), "Connected to host");

    let remote_addr = peer.ip().to_string();
    match connector {
        Some(connector) => {
            let name = tls::server_name(&config.host)?;
            let stream = connector.connect(name, stream).await?;
            bus.publish(Event::ConnectedToHost).await;
            serve_connection(stream, remote_addr, registry, bus).await;
        }
        None => {
            bus.publish(Event::ConnectedToHost).await;
            serve_connection(stream, remote_addr, registry, bus).await;
        }
    }

    info!("Client connection ended");
    Ok(())
}

/// Register a connection, drive it until either direction ends, then
/// deregister it.
async fn serve_connection<S>(
    stream: S,
    remote_addr: String,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (conn, outbound_rx) = Connection::open(remote_addr);
    registry.add(conn.clone()).await;
    connection::drive(stream, conn.clone(), outbound_rx, bus).await;
    registry.remove(conn.cid()).await;
}
