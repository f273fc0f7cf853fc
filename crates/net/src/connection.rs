//! A single socket's two I/O directions and its outbound queue

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::frame::{read_frame, write_frame};

/// One live connection between this process and a peer.
///
/// Holds the identity and the outbound queue; the I/O itself runs in
/// [`drive`], which owns the socket until teardown.
pub struct Connection {
    cid: Uuid,
    remote_addr: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection handle plus the receive half of its outbound queue.
    pub fn open(remote_addr: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            cid: Uuid::new_v4(),
            remote_addr,
            outbound,
            cancel: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn cid(&self) -> Uuid {
        self.cid
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Enqueue bytes for delivery. Never blocks; fails only after teardown.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.outbound.send(data).map_err(|_| Error::ConnectionClosed)
    }

    /// Tear the connection down, cancelling both I/O directions.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Run both I/O directions until either ends or [`Connection::close`]
/// is called. Termination of one direction cancels the other; the
/// socket is dropped on return.
pub async fn drive<S>(
    stream: S,
    conn: Arc<Connection>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    bus: Arc<EventBus>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    tokio::select! {
        result = read_loop(&mut reader, conn.cid, &bus) => match result {
            Err(Error::ConnectionClosed) => debug!(cid = %conn.cid, "Peer closed connection"),
            Err(e) => warn!(cid = %conn.cid, error = %e, "Read error"),
            Ok(()) => {}
        },
        result = write_loop(&mut writer, &mut outbound_rx) => {
            if let Err(e) = result {
                warn!(cid = %conn.cid, error = %e, "Write error");
            }
        },
        _ = conn.cancel.cancelled() => {
            debug!(cid = %conn.cid, "Connection closed locally");
        }
    }
}

/// Receive direction: read frames forever, publishing each as an event.
async fn read_loop<R: AsyncRead + Unpin>(reader: &mut R, cid: Uuid, bus: &EventBus) -> Result<()> {
    loop {
        let data = read_frame(reader).await?;
        bus.publish(Event::DataReceived { cid, data }).await;
    }
}

/// Send direction: drain the outbound queue in enqueue order.
async fn write_loop<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()> {
    while let Some(data) = rx.recv().await {
        write_frame(writer, &data).await?;
    }
    Ok(())
}
