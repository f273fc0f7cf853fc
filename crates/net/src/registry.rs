//! The set of live connections
//!
//! Membership changes, broadcast, and teardown all run under one lock,
//! so no caller ever observes a partially-updated set: an
//! "established" event is only published for a connection that is in
//! the set, and a broadcast never reaches a connection that has been
//! removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::connection::Connection;
use crate::events::{Event, EventBus};

/// The live connection set
pub struct Registry {
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
    bus: Arc<EventBus>,
}

impl Registry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Insert a connection and announce it, in one critical section.
    pub async fn add(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        let cid = conn.cid();
        let remote_addr = conn.remote_addr().to_string();
        connections.insert(cid, conn);
        self.bus
            .publish(Event::ConnectionEstablished { cid, remote_addr })
            .await;
    }

    /// Remove a connection and announce the loss, in one critical section.
    pub async fn remove(&self, cid: Uuid) {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.remove(&cid) {
            self.bus
                .publish(Event::ConnectionLost {
                    cid,
                    remote_addr: conn.remote_addr().to_string(),
                })
                .await;
        }
    }

    /// Enqueue `data` on every live connection passing the filters:
    /// with `include`, only those ids; with `exclude`, all but those.
    ///
    /// Sends are enqueue-only, so one connection's failure never
    /// delays or prevents delivery to the others.
    pub async fn broadcast(
        &self,
        data: &[u8],
        include: Option<&HashSet<Uuid>>,
        exclude: Option<&HashSet<Uuid>>,
    ) {
        let connections = self.connections.lock().await;
        for (cid, conn) in connections.iter() {
            if include.is_some_and(|set| !set.contains(cid)) {
                continue;
            }
            if exclude.is_some_and(|set| set.contains(cid)) {
                continue;
            }
            if conn.send(data.to_vec()).is_err() {
                debug!(cid = %cid, "Failed to queue broadcast for connection");
            }
        }
    }

    /// Cancel a connection's I/O. Removal happens when its driver
    /// unwinds through [`Registry::remove`].
    pub async fn close(&self, cid: Uuid) {
        let connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&cid) {
            conn.close();
        }
    }

    /// Ids of every live connection
    pub async fn cids(&self) -> Vec<Uuid> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
