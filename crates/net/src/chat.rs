//! The chat service: roster state and message routing policy
//!
//! The server owns the roster and fans messages out; a client keeps a
//! read-only copy, learns its own identity from the first snapshot,
//! and only ever talks to the server. A chat message therefore makes
//! at most two hops: client -> server -> every other client.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};
use crate::protocol::{normalize_color, Payload, User};
use crate::registry::Registry;

/// Color assigned when a peer announces an unparseable one
const FALLBACK_COLOR: &str = "000000";

/// Server-authoritative user roster plus the local user's identity
#[derive(Debug, Default)]
struct Roster {
    users: HashMap<Uuid, User>,
    self_id: Option<Uuid>,
}

impl Roster {
    fn insert(&mut self, user: User) {
        self.users.insert(user.uid, user);
    }

    fn remove(&mut self, uid: Uuid) -> Option<User> {
        self.users.remove(&uid)
    }

    /// Wholesale replacement from a snapshot (client side)
    fn replace(&mut self, users: HashMap<Uuid, User>, self_id: Option<Uuid>) {
        self.users = users;
        self.self_id = self_id;
    }

    fn get(&self, uid: Uuid) -> Option<User> {
        self.users.get(&uid).cloned()
    }
}

/// Application logic wired between the event bus and the registry
pub struct ChatService {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    roster: RwLock<Roster>,
}

impl ChatService {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            registry,
            roster: RwLock::new(Roster::default()),
        })
    }

    /// Wire the service's handlers into the bus.
    pub async fn register(self: &Arc<Self>) {
        // Decode/dispatch runs inline on each connection's read task,
        // so per-connection FIFO order carries into the bus.
        let service = self.clone();
        self.bus
            .subscribe(&[EventKind::DataReceived], move |event| {
                let service = service.clone();
                async move { service.on_data_received(event).await }
            })
            .await;

        // Everything that touches the roster or the registry shares one
        // deferred class: a single worker keeps mutations serialized.
        let kinds: &[EventKind] = if self.config.serve {
            &[
                EventKind::ServerStarted,
                EventKind::ConnectionEstablished,
                EventKind::ConnectionLost,
                EventKind::JoinRequest,
                EventKind::Chat,
                EventKind::InputSubmitted,
            ]
        } else {
            &[
                EventKind::ConnectedToHost,
                EventKind::ConnectionEstablished,
                EventKind::ConnectionLost,
                EventKind::Chat,
                EventKind::InputSubmitted,
            ]
        };
        let service = self.clone();
        self.bus
            .subscribe_deferred(kinds, move |event| {
                let service = service.clone();
                async move { service.handle(event).await }
            })
            .await;
    }

    /// Look up a user by id.
    pub async fn user(&self, uid: Uuid) -> Option<User> {
        self.roster.read().await.get(uid)
    }

    /// All known users, ordered by name for stable presentation.
    pub async fn users(&self) -> Vec<User> {
        let roster = self.roster.read().await;
        let mut users: Vec<User> = roster.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username).then(a.uid.cmp(&b.uid)));
        users
    }

    /// The local user's id: set by the first snapshot on a client,
    /// never set on the server (the server is a hub, not a participant).
    pub async fn self_id(&self) -> Option<Uuid> {
        self.roster.read().await.self_id
    }

    /// Decode an incoming frame and dispatch it by payload type.
    async fn on_data_received(&self, event: Event) {
        let Event::DataReceived { cid, data } = event else {
            return;
        };

        let payload = match Payload::decode(&data) {
            Ok(payload) => payload,
            Err(e) => {
                // A peer that frames garbage cannot be trusted to resync.
                warn!(cid = %cid, error = %e, "Undecodable frame, dropping connection");
                self.registry.close(cid).await;
                return;
            }
        };

        match payload {
            Payload::ChatMessage { uid, text } => {
                // The server never trusts a client-declared sender.
                let uid = if self.config.serve { cid } else { uid };
                self.bus.publish(Event::Chat { uid, text }).await;
            }
            Payload::JoinRequest { username, color } if self.config.serve => {
                self.bus
                    .publish(Event::JoinRequest {
                        cid,
                        username,
                        color,
                    })
                    .await;
            }
            Payload::ServerInfo { users, uid } if !self.config.serve => {
                self.roster.write().await.replace(users, uid);
                self.bus.publish(Event::RosterUpdated).await;
            }
            Payload::SystemMessage { text } if !self.config.serve => {
                self.bus.publish(Event::System { text }).await;
            }
            other => {
                debug!(cid = %cid, payload = ?other, "Ignoring unexpected payload");
            }
        }
    }

    async fn handle(&self, event: Event) {
        match event {
            Event::ServerStarted { addr } => {
                self.notice(format!("Server started on {}", addr)).await;
            }
            Event::ConnectedToHost => {
                self.notice(format!(
                    "Connected to server {}:{}",
                    self.config.host, self.config.port
                ))
                .await;
            }
            Event::ConnectionEstablished { remote_addr, .. } => {
                self.notice(format!("New connection: {}", remote_addr)).await;
                if !self.config.serve {
                    self.send_join_request().await;
                }
            }
            Event::ConnectionLost { cid, remote_addr } => {
                self.on_connection_lost(cid, remote_addr).await;
            }
            Event::JoinRequest {
                cid,
                username,
                color,
            } => {
                self.on_join_request(cid, username, color).await;
            }
            Event::Chat { uid, text } => {
                self.on_chat(uid, text).await;
            }
            Event::InputSubmitted { text } => {
                self.on_input_submitted(text).await;
            }
            _ => {}
        }
    }

    /// Server: admit a new user and resynchronize everyone.
    async fn on_join_request(&self, cid: Uuid, username: String, color: String) {
        let color = match normalize_color(&color) {
            Ok(color) => color,
            Err(e) => {
                warn!(cid = %cid, error = %e, "Join with bad color, using fallback");
                FALLBACK_COLOR.to_string()
            }
        };

        let user = User {
            uid: cid,
            username: username.clone(),
            color,
        };
        self.roster.write().await.insert(user);

        self.sync_roster().await;
        self.channel_notice(format!("{} joined the chat", username))
            .await;
    }

    /// Route a chat message according to the local role.
    async fn on_chat(&self, uid: Uuid, text: String) {
        let Some(user) = self.roster.read().await.get(uid) else {
            // Either a protocol violation or a race against a leave;
            // dropping is the only safe answer.
            warn!(uid = %uid, "Dropping chat message from unknown sender");
            return;
        };

        if self.config.serve {
            // Fan out to everyone except the sender
            match (Payload::ChatMessage {
                uid,
                text: text.clone(),
            })
            .encode()
            {
                Ok(bytes) => {
                    let exclude = HashSet::from([uid]);
                    self.registry.broadcast(&bytes, None, Some(&exclude)).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode chat message"),
            }
        } else if self.roster.read().await.self_id == Some(uid) {
            // Locally authored: one hop to the server, which fans out
            match (Payload::ChatMessage {
                uid,
                text: text.clone(),
            })
            .encode()
            {
                Ok(bytes) => self.registry.broadcast(&bytes, None, None).await,
                Err(e) => warn!(error = %e, "Failed to encode chat message"),
            }
        }

        self.bus.publish(Event::ChatMessage { user, text }).await;
    }

    /// Local input becomes a chat message (client) or a channel-wide
    /// announcement (server operator).
    async fn on_input_submitted(&self, text: String) {
        if text.is_empty() {
            return;
        }

        if self.config.serve {
            self.channel_notice(text).await;
            return;
        }

        match self.self_id().await {
            Some(uid) => self.bus.publish(Event::Chat { uid, text }).await,
            None => {
                self.notice("Not joined yet - message dropped".to_string())
                    .await;
            }
        }
    }

    /// Forget a departed connection's user and resynchronize.
    async fn on_connection_lost(&self, cid: Uuid, remote_addr: String) {
        self.notice(format!("Connection ended: {}", remote_addr)).await;

        if !self.config.serve {
            return;
        }

        let removed = self.roster.write().await.remove(cid);
        match removed {
            Some(user) => {
                self.sync_roster().await;
                self.channel_notice(format!("{} left the chat.", user.username))
                    .await;
            }
            None => debug!(cid = %cid, "Connection lost before join"),
        }
    }

    async fn send_join_request(&self) {
        let join = Payload::JoinRequest {
            username: self.config.username.clone(),
            color: self.config.color.clone(),
        };
        match join.encode() {
            Ok(bytes) => self.registry.broadcast(&bytes, None, None).await,
            Err(e) => warn!(error = %e, "Failed to encode join request"),
        }
    }

    /// Push a full snapshot to every registered connection, each copy
    /// tagged with the recipient's own id.
    async fn sync_roster(&self) {
        let users = self.roster.read().await.users.clone();
        for recipient in self.registry.cids().await {
            let info = Payload::ServerInfo {
                users: users.clone(),
                uid: Some(recipient),
            };
            match info.encode() {
                Ok(bytes) => {
                    let include = HashSet::from([recipient]);
                    self.registry.broadcast(&bytes, Some(&include), None).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode roster snapshot"),
            }
        }
        self.bus.publish(Event::RosterUpdated).await;
    }

    /// Render a system notice locally.
    async fn notice(&self, text: String) {
        self.bus.publish(Event::System { text }).await;
    }

    /// Broadcast a system notice to every connection and render it locally.
    async fn channel_notice(&self, text: String) {
        match (Payload::SystemMessage { text: text.clone() }).encode() {
            Ok(bytes) => self.registry.broadcast(&bytes, None, None).await,
            Err(e) => warn!(error = %e, "Failed to encode system message"),
        }
        self.notice(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config(serve: bool, username: &str, color: &str) -> Arc<Config> {
        Arc::new(Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            username: username.to_string(),
            color: color.to_string(),
            serve,
            tls: None,
        })
    }

    async fn stack(config: Arc<Config>) -> (Arc<EventBus>, Arc<Registry>, Arc<ChatService>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(bus.clone()));
        let chat = ChatService::new(config, bus.clone(), registry.clone());
        chat.register().await;
        (bus, registry, chat)
    }

    async fn probe(bus: &EventBus, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(kinds, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        })
        .await;
        rx
    }

    async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Payload {
        let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection queue closed");
        Payload::decode(&data).expect("undecodable frame")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event probe closed")
    }

    /// Connect a fake client and run its join through the decode path.
    async fn join(
        bus: &EventBus,
        registry: &Registry,
        name: &str,
        color: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (conn, rx) = Connection::open(format!("{}-addr", name));
        let cid = conn.cid();
        registry.add(conn).await;

        let join = Payload::JoinRequest {
            username: name.to_string(),
            color: color.to_string(),
        }
        .encode()
        .unwrap();
        bus.publish(Event::DataReceived { cid, data: join }).await;
        (cid, rx)
    }

    fn assert_roster(payload: Payload, expected: &[&str], self_id: Uuid) {
        match payload {
            Payload::ServerInfo { users, uid } => {
                let mut names: Vec<&str> =
                    users.values().map(|u| u.username.as_str()).collect();
                names.sort_unstable();
                assert_eq!(names, expected);
                assert_eq!(uid, Some(self_id));
            }
            other => panic!("expected ServerInfo, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_resyncs_every_connection() {
        let (bus, registry, chat) = stack(test_config(true, "host", "000000")).await;

        let (alice, mut rx_a) = join(&bus, &registry, "alice", "ff0000").await;
        assert_roster(next_payload(&mut rx_a).await, &["alice"], alice);
        assert_eq!(
            next_payload(&mut rx_a).await,
            Payload::SystemMessage {
                text: "alice joined the chat".to_string()
            }
        );

        let (bob, mut rx_b) = join(&bus, &registry, "bob", "00ff00").await;

        // Both the existing and the new connection get tagged snapshots
        assert_roster(next_payload(&mut rx_a).await, &["alice", "bob"], alice);
        assert_roster(next_payload(&mut rx_b).await, &["alice", "bob"], bob);
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                next_payload(rx).await,
                Payload::SystemMessage {
                    text: "bob joined the chat".to_string()
                }
            );
        }

        let users = chat.users().await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[1].username, "bob");
    }

    #[tokio::test]
    async fn test_leave_resyncs_and_announces_once() {
        let (bus, registry, chat) = stack(test_config(true, "host", "000000")).await;

        let (alice, mut rx_a) = join(&bus, &registry, "alice", "ff0000").await;
        let (bob, _rx_b) = join(&bus, &registry, "bob", "00ff00").await;

        // Drain alice's join/resync traffic
        for _ in 0..4 {
            next_payload(&mut rx_a).await;
        }

        registry.remove(bob).await;

        assert_roster(next_payload(&mut rx_a).await, &["alice"], alice);
        assert_eq!(
            next_payload(&mut rx_a).await,
            Payload::SystemMessage {
                text: "bob left the chat.".to_string()
            }
        );
        assert!(rx_a.try_recv().is_err(), "expected exactly one announcement");

        assert_eq!(chat.users().await.len(), 1);
        assert!(chat.user(bob).await.is_none());
    }

    #[tokio::test]
    async fn test_sender_id_is_overridden_with_the_connection() {
        let (bus, registry, _chat) = stack(test_config(true, "host", "000000")).await;

        let (alice, mut rx_a) = join(&bus, &registry, "alice", "ff0000").await;
        let (_bob, mut rx_b) = join(&bus, &registry, "bob", "00ff00").await;
        for _ in 0..4 {
            next_payload(&mut rx_a).await;
        }
        for _ in 0..2 {
            next_payload(&mut rx_b).await;
        }

        let mut rendered = probe(&bus, &[EventKind::ChatMessage]).await;

        // Alice's connection claims somebody else wrote the message
        let forged = Payload::ChatMessage {
            uid: Uuid::new_v4(),
            text: "hi".to_string(),
        }
        .encode()
        .unwrap();
        bus.publish(Event::DataReceived {
            cid: alice,
            data: forged,
        })
        .await;

        // Bob receives it attributed to alice; alice gets no echo
        assert_eq!(
            next_payload(&mut rx_b).await,
            Payload::ChatMessage {
                uid: alice,
                text: "hi".to_string()
            }
        );
        assert!(rx_a.try_recv().is_err());

        // The server's own transcript resolves the true sender too
        match next_event(&mut rendered).await {
            Event::ChatMessage { user, text } => {
                assert_eq!(user.username, "alice");
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_from_unjoined_connection_is_dropped() {
        let (bus, registry, _chat) = stack(test_config(true, "host", "000000")).await;

        let (_alice, mut rx_a) = join(&bus, &registry, "alice", "ff0000").await;
        for _ in 0..2 {
            next_payload(&mut rx_a).await;
        }

        // Connected but never joined
        let (ghost, _rx_ghost) = {
            let (conn, rx) = Connection::open("ghost-addr".to_string());
            let cid = conn.cid();
            registry.add(conn).await;
            (cid, rx)
        };

        let msg = Payload::ChatMessage {
            uid: ghost,
            text: "boo".to_string(),
        }
        .encode()
        .unwrap();
        bus.publish(Event::DataReceived {
            cid: ghost,
            data: msg,
        })
        .await;

        // Give the worker a chance to (not) fan out
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_color_is_normalized() {
        let (bus, registry, chat) = stack(test_config(true, "host", "000000")).await;

        let (alice, mut rx_a) = join(&bus, &registry, "alice", "#FF8800").await;
        next_payload(&mut rx_a).await;

        assert_eq!(chat.user(alice).await.unwrap().color, "ff8800");

        let (bob, mut rx_b) = join(&bus, &registry, "bob", "chartreuse").await;
        next_payload(&mut rx_b).await;
        assert_eq!(chat.user(bob).await.unwrap().color, FALLBACK_COLOR);
    }

    #[tokio::test]
    async fn test_client_joins_then_chats() {
        let (bus, registry, chat) = stack(test_config(false, "alice", "ff0000")).await;
        let mut notices = probe(&bus, &[EventKind::System, EventKind::ChatMessage]).await;

        // The single connection to the server
        let (conn, mut rx_server) = Connection::open("server-addr".to_string());
        let server_cid = conn.cid();
        registry.add(conn).await;

        // Registration triggers the join request
        assert_eq!(
            next_payload(&mut rx_server).await,
            Payload::JoinRequest {
                username: "alice".to_string(),
                color: "ff0000".to_string()
            }
        );

        // Input before the roster arrives is dropped with a notice
        bus.publish(Event::InputSubmitted {
            text: "too soon".to_string(),
        })
        .await;
        loop {
            match next_event(&mut notices).await {
                Event::System { text } if text.contains("message dropped") => break,
                Event::System { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(rx_server.try_recv().is_err());

        // Roster snapshot assigns our identity
        let me = server_cid; // server keys users by our connection id on its side
        let mut users = HashMap::new();
        users.insert(
            me,
            User {
                uid: me,
                username: "alice".to_string(),
                color: "ff0000".to_string(),
            },
        );
        let snapshot = Payload::ServerInfo {
            users,
            uid: Some(me),
        }
        .encode()
        .unwrap();
        bus.publish(Event::DataReceived {
            cid: server_cid,
            data: snapshot,
        })
        .await;
        assert_eq!(chat.self_id().await, Some(me));

        // Local input now flows to the server and renders locally
        bus.publish(Event::InputSubmitted {
            text: "hi".to_string(),
        })
        .await;
        assert_eq!(
            next_payload(&mut rx_server).await,
            Payload::ChatMessage {
                uid: me,
                text: "hi".to_string()
            }
        );
        loop {
            match next_event(&mut notices).await {
                Event::ChatMessage { user, text } => {
                    assert_eq!(user.username, "alice");
                    assert_eq!(text, "hi");
                    break;
                }
                Event::System { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
