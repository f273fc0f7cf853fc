//! Typed publish/subscribe event bus
//!
//! Decouples network I/O from application logic. Handlers register per
//! event kind and run in registration order. Inline handlers complete
//! inside [`EventBus::publish`]; deferred handlers run on a dedicated
//! worker task fed by a bounded queue, so a slow handler exerts
//! backpressure on publishers instead of growing unbounded work.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::protocol::User;

/// Queue depth for each deferred handler class
const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Everything that can happen in the system
#[derive(Debug, Clone)]
pub enum Event {
    /// The listener is bound and accepting
    ServerStarted { addr: SocketAddr },

    /// The outbound connection to the server is up
    ConnectedToHost,

    /// A connection was added to the registry
    ConnectionEstablished { cid: Uuid, remote_addr: String },

    /// A connection was removed from the registry
    ConnectionLost { cid: Uuid, remote_addr: String },

    /// A full frame arrived on a connection
    DataReceived { cid: Uuid, data: Vec<u8> },

    /// The local user submitted a line of input
    InputSubmitted { text: String },

    /// A chat message (from the wire or local input) awaiting routing
    Chat { uid: Uuid, text: String },

    /// A chat message resolved against the roster, ready to render
    ChatMessage { user: User, text: String },

    /// Informational text ready to render
    System { text: String },

    /// A client asked to join; `cid` is its connection
    JoinRequest {
        cid: Uuid,
        username: String,
        color: String,
    },

    /// The local roster was replaced
    RosterUpdated,
}

/// Field-less discriminant used to key subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarted,
    ConnectedToHost,
    ConnectionEstablished,
    ConnectionLost,
    DataReceived,
    InputSubmitted,
    Chat,
    ChatMessage,
    System,
    JoinRequest,
    RosterUpdated,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ServerStarted { .. } => EventKind::ServerStarted,
            Event::ConnectedToHost => EventKind::ConnectedToHost,
            Event::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Event::ConnectionLost { .. } => EventKind::ConnectionLost,
            Event::DataReceived { .. } => EventKind::DataReceived,
            Event::InputSubmitted { .. } => EventKind::InputSubmitted,
            Event::Chat { .. } => EventKind::Chat,
            Event::ChatMessage { .. } => EventKind::ChatMessage,
            Event::System { .. } => EventKind::System,
            Event::JoinRequest { .. } => EventKind::JoinRequest,
            Event::RosterUpdated => EventKind::RosterUpdated,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    /// Runs to completion inside `publish`, on the publisher's task
    Inline(Handler),
    /// Enqueued to a worker task; `publish` does not wait for it
    Deferred(mpsc::Sender<Event>),
}

/// Publish/subscribe dispatcher over [`Event`]
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inline handler for the given event kinds.
    pub async fn subscribe<F, Fut>(&self, kinds: &[EventKind], handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        let mut subscribers = self.subscribers.write().await;
        for kind in kinds {
            subscribers
                .entry(*kind)
                .or_default()
                .push(Subscriber::Inline(handler.clone()));
        }
    }

    /// Register a deferred handler class for the given event kinds.
    ///
    /// All matching events feed one bounded queue drained by a single
    /// worker, so the class handles them FIFO and one at a time.
    pub async fn subscribe_deferred<F, Fut>(&self, kinds: &[EventKind], handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Event>(DISPATCH_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event).await;
            }
        });

        let mut subscribers = self.subscribers.write().await;
        for kind in kinds {
            subscribers
                .entry(*kind)
                .or_default()
                .push(Subscriber::Deferred(tx.clone()));
        }
    }

    /// Dispatch an event to every handler registered for its kind, in
    /// registration order. Inline handlers have completed when this
    /// returns; deferred handlers have only been enqueued.
    pub async fn publish(&self, event: Event) {
        let subscribers = self.subscribers.read().await.get(&event.kind()).cloned();
        let Some(subscribers) = subscribers else {
            return;
        };

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Inline(handler) => handler(event.clone()).await,
                Subscriber::Deferred(tx) => {
                    if tx.send(event.clone()).await.is_err() {
                        warn!(kind = ?event.kind(), "Dropped event for dead handler class");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn system(text: &str) -> Event {
        Event::System {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_inline_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(&[EventKind::System], move |_| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(tag);
                }
            })
            .await;
        }

        bus.publish(system("x")).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_handlers_only_see_their_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        bus.subscribe(&[EventKind::System], move |event| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(event.kind());
            }
        })
        .await;

        bus.publish(Event::RosterUpdated).await;
        bus.publish(system("x")).await;
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::System]);
    }

    #[tokio::test]
    async fn test_deferred_class_handles_events_in_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_deferred(&[EventKind::System], move |event| {
            let tx = tx.clone();
            async move {
                if let Event::System { text } = event {
                    let _ = tx.send(text);
                }
            }
        })
        .await;

        for i in 0..5 {
            bus.publish(system(&i.to_string())).await;
        }
        for i in 0..5 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_inline_and_deferred_are_additive() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let inline_tx = tx.clone();
        bus.subscribe(&[EventKind::System], move |_| {
            let tx = inline_tx.clone();
            async move {
                let _ = tx.send("inline");
            }
        })
        .await;

        bus.subscribe_deferred(&[EventKind::System], move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("deferred");
            }
        })
        .await;

        bus.publish(system("x")).await;

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort_unstable();
        assert_eq!(got, vec!["deferred", "inline"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(Event::ConnectedToHost).await;
    }
}
