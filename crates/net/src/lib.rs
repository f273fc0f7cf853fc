//! Confab Network Library
//!
//! Event-driven networking for a peer-symmetric chat: one process
//! serves, the others connect.
//!
//! # Architecture
//!
//! - **Transport**: binds a listener or opens the single outbound
//!   socket, with optional mutual TLS
//! - **Connection**: one socket's framed read/write directions and
//!   its outbound queue
//! - **Registry**: the live connection set, with filtered broadcast
//! - **EventBus**: typed publish/subscribe decoupling I/O from logic
//! - **ChatService**: roster state and message routing policy
//! - **Protocol**: length-prefixed envelopes carrying JSON payloads
//!
//! # Usage
//!
//! ```ignore
//! let bus = Arc::new(EventBus::new());
//! let registry = Arc::new(Registry::new(bus.clone()));
//! let chat = ChatService::new(config.clone(), bus.clone(), registry.clone());
//! chat.register().await;
//!
//! // Role chosen by config.serve; runs until shutdown/disconnect
//! transport::run(config, registry, bus).await?;
//! ```

pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
mod frame;
pub mod protocol;
pub mod registry;
pub mod tls;
pub mod transport;

pub use chat::ChatService;
pub use config::{Config, TlsPaths};
pub use connection::Connection;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use protocol::{normalize_color, Payload, User};
pub use registry::Registry;

/// Default port for Confab
pub const DEFAULT_PORT: u16 = 8080;
