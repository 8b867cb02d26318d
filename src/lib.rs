//! Rust library for controlling Snapcast multi-room audio servers
//!
//! This library provides an async client for the server's JSON-RPC control
//! port (TCP 1705, one JSON object per line). It supports:
//!
//! - Request/response correlation with typed errors
//! - Client volume, mute, name, latency and stream control
//! - Group stream, mute, name and membership control
//! - A local mirror of streams, groups and clients kept current by server
//!   notifications
//! - Lifecycle and state-change subscriptions
//! - Reconnection with exponential backoff
//!
//! Both the grouped schema of current servers and the flat client list of
//! older ones are understood.
//!
//! # Quick Start
//!
//! ```no_run
//! use snapcast_control::{Endpoint, Session, SessionConfig, StateEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(SessionConfig::default());
//!     session.connect(Endpoint::new("192.168.1.10", 1705)).await?;
//!
//!     // Load the full state into the mirror
//!     let status = session.get_status().await?;
//!     if let Some(client) = status.clients().next() {
//!         session.set_volume(&client.id, 40).await?;
//!     }
//!
//!     // Follow changes made by other control clients
//!     let mut updates = session.subscribe_state();
//!     while let Ok(event) = updates.recv().await {
//!         if let StateEvent::ClientChanged { client, .. } = event {
//!             println!("{} is at {}%", client.visible_name(), client.volume().percent);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Staying Connected
//!
//! [`Session`] never reconnects on its own. Wrap it in a [`Reconnector`] to
//! keep it connected:
//!
//! ```no_run
//! use snapcast_control::{Endpoint, Reconnector, Session};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::default();
//!     let mut reconnector = Reconnector::new(session.clone(), Endpoint::new("192.168.1.10", 1705));
//!     reconnector.start();
//!     // ... use `session` ...
//!     reconnector.stop().await;
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Connection**: Line-framed TCP transport
//! - **Protocol**: JSON-RPC 2.0 envelopes
//! - **Session**: Request ids, pending calls, notification routing
//! - **Mirror**: Local copy of the server state
//! - **Subscription**: Event fan-out to receivers and callbacks
//! - **Types**: Domain types and the versioned wire schema

mod commands;
mod config;
mod connection;
mod error;
mod mirror;
pub mod protocol;
mod reconnect;
mod session;
mod subscription;
mod types;

// Public exports
pub use config::{ReconnectConfig, SessionConfig};
pub use connection::{Connection, TransportEvent};
pub use error::{ControlError, Result};
pub use mirror::{ClientEventKind, StateMirror};
pub use reconnect::Reconnector;
pub use session::{Session, SessionPhase};
pub use subscription::{
    DisconnectReason, EventBus, EventReceiver, LifecycleEvent, LifecycleReceiver, StateEvent,
    StateReceiver, SubscriptionId,
};
pub use types::{
    Client, ClientConfig, ClientId, ClientSoftware, Endpoint, Group, GroupId, Host, LastSeen,
    ProtocolVersion, RpcVersion, Server, ServerSoftware, ServerStatus, Stream, StreamId,
    StreamStatus, StreamUri, Volume, DEFAULT_CONTROL_PORT,
};
