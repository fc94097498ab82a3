//! Publish/subscribe transport for Relay.
//!
//! STOMP 1.2 over a single WebSocket link, with heart-beats, automatic
//! reconnection and RAII subscriptions. An in-process [`MemoryBroker`] speaks
//! the same protocol for tests and offline use.

pub mod connection;
pub mod error;
pub mod frame;
pub mod link;
pub mod memory;

pub use connection::{Connection, Subscription, Unsubscriber};
pub use error::TransportError;
pub use frame::{Command, Frame};
pub use link::{Connector, Link, WebSocketConnector};
pub use memory::{MemoryBroker, Published, Responder};
