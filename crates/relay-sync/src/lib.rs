//! Client-side synchronization of streamed chat conversations.
//!
//! Inbound fragments are folded into per-conversation sessions by the
//! [`reconciler`], one live topic subscription per conversation is kept by the
//! [`registry`], optimistic sends go through the [`send`] coordinator, and the
//! [`engine`] ties them to the connection lifecycle.

pub mod engine;
pub mod reconciler;
pub mod registry;
pub mod send;
pub mod store;

pub use engine::SyncEngine;
pub use reconciler::{reconcile, Change, Reconciliation};
pub use registry::{FragmentHandler, SubscriptionRegistry};
pub use send::{Publisher, Rejection, SendCoordinator, SendOutcome};
pub use store::{ConversationSession, SessionStore};
