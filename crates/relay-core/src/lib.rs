//! Shared model of the Relay chat synchronization engine.
//!
//! Wire and read-model types, the error taxonomy, configuration, observable
//! sync events, and the contract of the history collaborator.

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod types;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use events::SyncEvent;
pub use history::{HistoryProvider, MemoryHistory};
pub use types::*;
