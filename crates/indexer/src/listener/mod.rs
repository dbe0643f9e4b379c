//! Chain access for the synchronizer.
//!
//! This module provides:
//! - The Unirep event schema and topic dispatch table
//! - The event source capability and its JSON-RPC implementation
//! - Chunked, retried range loading

pub mod events;
pub mod loader;
pub mod provider;
pub mod source;

pub use events::{decode_as, EventDecoder, EventKind, UnirepEvent};
pub use loader::{EventLoader, RunControl, RunToken};
pub use provider::RpcProvider;
pub use source::{EventFilter, EventSource, RawEvent};
