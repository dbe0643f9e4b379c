//! Unirep event synchronizer.
//!
//! This crate provides:
//! - Event decoding for the Unirep contract
//! - Chunked, retried event loading from a JSON-RPC node
//! - Idempotent, transactional per-event state transitions into SQLite
//! - Per-attester cursors for exact resumption after a restart
//! - Merkle tree rebuilds from persisted leaves
//! - A paginated-query (subgraph) adapter producing the same store state
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Synchronizer                                 │
//! │                                               │
//! │  ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ EventLoader  │ ◀─│ EventSource (RPC)    │  │
//! │  │ (JoinSet)    │   └──────────────────────┘  │
//! │  └──────┬───────┘                             │
//! │         │ sort by (block, tx, log)            │
//! │  ┌──────▼───────┐   ┌──────────────────────┐  │
//! │  │ handlers     │──▶│ Storage (SQLite)     │  │
//! │  │ one tx/event │   │ leaves, epochs,      │  │
//! │  └──────┬───────┘   │ cursors, records     │  │
//! │         │           └──────────┬───────────┘  │
//! │  ┌──────▼───────┐              │              │
//! │  │ Notifier     │   ┌──────────▼───────────┐  │
//! │  └──────────────┘   │ TreeRebuilder (IMT)  │  │
//! │                     └──────────────────────┘  │
//! └───────────────────────────────────────────────┘
//!
//! ┌───────────────────────────────────────────────┐
//! │  SubgraphSynchronizer                         │
//! │  PageSource (GraphQL) ──▶ same Storage writes │
//! └───────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod notify;
pub mod ordering;
pub mod partitions;
pub mod rebuild;
pub mod state;
pub mod storage;
pub mod subgraph;
pub mod synchronizer;

#[cfg(test)]
mod testing;

pub use error::{classify, SyncError};
pub use state::UnirepState;
pub use synchronizer::{PollOutcome, SyncPhase, Synchronizer};

// Re-export common types
pub use unisync_core::{types::*, *};
