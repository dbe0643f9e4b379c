//! # Unisync Core
//!
//! Core types, constants and hashing utilities shared by the Unirep event
//! synchronizer crates.
//!
//! ## Features
//!
//! - **Field elements**: `Field` is a 256-bit unsigned integer (Alloy `U256`)
//! - **Domain types**: `AttesterId`, `EventPosition`, `AttesterSetting`, `ProtocolSettings`
//! - **Constants**: the `MAX_EPOCH` sentinel and default tree leaves
//! - **Hashing**: keccak256 helpers used by the incremental Merkle tree
//! - **Prover**: the external proof generation/verification capability

#![warn(missing_docs)]

pub mod constants;
pub mod error;
pub mod hashing;
pub mod prover;
pub mod types;

// Re-export commonly used items
pub use constants::*;
pub use error::{CoreError, Result};
pub use hashing::{hash_pair, keccak256};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{Address, B256, U256};
