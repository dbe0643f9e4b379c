//! Subgraph entity shapes.
//!
//! Big integers arrive as decimal strings; small ones may arrive as either.

#![allow(missing_docs)]

use alloy::primitives::B256;
use serde::{de, Deserialize, Deserializer};
use unisync_core::{parse_field, AttesterId, Field, U256};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn lenient_field<'de, D: Deserializer<'de>>(d: D) -> Result<Field, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(U256::from(n)),
        NumOrStr::Str(s) => parse_field(&s).map_err(de::Error::custom),
    }
}

/// `attesters`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttesterEntity {
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_u64")]
    pub start_timestamp: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub epoch_length: u64,
}

/// `users`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    #[serde(deserialize_with = "lenient_field")]
    pub commitment: Field,
    #[serde(deserialize_with = "lenient_u64")]
    pub epoch: u64,
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_number: u64,
}

/// `stateTreeLeaves` and `epochTreeLeaves`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLeafEntity {
    #[serde(deserialize_with = "lenient_u64")]
    pub epoch: u64,
    #[serde(deserialize_with = "lenient_field")]
    pub leaf: Field,
    #[serde(deserialize_with = "lenient_u64")]
    pub index: u64,
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_number: u64,
}

/// `attestations`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationEntity {
    #[serde(deserialize_with = "lenient_u64")]
    pub epoch: u64,
    #[serde(deserialize_with = "lenient_field")]
    pub epoch_key: Field,
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_u64")]
    pub field_index: u64,
    #[serde(deserialize_with = "lenient_field")]
    pub change: Field,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_number: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub transaction_index: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub log_index: u64,
}

/// `nullifiers`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NullifierEntity {
    #[serde(deserialize_with = "lenient_field")]
    pub nullifier: Field,
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_u64")]
    pub epoch: u64,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_number: u64,
}

/// `epochs` (sealed epochs only)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochEntity {
    #[serde(deserialize_with = "lenient_u64")]
    pub number: u64,
    pub attester_id: AttesterId,
}

/// `historyTreeLeaves`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTreeLeafEntity {
    pub attester_id: AttesterId,
    #[serde(deserialize_with = "lenient_field")]
    pub leaf: Field,
}
