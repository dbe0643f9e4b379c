//! External proof generation and verification.
//!
//! The synchronizer never generates proofs itself; it only carries a
//! handle to a prover so that callers can build proofs against the state
//! it rebuilds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::types::Field;

/// Circuits exposed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Circuit {
    /// User sign up
    SignUp,
    /// User state transition between epochs
    UserStateTransition,
    /// Epoch key ownership
    EpochKey,
    /// Epoch key ownership without state tree membership
    EpochKeyLite,
    /// Reputation range proof
    Reputation,
    /// Scoped nullifier
    ScopeNullifier,
}

impl Circuit {
    /// Circuit name as used by the artifact store.
    pub fn name(&self) -> &'static str {
        match self {
            Circuit::SignUp => "signup",
            Circuit::UserStateTransition => "userStateTransition",
            Circuit::EpochKey => "epochKey",
            Circuit::EpochKeyLite => "epochKeyLite",
            Circuit::Reputation => "reputation",
            Circuit::ScopeNullifier => "scopeNullifier",
        }
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A generated proof with its public signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofOutput {
    /// Flattened proof elements
    pub proof: Vec<Field>,
    /// Public signals in circuit order
    pub public_signals: Vec<Field>,
}

/// Proof generation and verification capability.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Generate a proof for `circuit` from its JSON-encoded inputs.
    async fn gen_proof_and_public_signals(
        &self,
        circuit: Circuit,
        inputs: &serde_json::Value,
    ) -> Result<ProofOutput>;

    /// Verify a proof against its public signals.
    async fn verify_proof(
        &self,
        circuit: Circuit,
        public_signals: &[Field],
        proof: &[Field],
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    /// Echoes its inputs back as public signals and accepts any non-empty proof.
    struct EchoProver;

    #[async_trait]
    impl Prover for EchoProver {
        async fn gen_proof_and_public_signals(
            &self,
            _circuit: Circuit,
            inputs: &serde_json::Value,
        ) -> Result<ProofOutput> {
            let signals = inputs
                .as_array()
                .ok_or_else(|| CoreError::Prover("inputs must be an array".to_string()))?
                .iter()
                .map(|v| v.as_u64().map(Field::from))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| CoreError::Prover("non-integer input".to_string()))?;
            Ok(ProofOutput {
                proof: vec![Field::from(1u64)],
                public_signals: signals,
            })
        }

        async fn verify_proof(
            &self,
            _circuit: Circuit,
            _public_signals: &[Field],
            proof: &[Field],
        ) -> Result<bool> {
            Ok(!proof.is_empty())
        }
    }

    #[tokio::test]
    async fn test_prover_trait_object() {
        let prover: Box<dyn Prover> = Box::new(EchoProver);
        let out = prover
            .gen_proof_and_public_signals(Circuit::EpochKey, &serde_json::json!([1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(out.public_signals.len(), 3);
        assert!(prover
            .verify_proof(Circuit::EpochKey, &out.public_signals, &out.proof)
            .await
            .unwrap());

        let err = prover
            .gen_proof_and_public_signals(Circuit::SignUp, &serde_json::json!({}))
            .await;
        assert!(err.is_err());
    }

    #[test]
    fn test_circuit_names() {
        assert_eq!(Circuit::UserStateTransition.to_string(), "userStateTransition");
        assert_eq!(
            serde_json::to_string(&Circuit::ScopeNullifier).unwrap(),
            "\"scopeNullifier\""
        );
    }
}
