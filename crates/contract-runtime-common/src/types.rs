//! Shared data types.
//!
//! - [`ContractId`]: key of one instance pool
//! - [`TxContext`]: transaction metadata injected into every call
//! - [`InvocationResult`]: outcome of a single contract call

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Call parameters: unique string keys mapped to raw bytes.
pub type Parameters = BTreeMap<String, Vec<u8>>;

/// Parameter keys injected by the runtime.
pub mod param_keys {
    pub const TX_ID: &str = "__tx_id__";
    pub const CREATOR_ORG_ID: &str = "__creator_org_id__";
    pub const CREATOR_ROLE: &str = "__creator_role__";
    pub const CREATOR_PK: &str = "__creator_pk__";
    pub const SENDER_ORG_ID: &str = "__sender_org_id__";
    pub const SENDER_ROLE: &str = "__sender_role__";
    pub const SENDER_PK: &str = "__sender_pk__";
    pub const BLOCK_HEIGHT: &str = "__block_height__";
    pub const CONTEXT_PTR: &str = "__context_ptr__";
}

/// Identity of a deployed contract: one pool per name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ContractId {
    /// Contract name.
    pub name: String,
    /// Contract version.
    pub version: String,
}

impl ContractId {
    /// Create a contract id.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.version)
    }
}

/// A transaction participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Member {
    /// Organization id.
    pub org_id: String,
    /// Role within the organization.
    pub role: String,
    /// Public key or certificate bytes.
    pub public_key: Vec<u8>,
}

/// Transaction metadata supplied by the host chain's simulation context.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TxContext {
    /// Transaction id.
    pub tx_id: String,
    /// Creator of the contract.
    pub creator: Member,
    /// Sender of the transaction.
    pub sender: Member,
    /// Height of the block being simulated.
    pub block_height: u64,
    /// Block format version, used to select guest ABI compatibility.
    pub block_version: u32,
}

impl TxContext {
    /// Insert the base parameters every contract call receives.
    ///
    /// Existing caller values under the same keys are overwritten.
    pub fn fill_base_params(&self, params: &mut Parameters) {
        let entries = [
            (param_keys::TX_ID, self.tx_id.as_bytes().to_vec()),
            (param_keys::CREATOR_ORG_ID, self.creator.org_id.as_bytes().to_vec()),
            (param_keys::CREATOR_ROLE, self.creator.role.as_bytes().to_vec()),
            (param_keys::CREATOR_PK, self.creator.public_key.clone()),
            (param_keys::SENDER_ORG_ID, self.sender.org_id.as_bytes().to_vec()),
            (param_keys::SENDER_ROLE, self.sender.role.as_bytes().to_vec()),
            (param_keys::SENDER_PK, self.sender.public_key.clone()),
            (
                param_keys::BLOCK_HEIGHT,
                self.block_height.to_string().into_bytes(),
            ),
        ];
        for (key, value) in entries {
            params.insert(key.to_string(), value);
        }
    }
}

/// Outcome of one contract invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InvocationResult {
    /// `0` on success, nonzero on failure.
    pub status_code: u32,
    /// Output published by the contract, empty when none.
    pub payload: Vec<u8>,
    /// Failure description, empty on success.
    pub message: String,
    /// Gas consumed by the transaction so far.
    pub gas_used: u64,
}

impl InvocationResult {
    /// Status code of a successful call.
    pub const SUCCESS: u32 = 0;
    /// Status code of a failed call.
    pub const FAILURE: u32 = 1;

    /// Build a successful result.
    pub fn success(payload: Vec<u8>, gas_used: u64) -> Self {
        Self {
            status_code: Self::SUCCESS,
            payload,
            message: String::new(),
            gas_used,
        }
    }

    /// Build a failed result.
    pub fn failure(message: impl Into<String>, gas_used: u64) -> Self {
        Self {
            status_code: Self::FAILURE,
            payload: Vec::new(),
            message: message.into(),
            gas_used,
        }
    }

    /// Returns `true` if the call succeeded.
    pub fn is_success(&self) -> bool {
        self.status_code == Self::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_id_display() {
        let id = ContractId::new("counter", "1.0.0");
        assert_eq!(id.to_string(), "counter_1.0.0");
    }

    #[test]
    fn test_fill_base_params() {
        let tx = TxContext {
            tx_id: "TX_ID".into(),
            creator: Member {
                org_id: "CREATOR_ORG_ID".into(),
                role: "CREATOR_ROLE".into(),
                public_key: b"CREATOR_PK".to_vec(),
            },
            block_height: 111,
            ..Default::default()
        };

        let mut params = Parameters::new();
        params.insert("key".into(), b"test_key".to_vec());
        params.insert(param_keys::TX_ID.into(), b"spoofed".to_vec());
        tx.fill_base_params(&mut params);

        assert_eq!(params.len(), 9);
        assert_eq!(params["key"], b"test_key");
        assert_eq!(params[param_keys::TX_ID], b"TX_ID");
        assert_eq!(params[param_keys::CREATOR_PK], b"CREATOR_PK");
        assert_eq!(params[param_keys::BLOCK_HEIGHT], b"111");
        assert!(params[param_keys::SENDER_ORG_ID].is_empty());
    }

    #[test]
    fn test_invocation_result_constructors() {
        let ok = InvocationResult::success(b"42".to_vec(), 17);
        assert!(ok.is_success());
        assert!(ok.message.is_empty());

        let failed = InvocationResult::failure("boom", 3);
        assert!(!failed.is_success());
        assert_eq!(failed.status_code, 1);
        assert!(failed.payload.is_empty());
        assert_eq!(failed.gas_used, 3);
    }
}
