//! Validator registry view
//!
//! Read-only access to the on-chain validator registry: who is enrolled,
//! under which PoET public key, and where that registration committed.
//! Lookups are scoped to a block so that verification sees the registry
//! exactly as it stood at the parent of the block under test.

use crate::crypto::PublicKey;
use crate::types::{BlockId, ValidatorId};
use std::collections::HashMap;
use std::sync::RwLock;

/// One validator's registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorInfo {
    pub name: String,
    /// Signing public key, the validator's identity
    pub id: ValidatorId,
    /// The rotating PoET public key from the current signup
    pub poet_public_key: PublicKey,
    /// Chain-head nonce recorded when the signup was created
    pub signup_nonce: String,
    /// Number of the block in which the current registration committed
    pub commit_block_num: u64,
}

/// Read-only registry lookups, evaluated at a given block's state.
pub trait RegistryView: Send + Sync {
    fn validator_info(&self, block_id: &BlockId, validator_id: &ValidatorId)
        -> Option<ValidatorInfo>;

    /// Every registered validator as of the block's state.
    fn validators(&self, block_id: &BlockId) -> Vec<ValidatorInfo>;

    fn validator_count(&self, block_id: &BlockId) -> usize {
        self.validators(block_id).len()
    }
}

/// Map-backed registry for embedding simulations and tests. Entries are
/// global rather than block-scoped; good enough when the test fixture
/// registers everyone up front.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<ValidatorId, ValidatorInfo>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: ValidatorInfo) {
        self.entries
            .write()
            .expect("registry lock")
            .insert(info.id, info);
    }

    pub fn deregister(&self, validator_id: &ValidatorId) {
        self.entries
            .write()
            .expect("registry lock")
            .remove(validator_id);
    }
}

impl RegistryView for InMemoryRegistry {
    fn validator_info(
        &self,
        _block_id: &BlockId,
        validator_id: &ValidatorId,
    ) -> Option<ValidatorInfo> {
        self.entries
            .read()
            .expect("registry lock")
            .get(validator_id)
            .cloned()
    }

    fn validators(&self, _block_id: &BlockId) -> Vec<ValidatorInfo> {
        self.entries
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    fn validator_count(&self, _block_id: &BlockId) -> usize {
        self.entries.read().expect("registry lock").len()
    }
}
