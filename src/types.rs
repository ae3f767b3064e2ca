//! Core identifier types shared across the consensus modules.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte SHA3-256 digest
pub type Hash = [u8; 32];

/// Block identifier (the block's header signature digest)
pub type BlockId = Hash;

/// Validator identity: the validator's signing public key bytes.
/// Doubles as the validator address carried in timers and certificates.
pub type ValidatorId = [u8; 32];

/// Identifier of the block before genesis
pub const NULL_BLOCK_ID: BlockId = [0u8; 32];

/// Wait certificate identifier: the leading 16 bytes of the SHA3-256
/// digest of the serialized certificate body.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CertificateId(pub [u8; 16]);

impl CertificateId {
    /// The null identifier: chain link of a genesis certificate.
    pub const NULL: CertificateId = CertificateId([0u8; 16]);

    pub fn from_digest(digest: &Hash) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        CertificateId(id)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for CertificateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Current wall-clock time as epoch seconds.
///
/// Consensus state never depends on this; it is used only on the claiming
/// side (timer expiry) and by the oracle simulator.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Short hex rendering for log lines: first 8 hex chars of an id.
pub fn short_id(id: &[u8]) -> String {
    hex::encode(&id[..id.len().min(4)])
}
