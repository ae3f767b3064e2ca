//! Enclave oracle boundary
//!
//! The oracle is the trusted-execution capability that draws randomized
//! wait durations, seals a validator's rotating PoET key pair, and signs
//! wait certificates once a duration has elapsed. Consensus logic talks to
//! it exclusively through [`EnclaveOracle`], so a hardware-backed
//! implementation and the pure-software [`simulator`] are interchangeable.
//!
//! Failure modes are split along the lines the verifier cares about:
//! [`EnclaveError::Unavailable`] is a transient service condition that must
//! be retried, never treated as proof that a certificate is invalid.

use crate::crypto::{PublicKey, Signature};
use crate::types::{CertificateId, Hash, ValidatorId};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod simulator;

/// Hard floor on any duration the oracle hands out, seconds. The config
/// default for `poet.minimum_wait_time` must match this.
pub const MINIMUM_WAIT_TIME: f64 = 1.0;

/// Grace period after expiry during which a certificate may still be
/// created from a timer. Past it the timer is dead.
pub const TIMER_TIMEOUT_PERIOD: f64 = 30.0;

/// Errors surfaced across the oracle boundary.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// The oracle service could not be reached or timed out. Retryable;
    /// distinct from any cryptographic failure.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// Hard cryptographic invalidity (bad signature, tampered handle).
    #[error("enclave signature check failed: {0}")]
    InvalidSignature(String),

    /// No sealed key material for this identity.
    #[error("validator is not enrolled")]
    NotEnrolled,

    #[error("wait timer has not expired")]
    TimerNotExpired,

    #[error("wait timer timed out {0:.1}s past expiry")]
    TimerTimedOut(f64),

    /// The timer was already consumed or a newer timer supersedes it.
    /// Certificate creation must follow timer-creation order.
    #[error("wait timer is stale: {0}")]
    StaleTimer(String),

    #[error("malformed enclave data: {0}")]
    Malformed(String),
}

impl EnclaveError {
    /// True for transient service conditions that the caller should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnclaveError::Unavailable(_))
    }
}

/// Time source for expiry decisions. Production uses [`SystemClock`];
/// tests drive a [`ManualClock`] so nothing sleeps.
pub trait Clock: Send + Sync {
    /// Epoch seconds
    fn now(&self) -> f64;
}

/// Wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        crate::types::now()
    }
}

/// Manually advanced clock with millisecond resolution
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(now: f64) -> Self {
        Self {
            millis: AtomicU64::new((now * 1000.0) as u64),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.millis
            .fetch_add((seconds * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

/// Result of enrolling an identity with the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupInfo {
    /// Public half of the freshly created PoET key pair
    pub poet_public_key: PublicKey,
    /// Base64 blob only the oracle can unseal; holds the private half
    pub sealed_signup_data: String,
    /// Attestation evidence for the registry (opaque to consensus)
    pub proof_data: String,
    /// Stable per-device identity used to deter Sybil enrollment
    pub anti_sybil_id: String,
}

/// Oracle-issued wait timer handle.
///
/// The oracle signs the body at creation; certificate creation re-verifies
/// that signature, so a handle mutated after the fact is rejected rather
/// than honored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveWaitTimer {
    pub validator_id: ValidatorId,
    pub previous_certificate_id: CertificateId,
    pub local_mean: f64,
    pub request_time: f64,
    pub duration: f64,
    pub signature: Signature,
}

impl EnclaveWaitTimer {
    /// Canonical bytes covered by the timer signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = (
            &self.validator_id,
            &self.previous_certificate_id,
            self.local_mean,
            self.request_time,
            self.duration,
        );
        postcard::to_allocvec(&body).expect("timer body serialization cannot fail")
    }

    pub fn expiry_time(&self) -> f64 {
        self.request_time + self.duration
    }

    pub fn has_expired(&self, now: f64) -> bool {
        now - self.request_time >= self.duration
    }
}

/// Oracle-issued wait certificate handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveWaitCertificate {
    pub previous_certificate_id: CertificateId,
    pub local_mean: f64,
    pub request_time: f64,
    pub duration: f64,
    pub validator_id: ValidatorId,
    pub nonce: Hash,
    pub block_hash: Hash,
    pub signature: Signature,
}

impl EnclaveWaitCertificate {
    /// Canonical serialized body; the signature covers exactly these bytes
    /// and the identifier is derived from them.
    pub fn serialize_body(&self) -> Vec<u8> {
        let body = (
            &self.previous_certificate_id,
            self.local_mean,
            self.request_time,
            self.duration,
            &self.validator_id,
            &self.nonce,
            &self.block_hash,
        );
        postcard::to_allocvec(&body).expect("certificate body serialization cannot fail")
    }

    pub fn deserialize_body(
        bytes: &[u8],
        signature: Signature,
    ) -> Result<Self, EnclaveError> {
        type Body = (CertificateId, f64, f64, f64, ValidatorId, Hash, Hash);
        let (previous_certificate_id, local_mean, request_time, duration, validator_id, nonce, block_hash): Body =
            postcard::from_bytes(bytes)
                .map_err(|e| EnclaveError::Malformed(format!("certificate body: {e}")))?;
        Ok(Self {
            previous_certificate_id,
            local_mean,
            request_time,
            duration,
            validator_id,
            nonce,
            block_hash,
            signature,
        })
    }

    /// Digest-derived identifier, the chain-link key for the successor
    /// certificate.
    pub fn identifier(&self) -> CertificateId {
        let digest: Hash = Sha3_256::digest(self.serialize_body()).into();
        CertificateId::from_digest(&digest)
    }
}

/// Capability interface over the trusted-execution oracle.
///
/// The oracle serializes timer and certificate creation per identity:
/// callers must treat them as a strict sequential pair and never request a
/// second timer before the first expires or is explicitly abandoned.
pub trait EnclaveOracle: Send + Sync {
    /// Create and seal a fresh PoET key pair for an identity.
    fn create_signup_info(
        &self,
        originator_public_key_hash: &Hash,
        nonce: &str,
    ) -> Result<SignupInfo, EnclaveError>;

    /// Recover the PoET public key from a sealed blob.
    fn unseal_signup_data(&self, sealed_signup_data: &str) -> Result<PublicKey, EnclaveError>;

    /// Release oracle resources tied to a sealed blob. The blob is unusable
    /// afterwards on every fork.
    fn release_signup_data(&self, sealed_signup_data: &str) -> Result<(), EnclaveError>;

    /// Draw a randomized duration around `local_mean` and return a signed
    /// timer handle.
    fn create_wait_timer(
        &self,
        sealed_signup_data: &str,
        validator_id: &ValidatorId,
        previous_certificate_id: CertificateId,
        local_mean: f64,
    ) -> Result<EnclaveWaitTimer, EnclaveError>;

    /// Produce the signed certificate proving `timer` fully elapsed,
    /// committed to `block_hash`. Consumes the timer: a second call for the
    /// same timer fails.
    fn create_wait_certificate(
        &self,
        sealed_signup_data: &str,
        timer: &EnclaveWaitTimer,
        block_hash: &Hash,
    ) -> Result<EnclaveWaitCertificate, EnclaveError>;

    /// Reconstruct a certificate handle from its wire form.
    fn deserialize_wait_certificate(
        &self,
        serialized: &[u8],
        signature: &Signature,
    ) -> Result<EnclaveWaitCertificate, EnclaveError>;

    /// Cryptographically verify the elapsed-time proof.
    fn verify_wait_certificate(
        &self,
        certificate: &EnclaveWaitCertificate,
        poet_public_key: &PublicKey,
    ) -> Result<(), EnclaveError>;
}
