//! Wait certificates
//!
//! The completed, embeddable proof that a wait timer fully elapsed,
//! committed to a specific block. The serialized certificate plus its
//! signature travel in the block's consensus field; any validator must be
//! able to round-trip them and recover the same identifier.

use crate::config::PoetConfigView;
use crate::crypto::{PublicKey, Signature};
use crate::enclave::{EnclaveError, EnclaveOracle, EnclaveWaitCertificate};
use crate::state::ConsensusState;
use crate::timer::WaitTimer;
use crate::types::{CertificateId, Hash, ValidatorId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute tolerance for local-mean comparison. The mean crosses a float
/// serialization boundary and two independent recomputations, so exact
/// equality is too strict.
const LOCAL_MEAN_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum CertificateError {
    /// The certificate fails a policy or structural check. The block
    /// carrying it is invalid; this is not a fault.
    #[error("invalid wait certificate: {0}")]
    Invalid(String),

    /// Oracle-boundary failure. `EnclaveError::Unavailable` inside is
    /// retryable and must not be read as proof of invalidity.
    #[error(transparent)]
    Enclave(#[from] EnclaveError),
}

/// The consensus field embedded in a claimed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPayload {
    pub serialized_certificate: Vec<u8>,
    pub signature: Signature,
}

impl ConsensusPayload {
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("payload serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CertificateError> {
        postcard::from_bytes(bytes)
            .map_err(|e| CertificateError::Invalid(format!("consensus payload: {e}")))
    }
}

/// A deserialized wait certificate plus its wire form.
#[derive(Debug, Clone)]
pub struct WaitCertificate {
    pub previous_certificate_id: CertificateId,
    pub local_mean: f64,
    pub request_time: f64,
    pub duration: f64,
    pub validator_id: ValidatorId,
    pub block_hash: Hash,
    pub signature: Signature,
    pub identifier: CertificateId,
    enclave_certificate: EnclaveWaitCertificate,
    serialized: Vec<u8>,
}

impl WaitCertificate {
    fn from_enclave(enclave_certificate: EnclaveWaitCertificate) -> Self {
        let serialized = enclave_certificate.serialize_body();
        let identifier = enclave_certificate.identifier();
        WaitCertificate {
            previous_certificate_id: enclave_certificate.previous_certificate_id,
            local_mean: enclave_certificate.local_mean,
            request_time: enclave_certificate.request_time,
            duration: enclave_certificate.duration,
            validator_id: enclave_certificate.validator_id,
            block_hash: enclave_certificate.block_hash,
            signature: enclave_certificate.signature,
            identifier,
            enclave_certificate,
            serialized,
        }
    }

    /// Create the certificate for an expired timer, committed to
    /// `block_hash`. Fails if the timer is unexpired, already consumed, or
    /// superseded by a newer timer for the same identity.
    pub fn create(
        enclave: &dyn EnclaveOracle,
        sealed_signup_data: &str,
        wait_timer: &WaitTimer,
        block_hash: &Hash,
    ) -> Result<WaitCertificate, EnclaveError> {
        let enclave_certificate =
            enclave.create_wait_certificate(sealed_signup_data, wait_timer.enclave_timer(), block_hash)?;
        Ok(Self::from_enclave(enclave_certificate))
    }

    /// Reconstruct from the wire form carried in a block.
    pub fn from_serialized(
        enclave: &dyn EnclaveOracle,
        serialized: &[u8],
        signature: &Signature,
    ) -> Result<WaitCertificate, CertificateError> {
        let enclave_certificate = enclave
            .deserialize_wait_certificate(serialized, signature)
            .map_err(|e| match e {
                EnclaveError::Unavailable(_) => CertificateError::Enclave(e),
                other => CertificateError::Invalid(other.to_string()),
            })?;
        Ok(Self::from_enclave(enclave_certificate))
    }

    pub fn from_payload(
        enclave: &dyn EnclaveOracle,
        payload: &ConsensusPayload,
    ) -> Result<WaitCertificate, CertificateError> {
        Self::from_serialized(enclave, &payload.serialized_certificate, &payload.signature)
    }

    /// The wire form to embed in the claimed block.
    pub fn payload(&self) -> ConsensusPayload {
        ConsensusPayload {
            serialized_certificate: self.serialized.clone(),
            signature: self.signature,
        }
    }

    /// Population size implied by this certificate's local mean.
    pub fn population_estimate(&self, config: &PoetConfigView) -> f64 {
        self.local_mean / config.target_wait_time
    }

    /// Validate this certificate against the chain position it claims.
    ///
    /// Policy checks run first; the cryptographic elapsed-time proof is
    /// delegated to the oracle last, so a transient oracle outage never
    /// masks a deterministic rejection.
    pub fn check_valid(
        &self,
        enclave: &dyn EnclaveOracle,
        expected_previous_certificate_id: CertificateId,
        poet_public_key: &PublicKey,
        consensus_state: &ConsensusState,
        config: &PoetConfigView,
    ) -> Result<(), CertificateError> {
        if self.duration < config.minimum_wait_time {
            return Err(CertificateError::Invalid(format!(
                "wait time less than minimum: {} < {}",
                self.duration, config.minimum_wait_time
            )));
        }

        let expected_mean = consensus_state.compute_local_mean(config);
        if !is_close(self.local_mean, expected_mean, LOCAL_MEAN_TOLERANCE) {
            return Err(CertificateError::Invalid(format!(
                "local mean does not match: {} != {}",
                self.local_mean, expected_mean
            )));
        }

        if self.previous_certificate_id != expected_previous_certificate_id {
            return Err(CertificateError::Invalid(format!(
                "previous certificate id does not match: {} != {}",
                self.previous_certificate_id, expected_previous_certificate_id
            )));
        }

        match enclave.verify_wait_certificate(&self.enclave_certificate, poet_public_key) {
            Ok(()) => Ok(()),
            Err(e @ EnclaveError::Unavailable(_)) => Err(CertificateError::Enclave(e)),
            Err(other) => Err(CertificateError::Invalid(other.to_string())),
        }
    }
}

impl std::fmt::Display for WaitCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CERT, {:.2}, {:.2}, {}, {}",
            self.local_mean, self.duration, self.identifier, self.previous_certificate_id
        )
    }
}

/// Float comparison within a tolerance.
pub(crate) fn is_close(a: f64, b: f64, abs_tol: f64) -> bool {
    (a - b).abs() <= f64::max(1e-9 * f64::max(a.abs(), b.abs()), abs_tol)
}
