//! Pure-software enclave oracle
//!
//! Simulates the trusted-execution oracle with ordinary signing keys and
//! deterministic randomness — no attestation, no hardware counters.
//! Interchangeable with a hardware-backed implementation behind
//! [`EnclaveOracle`]; consensus logic never knows which one is active.
//!
//! Durations are drawn from an exponential distribution around the local
//! mean: the seal key signs the previous certificate id, the low 64 bits of
//! the signature become a uniform draw in (0, 1], and
//! `duration = min_wait − local_mean · ln(u)`.

use crate::crypto::{Keypair, PublicKey, Signature};
use crate::enclave::{
    Clock, EnclaveError, EnclaveOracle, EnclaveWaitCertificate, EnclaveWaitTimer, SignupInfo,
    SystemClock, MINIMUM_WAIT_TIME, TIMER_TIMEOUT_PERIOD,
};
use crate::types::{CertificateId, Hash, ValidatorId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Content of a sealed signup blob. Only the simulator ever sees the
/// decoded form; everything outside the oracle boundary carries the opaque
/// base64 string.
#[derive(Serialize, Deserialize)]
struct SealedSignup {
    poet_secret_key: [u8; 32],
    poet_public_key: [u8; 32],
}

/// Software stand-in for the PoET enclave.
pub struct PoetSimulatorEnclave {
    /// Signs previous-certificate ids to derive duration randomness.
    /// Deterministic per (seal key, certificate id) like a hardware
    /// monotonic source would be.
    seal_keypair: Keypair,
    /// Signs simulated attestation evidence.
    report_keypair: Keypair,
    anti_sybil_id: String,
    clock: Arc<dyn Clock>,
    /// Newest outstanding timer signature per identity. Certificate
    /// creation must present exactly this timer; issuing a new timer
    /// supersedes the old one.
    current_timers: Mutex<HashMap<ValidatorId, Signature>>,
}

impl PoetSimulatorEnclave {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let seal_keypair = Keypair::generate(&mut OsRng);
        let device_digest: Hash = Sha3_256::digest(seal_keypair.public_key().as_bytes()).into();
        let anti_sybil_id = hex::encode(device_digest);
        Self {
            seal_keypair,
            report_keypair: Keypair::generate(&mut OsRng),
            anti_sybil_id,
            clock,
            current_timers: Mutex::new(HashMap::new()),
        }
    }

    fn unseal(&self, sealed_signup_data: &str) -> Result<(Keypair, PublicKey), EnclaveError> {
        let raw = BASE64
            .decode(sealed_signup_data)
            .map_err(|e| EnclaveError::Malformed(format!("sealed signup data: {e}")))?;
        let sealed: SealedSignup = bincode::deserialize(&raw)
            .map_err(|e| EnclaveError::Malformed(format!("sealed signup data: {e}")))?;
        let keypair = Keypair::from_secret_key(&sealed.poet_secret_key);
        let public = PublicKey::from_bytes(&sealed.poet_public_key);
        if *keypair.public_key() != public {
            return Err(EnclaveError::Malformed(
                "sealed key pair is inconsistent".into(),
            ));
        }
        Ok((keypair, public))
    }

    /// Uniform draw in (0, 1] derived from signing the chain link with the
    /// seal key.
    fn uniform_tag(&self, previous_certificate_id: &CertificateId) -> f64 {
        let tag = self.seal_keypair.sign(previous_certificate_id.as_bytes());
        let bytes: [u8; 8] = tag.as_bytes()[56..64].try_into().unwrap();
        let raw = u64::from_le_bytes(bytes);
        (raw as f64 / u64::MAX as f64).max(f64::MIN_POSITIVE)
    }
}

impl Default for PoetSimulatorEnclave {
    fn default() -> Self {
        Self::new()
    }
}

impl EnclaveOracle for PoetSimulatorEnclave {
    fn create_signup_info(
        &self,
        originator_public_key_hash: &Hash,
        nonce: &str,
    ) -> Result<SignupInfo, EnclaveError> {
        let poet_keypair = Keypair::generate(&mut OsRng);

        let sealed = SealedSignup {
            poet_secret_key: *poet_keypair.secret_key().as_bytes(),
            poet_public_key: *poet_keypair.public_key().as_bytes(),
        };
        let sealed_signup_data = BASE64.encode(
            bincode::serialize(&sealed)
                .map_err(|e| EnclaveError::Malformed(format!("seal: {e}")))?,
        );

        // Simulated attestation: a signed report binding the originator to
        // the fresh PoET public key. Enough structure for the registry to
        // round-trip; no real quote behind it.
        let report_body = serde_json::json!({
            "anti_sybil_id": self.anti_sybil_id,
            "nonce": nonce,
            "originator_public_key_hash": hex::encode(originator_public_key_hash),
            "poet_public_key": hex::encode(poet_keypair.public_key().as_bytes()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        let report_signature = self.report_keypair.sign(report_body.as_bytes());
        let proof_data = serde_json::json!({
            "verification_report": report_body,
            "signature": BASE64.encode(report_signature.as_bytes()),
        })
        .to_string();

        debug!(
            poet_public_key = %poet_keypair.public_key(),
            "created signup info"
        );

        Ok(SignupInfo {
            poet_public_key: *poet_keypair.public_key(),
            sealed_signup_data,
            proof_data,
            anti_sybil_id: self.anti_sybil_id.clone(),
        })
    }

    fn unseal_signup_data(&self, sealed_signup_data: &str) -> Result<PublicKey, EnclaveError> {
        let (_, public) = self.unseal(sealed_signup_data)?;
        Ok(public)
    }

    fn release_signup_data(&self, sealed_signup_data: &str) -> Result<(), EnclaveError> {
        // Nothing to release in software; validate the blob so a caller
        // releasing garbage still hears about it.
        self.unseal(sealed_signup_data).map(|_| ())
    }

    fn create_wait_timer(
        &self,
        sealed_signup_data: &str,
        validator_id: &ValidatorId,
        previous_certificate_id: CertificateId,
        local_mean: f64,
    ) -> Result<EnclaveWaitTimer, EnclaveError> {
        if !local_mean.is_finite() || local_mean <= 0.0 {
            return Err(EnclaveError::Malformed(format!(
                "local mean {local_mean} is not a positive finite value"
            )));
        }
        let (poet_keypair, _) = self.unseal(sealed_signup_data)?;

        let tag = self.uniform_tag(&previous_certificate_id);
        let duration = MINIMUM_WAIT_TIME - local_mean * tag.ln();

        let mut timer = EnclaveWaitTimer {
            validator_id: *validator_id,
            previous_certificate_id,
            local_mean,
            request_time: self.clock.now(),
            duration,
            signature: Signature([0u8; 64]),
        };
        timer.signature = poet_keypair.sign(&timer.signing_bytes());

        self.current_timers
            .lock()
            .expect("timer table lock")
            .insert(*validator_id, timer.signature);

        Ok(timer)
    }

    fn create_wait_certificate(
        &self,
        sealed_signup_data: &str,
        timer: &EnclaveWaitTimer,
        block_hash: &Hash,
    ) -> Result<EnclaveWaitCertificate, EnclaveError> {
        let (poet_keypair, _) = self.unseal(sealed_signup_data)?;

        // The timer must have been signed by the key in this sealed blob;
        // a handle whose fields were touched after creation fails here.
        poet_keypair
            .verify(&timer.signing_bytes(), &timer.signature)
            .map_err(|_| EnclaveError::StaleTimer("timer not signed by current key".into()))?;

        {
            let timers = self.current_timers.lock().expect("timer table lock");
            match timers.get(&timer.validator_id) {
                Some(current) if *current == timer.signature => {}
                Some(_) => {
                    return Err(EnclaveError::StaleTimer(
                        "a newer wait timer supersedes this one".into(),
                    ))
                }
                None => {
                    return Err(EnclaveError::StaleTimer(
                        "timer already consumed or never issued".into(),
                    ))
                }
            }
        }

        // Genesis concession: the first block of a fresh network does not
        // wait out its timer.
        let is_genesis = timer.previous_certificate_id.is_null();
        let now = self.clock.now();
        if !is_genesis {
            if !timer.has_expired(now) {
                return Err(EnclaveError::TimerNotExpired);
            }
            let past_expiry = now - timer.expiry_time();
            if past_expiry > TIMER_TIMEOUT_PERIOD {
                return Err(EnclaveError::TimerTimedOut(past_expiry));
            }
        }

        let mut hasher = Sha3_256::new();
        hasher.update(timer.signature.as_bytes());
        hasher.update(now.to_bits().to_le_bytes());
        let nonce: Hash = hasher.finalize().into();

        let mut certificate = EnclaveWaitCertificate {
            previous_certificate_id: timer.previous_certificate_id,
            local_mean: timer.local_mean,
            request_time: timer.request_time,
            duration: timer.duration,
            validator_id: timer.validator_id,
            nonce,
            block_hash: *block_hash,
            signature: Signature([0u8; 64]),
        };
        certificate.signature = poet_keypair.sign(&certificate.serialize_body());

        // Consume the timer: exactly one certificate per timer.
        self.current_timers
            .lock()
            .expect("timer table lock")
            .remove(&timer.validator_id);

        Ok(certificate)
    }

    fn deserialize_wait_certificate(
        &self,
        serialized: &[u8],
        signature: &Signature,
    ) -> Result<EnclaveWaitCertificate, EnclaveError> {
        EnclaveWaitCertificate::deserialize_body(serialized, *signature)
    }

    fn verify_wait_certificate(
        &self,
        certificate: &EnclaveWaitCertificate,
        poet_public_key: &PublicKey,
    ) -> Result<(), EnclaveError> {
        crate::crypto::verify(
            poet_public_key,
            &certificate.serialize_body(),
            &certificate.signature,
        )
        .map_err(|_| EnclaveError::InvalidSignature("wait certificate signature".into()))
    }
}
