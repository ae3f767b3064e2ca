//! Block verification pipeline
//!
//! Stateless per call: everything the verdict depends on is reconstructed
//! from the chain as of the candidate's parent. Policy and structural
//! failures become `BlockVerdict::Invalid` with a logged reason — a bad
//! block must never crash validation. Only an oracle outage propagates as
//! an error, because "could not check" is not "invalid".

use crate::certificate::{CertificateError, ConsensusPayload, WaitCertificate};
use crate::chain::{BlockRef, BlockSource};
use crate::config::PoetConfigView;
use crate::enclave::EnclaveOracle;
use crate::registry::RegistryView;
use crate::state::{previous_certificate_id, ConsensusStateCache, StateError};
use crate::types::short_id;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VerifierError {
    /// The oracle could not be reached. Retry the block later; do not
    /// reject it.
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The ancestor chain needed to rebuild consensus state is incomplete
    /// locally. Retry once the journal has caught up.
    #[error("chain state unavailable: {0}")]
    ChainIncomplete(String),
}

/// Outcome of verifying one candidate block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    Valid,
    Invalid { reason: String },
}

impl BlockVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, BlockVerdict::Valid)
    }
}

/// Verifies candidate blocks claimed by peers.
pub struct BlockVerifier<'a> {
    chain: &'a dyn BlockSource,
    registry: &'a dyn RegistryView,
    enclave: &'a dyn EnclaveOracle,
    state_cache: &'a ConsensusStateCache,
}

impl<'a> BlockVerifier<'a> {
    pub fn new(
        chain: &'a dyn BlockSource,
        registry: &'a dyn RegistryView,
        enclave: &'a dyn EnclaveOracle,
        state_cache: &'a ConsensusStateCache,
    ) -> Self {
        Self {
            chain,
            registry,
            enclave,
            state_cache,
        }
    }

    /// Run the full acceptance pipeline on a candidate block.
    pub fn verify_block(
        &self,
        block: &BlockRef,
        config: &PoetConfigView,
    ) -> Result<BlockVerdict, VerifierError> {
        // 1. The claimant must be registered as of the parent state.
        let Some(validator_info) = self
            .registry
            .validator_info(&block.previous_block_id, &block.signer_id)
        else {
            return invalid(block, "claimant is not a registered validator");
        };

        // 2. Rebuild consensus state as of the parent and resolve the
        //    certificate the chain expects this block to link to.
        let consensus_state = self
            .state_cache
            .state_for_block(
                &block.previous_block_id,
                self.chain,
                self.registry,
                self.enclave,
                config,
            )
            .map_err(map_state_error)?;
        let expected_previous_id =
            previous_certificate_id(self.enclave, self.chain, &block.previous_block_id)
                .map_err(map_state_error)?;

        // 3. The embedded certificate must be present and well formed.
        if block.consensus.is_empty() {
            return invalid(block, "block carries no wait certificate");
        }
        let payload = match ConsensusPayload::decode(&block.consensus) {
            Ok(payload) => payload,
            Err(e) => return invalid(block, &e.to_string()),
        };
        let certificate = match WaitCertificate::from_payload(self.enclave, &payload) {
            Ok(certificate) => certificate,
            Err(CertificateError::Enclave(e)) if e.is_retryable() => {
                return Err(VerifierError::OracleUnavailable(e.to_string()))
            }
            Err(e) => return invalid(block, &e.to_string()),
        };

        // A certificate is only good for the exact block content it
        // committed to.
        if certificate.block_hash != block.content_hash {
            return invalid(block, "wait certificate not bound to this block");
        }

        // 4. Chain position, local mean, and the elapsed-time proof.
        match certificate.check_valid(
            self.enclave,
            expected_previous_id,
            &validator_info.poet_public_key,
            &consensus_state,
            config,
        ) {
            Ok(()) => {}
            Err(CertificateError::Enclave(e)) if e.is_retryable() => {
                return Err(VerifierError::OracleUnavailable(e.to_string()))
            }
            Err(e) => return invalid(block, &e.to_string()),
        }

        // 5. The active key must not be past its claim limit.
        if consensus_state.validator_has_claimed_block_limit(&validator_info, config) {
            return invalid(block, "key block claim limit reached");
        }

        // 6. The registration must have aged past the claim delay.
        let registered_validators = self.registry.validator_count(&block.previous_block_id);
        if consensus_state.validator_is_claiming_too_early(
            &validator_info,
            block.block_num,
            registered_validators,
            config,
        ) {
            return invalid(block, "claiming too soon after registration");
        }

        // 7. The claimant must not be winning more often than chance allows.
        if consensus_state.validator_is_claiming_too_frequently(
            &validator_info,
            certificate.population_estimate(config),
            config,
        ) {
            return invalid(block, "claiming more frequently than expected");
        }

        debug!(block = %short_id(&block.block_id), "block accepted");
        Ok(BlockVerdict::Valid)
    }
}

fn invalid(block: &BlockRef, reason: &str) -> Result<BlockVerdict, VerifierError> {
    info!(
        block = %short_id(&block.block_id),
        claimant = %short_id(&block.signer_id),
        reason,
        "rejecting block"
    );
    Ok(BlockVerdict::Invalid {
        reason: reason.to_string(),
    })
}

/// State reconstruction failures: a transient oracle condition stays
/// retryable, a locally missing ancestor asks the caller to sync, anything
/// else means the committed chain itself is bad.
fn map_state_error(error: StateError) -> VerifierError {
    match error {
        StateError::Certificate(CertificateError::Enclave(e)) if e.is_retryable() => {
            VerifierError::OracleUnavailable(e.to_string())
        }
        other => VerifierError::ChainIncomplete(other.to_string()),
    }
}
