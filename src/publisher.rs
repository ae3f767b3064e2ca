//! Block publisher — the claiming side
//!
//! Drives one claim attempt at a time: verify our own registration and
//! active key (failing closed if either is unusable), create a wait timer,
//! let the caller poll for expiry, and finalize by embedding the wait
//! certificate. Waiting is always caller-driven — there is no sleep in
//! here, so the publisher stays responsive to chain-head changes and can
//! discard an in-flight timer the moment its parent is abandoned.
//!
//! Registration itself is out-of-band: enrollment produces a
//! [`RegistrationPayload`] the embedding layer must submit to the validator
//! registry.

use crate::certificate::WaitCertificate;
use crate::chain::BlockSource;
use crate::config::PoetConfigView;
use crate::crypto::PublicKey;
use crate::enclave::{Clock, EnclaveError, EnclaveOracle};
use crate::keystate::{KeyState, KeyStateError, KeyStateStore};
use crate::registry::RegistryView;
use crate::state::{previous_certificate_id, ConsensusStateCache, StateError};
use crate::timer::{ClaimPhase, WaitTimer};
use crate::types::{short_id, BlockId, Hash, ValidatorId, NULL_BLOCK_ID};
use sha3::{Digest, Sha3_256};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Enclave(#[from] EnclaveError),

    #[error(transparent)]
    KeyState(#[from] KeyStateError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("no claim in flight for this block")]
    NoClaimInFlight,
}

/// Registry transaction content produced at enrollment, submitted
/// out-of-band.
#[derive(Debug, Clone)]
pub struct RegistrationPayload {
    pub name: String,
    pub id: ValidatorId,
    pub poet_public_key: PublicKey,
    pub proof_data: String,
    pub anti_sybil_id: String,
    pub nonce: String,
}

/// Outcome of a claim-attempt initialization.
#[derive(Debug)]
pub enum InitializeOutcome {
    /// A wait timer is armed; build the candidate and poll for expiry.
    Ready,
    /// This validator cannot claim on this parent right now. If enrollment
    /// was (re-)attempted, the registration payload needs submitting.
    Declined {
        reason: String,
        registration: Option<RegistrationPayload>,
    },
}

struct ClaimAttempt {
    phase: ClaimPhase,
    parent_block_id: BlockId,
}

/// Claiming-side consensus driver for one local validator.
pub struct PoetBlockPublisher {
    chain: Arc<dyn BlockSource>,
    registry: Arc<dyn RegistryView>,
    enclave: Arc<dyn EnclaveOracle>,
    state_cache: Arc<ConsensusStateCache>,
    key_store: Arc<KeyStateStore>,
    clock: Arc<dyn Clock>,
    validator_id: ValidatorId,
    validator_name: String,
    claim: Mutex<Option<ClaimAttempt>>,
    /// Parent we already declined on; short-circuits repeat attempts until
    /// the chain head moves
    declined_parent: Mutex<Option<BlockId>>,
}

impl PoetBlockPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn BlockSource>,
        registry: Arc<dyn RegistryView>,
        enclave: Arc<dyn EnclaveOracle>,
        state_cache: Arc<ConsensusStateCache>,
        key_store: Arc<KeyStateStore>,
        clock: Arc<dyn Clock>,
        validator_id: ValidatorId,
    ) -> Self {
        let validator_name = format!("validator-{}", short_id(&validator_id));
        Self {
            chain,
            registry,
            enclave,
            state_cache,
            key_store,
            clock,
            validator_id,
            validator_name,
            claim: Mutex::new(None),
            declined_parent: Mutex::new(None),
        }
    }

    /// The timer backing the current claim attempt, if one is outstanding.
    pub fn pending_timer(&self) -> Option<WaitTimer> {
        self.claim
            .lock()
            .expect("claim lock")
            .as_ref()
            .and_then(|attempt| attempt.phase.timer().cloned())
    }

    /// Start a claim attempt for the block that would extend
    /// `parent_block_id` at height `block_num`.
    pub fn initialize_block(
        &self,
        parent_block_id: &BlockId,
        block_num: u64,
        config: &PoetConfigView,
    ) -> Result<InitializeOutcome, PublishError> {
        // A repeat attempt on a parent we already declined cannot succeed
        // until the chain head moves; skip the rework.
        if *self.declined_parent.lock().expect("declined lock") == Some(*parent_block_id) {
            return Ok(self.declined(parent_block_id, "already declined on this parent", None));
        }

        let validator_info = self
            .registry
            .validator_info(parent_block_id, &self.validator_id);
        let active_key = self.key_store.active_key()?;

        // Not in the registry yet: enroll, or wait for a pending
        // registration to commit.
        let Some(validator_info) = validator_info else {
            return match active_key {
                None => {
                    debug!("no registry entry and no active key; enrolling");
                    let registration = self.register_signup_information(parent_block_id)?;
                    Ok(self.declined(
                        parent_block_id,
                        "not yet registered; signup submitted",
                        Some(registration),
                    ))
                }
                Some(active) => {
                    let nonce = match self.key_store.get(&active) {
                        Ok(state) => state.signup_nonce,
                        Err(e) => {
                            warn!(error = %e, "active key state unreadable; clearing");
                            self.key_store.set_active_key(None)?;
                            return Ok(self.declined(
                                parent_block_id,
                                "active key state was corrupt",
                                None,
                            ));
                        }
                    };
                    self.retry_stalled_registration(parent_block_id, &active, &nonce, config)
                }
            };
        };

        // The registry names a PoET key; we must hold its sealed data.
        let poet_key_state = self.key_store.get(&validator_info.poet_public_key);
        let poet_key_state = match poet_key_state {
            Ok(state) => state,
            Err(KeyStateError::NotFound) => {
                // No way to publish blocks the network would accept under
                // that key. Enroll again, and remember the orphaned key as
                // refreshed so we do not loop.
                info!(
                    poet_public_key = %validator_info.poet_public_key,
                    "registry key has no local state; enrolling again"
                );
                let registration = self.register_signup_information(parent_block_id)?;
                self.key_store.put(
                    &validator_info.poet_public_key,
                    &KeyState {
                        sealed_signup_data: crate::keystate::placeholder_sealed_data(),
                        has_been_refreshed: true,
                        signup_nonce: "unknown".into(),
                    },
                )?;
                return Ok(self.declined(
                    parent_block_id,
                    "no sealed data for registered key; signup submitted",
                    Some(registration),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        // A refreshed key is spent; wait for the replacement registration
        // to surface, or re-enroll if it stalled.
        if poet_key_state.has_been_refreshed {
            debug!(
                poet_public_key = %validator_info.poet_public_key,
                "key refreshed; waiting for replacement registration"
            );
            if let Some(active) = &active_key {
                let nonce = self.key_store.get(active)?.signup_nonce;
                return self.retry_stalled_registration(parent_block_id, active, &nonce, config);
            }
            return Ok(self.declined(parent_block_id, "key refreshed, none active", None));
        }

        // Adopt the registry's view of our key if we drifted.
        if active_key != Some(validator_info.poet_public_key) {
            self.key_store
                .set_active_key(Some(&validator_info.poet_public_key))?;
        }

        // The sealed data must actually unseal to the registered key.
        match self
            .enclave
            .unseal_signup_data(&poet_key_state.sealed_signup_data)
        {
            Ok(unsealed) if unsealed == validator_info.poet_public_key => {}
            Ok(_) | Err(EnclaveError::Malformed(_)) => {
                error!(
                    poet_public_key = %validator_info.poet_public_key,
                    "sealed signup data does not match registered key; clearing active key"
                );
                self.key_store.set_active_key(None)?;
                return Ok(self.declined(parent_block_id, "sealed signup data unusable", None));
            }
            Err(e) => return Err(e.into()),
        }

        let consensus_state = self.state_cache.state_for_block(
            parent_block_id,
            self.chain.as_ref(),
            self.registry.as_ref(),
            self.enclave.as_ref(),
            config,
        )?;

        // Fail closed on an exhausted key: mark it refreshed, release the
        // enclave resources, and enroll a replacement.
        if consensus_state.validator_has_claimed_block_limit(&validator_info, config) {
            let mut registration = None;
            if !poet_key_state.has_been_refreshed {
                info!(
                    poet_public_key = %validator_info.poet_public_key,
                    "key block claim limit reached; refreshing signup"
                );
                self.key_store.put(
                    &validator_info.poet_public_key,
                    &KeyState {
                        has_been_refreshed: true,
                        ..poet_key_state.clone()
                    },
                )?;
                // Spent on every fork once refreshed, even if a rollback
                // would put it back under the limit.
                self.enclave
                    .release_signup_data(&poet_key_state.sealed_signup_data)?;
                registration = Some(self.register_signup_information(parent_block_id)?);
            }
            return Ok(self.declined(
                parent_block_id,
                "key block claim limit reached",
                registration,
            ));
        }

        // Peers would reject an early claim; do not bother arming a timer.
        let registered_validators = self.registry.validator_count(parent_block_id);
        if consensus_state.validator_is_claiming_too_early(
            &validator_info,
            block_num,
            registered_validators,
            config,
        ) {
            return Ok(self.declined(
                parent_block_id,
                "claim delay not yet satisfied",
                None,
            ));
        }

        let previous_certificate_id =
            previous_certificate_id(self.enclave.as_ref(), self.chain.as_ref(), parent_block_id)?;
        let timer = WaitTimer::create(
            self.enclave.as_ref(),
            Some(&poet_key_state.sealed_signup_data),
            &self.validator_id,
            previous_certificate_id,
            &consensus_state,
            config,
        )?;

        // The zTest needs the timer's population estimate, so it runs after
        // timer creation; a block we would win too frequently is abandoned
        // before anyone waits on it.
        if consensus_state.validator_is_claiming_too_frequently(
            &validator_info,
            timer.population_estimate(config),
            config,
        ) {
            return Ok(self.declined(
                parent_block_id,
                "winning more frequently than expected",
                None,
            ));
        }

        debug!(parent = %short_id(parent_block_id), timer = %timer, "claim attempt armed");
        *self.claim.lock().expect("claim lock") = Some(ClaimAttempt {
            phase: ClaimPhase::start(timer),
            parent_block_id: *parent_block_id,
        });
        *self.declined_parent.lock().expect("declined lock") = None;
        Ok(InitializeOutcome::Ready)
    }

    /// Non-blocking expiry poll for the claim attempt on `parent_block_id`.
    pub fn check_publish_block(&self, parent_block_id: &BlockId) -> bool {
        let mut claim = self.claim.lock().expect("claim lock");
        match claim.as_mut() {
            Some(attempt) if attempt.parent_block_id == *parent_block_id => {
                attempt.phase.poll_expired(self.clock.now())
            }
            _ => false,
        }
    }

    /// The chain head moved. An in-flight timer for any other parent is
    /// stale consensus state: discard it rather than reuse it.
    pub fn on_chain_head_changed(&self, new_head: &BlockId) {
        let mut claim = self.claim.lock().expect("claim lock");
        if let Some(attempt) = claim.as_mut() {
            if attempt.parent_block_id != *new_head && !attempt.phase.is_terminal() {
                info!(
                    old_parent = %short_id(&attempt.parent_block_id),
                    new_head = %short_id(new_head),
                    "chain head changed; discarding in-flight wait timer"
                );
                attempt.phase.discard();
            }
        }
        *self.declined_parent.lock().expect("declined lock") = None;
    }

    /// Abandon the current claim attempt outright.
    pub fn cancel_block(&self) {
        if let Some(attempt) = self.claim.lock().expect("claim lock").as_mut() {
            attempt.phase.discard();
        }
    }

    /// Create the wait certificate for the finalized block content and
    /// complete the attempt. The certificate payload goes into the block's
    /// consensus field.
    pub fn finalize_block(&self, content_hash: &Hash) -> Result<WaitCertificate, PublishError> {
        let mut claim = self.claim.lock().expect("claim lock");
        let attempt = claim.as_mut().ok_or(PublishError::NoClaimInFlight)?;
        let timer = attempt
            .phase
            .timer()
            .cloned()
            .ok_or(PublishError::NoClaimInFlight)?;

        let active_key = self
            .key_store
            .active_key()?
            .ok_or(EnclaveError::NotEnrolled)?;
        let sealed = self.key_store.get(&active_key)?.sealed_signup_data;

        let certificate =
            WaitCertificate::create(self.enclave.as_ref(), &sealed, &timer, content_hash)?;
        attempt.phase.mark_issued(certificate.identifier);

        debug!(certificate = %certificate, "created wait certificate");
        Ok(certificate)
    }

    /// Create fresh signup information, persist its key state, make it the
    /// active key, and hand back the registration for submission.
    fn register_signup_information(
        &self,
        parent_block_id: &BlockId,
    ) -> Result<RegistrationPayload, PublishError> {
        let originator_hash: Hash = Sha3_256::digest(self.validator_id).into();
        let nonce = nonce_from_block_id(parent_block_id);
        let signup_info = self.enclave.create_signup_info(&originator_hash, &nonce)?;

        info!(
            name = %self.validator_name,
            poet_public_key = %signup_info.poet_public_key,
            nonce = %nonce,
            "registering validator signup information"
        );

        self.key_store.put(
            &signup_info.poet_public_key,
            &KeyState {
                sealed_signup_data: signup_info.sealed_signup_data.clone(),
                has_been_refreshed: false,
                signup_nonce: nonce.clone(),
            },
        )?;
        self.key_store
            .set_active_key(Some(&signup_info.poet_public_key))?;

        Ok(RegistrationPayload {
            name: self.validator_name.clone(),
            id: self.validator_id,
            poet_public_key: signup_info.poet_public_key,
            proof_data: signup_info.proof_data,
            anti_sybil_id: signup_info.anti_sybil_id,
            nonce,
        })
    }

    /// A registration is outstanding. If it has been pending longer than
    /// the commit window, give up on it and enroll afresh.
    fn retry_stalled_registration(
        &self,
        parent_block_id: &BlockId,
        active_key: &PublicKey,
        signup_nonce: &str,
        config: &PoetConfigView,
    ) -> Result<InitializeOutcome, PublishError> {
        if self.signup_attempt_timed_out(signup_nonce, parent_block_id, config) {
            warn!(
                poet_public_key = %active_key,
                "registration never committed; enrolling again"
            );
            self.key_store.remove(active_key)?;
            let registration = self.register_signup_information(parent_block_id)?;
            return Ok(self.declined(
                parent_block_id,
                "stalled registration replaced",
                Some(registration),
            ));
        }
        Ok(self.declined(parent_block_id, "registration still pending", None))
    }

    /// True once the chain has advanced past the signup commit window
    /// without the enrollment nonce appearing in recent ancestry.
    fn signup_attempt_timed_out(
        &self,
        signup_nonce: &str,
        chain_head: &BlockId,
        config: &PoetConfigView,
    ) -> bool {
        let mut current = *chain_head;
        for _ in 0..=config.signup_commit_maximum_delay {
            if nonce_from_block_id(&current) == signup_nonce {
                return false;
            }
            if current == NULL_BLOCK_ID {
                return true;
            }
            match self.chain.block(&current) {
                Some(block) => current = block.previous_block_id,
                None => return true,
            }
        }
        true
    }

    fn declined(
        &self,
        parent_block_id: &BlockId,
        reason: &str,
        registration: Option<RegistrationPayload>,
    ) -> InitializeOutcome {
        debug!(
            parent = %short_id(parent_block_id),
            reason,
            "declining to claim"
        );
        *self.declined_parent.lock().expect("declined lock") = Some(*parent_block_id);
        InitializeOutcome::Declined {
            reason: reason.to_string(),
            registration,
        }
    }
}

/// Enrollment freshness nonce derived from a block id.
pub fn nonce_from_block_id(block_id: &BlockId) -> String {
    hex::encode(&block_id[..8])
}
