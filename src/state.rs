//! Consensus state
//!
//! Everything a validator needs to know about claim history is re-derived
//! from the certificate chain itself: chain-wide claim totals, per-validator
//! claim counts under the current and all keys, and the sliding sample
//! window behind population estimation and the win-frequency test.
//!
//! State is a pure function of a block's ancestor chain. It never reads the
//! wall clock or anything off-chain, so two validators replaying the same
//! chain always agree, and distinct forks produce distinct states. The
//! [`ConsensusStateCache`] memoizes replay per block id — fork safety falls
//! out of the keying, since two forks never share a block id.

use crate::certificate::{CertificateError, ConsensusPayload, WaitCertificate};
use crate::chain::BlockSource;
use crate::config::PoetConfigView;
use crate::crypto::PublicKey;
use crate::enclave::EnclaveOracle;
use crate::registry::{RegistryView, ValidatorInfo};
use crate::types::{short_id, BlockId, CertificateId, ValidatorId, NULL_BLOCK_ID};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("block {0} not found while rebuilding consensus state")]
    MissingBlock(String),

    #[error("validator {0} not registered at block {1}")]
    UnregisteredClaimant(String, String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// One committed certificate's contribution to population estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopulationSample {
    pub duration: f64,
    pub local_mean: f64,
}

/// Per-validator claim statistics at a point in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorState {
    /// Blocks claimed with the current PoET key
    pub key_block_claim_count: u64,
    /// The PoET key those claims were made under
    pub poet_public_key: PublicKey,
    /// Blocks claimed across all keys
    pub total_block_claim_count: u64,
    /// Block in which the current registration committed
    pub commit_block_number: u64,
}

/// Estimates the active validator population from the sample window.
pub trait PopulationEstimator: Send + Sync {
    fn estimate(&self, samples: &VecDeque<PopulationSample>, config: &PoetConfigView) -> f64;
}

/// Arithmetic mean of per-certificate `local_mean / target_wait_time`.
/// Keeps every validator's expectation identical to the one embedded in
/// the certificates themselves.
#[derive(Debug, Default)]
pub struct MeanRatioEstimator;

impl PopulationEstimator for MeanRatioEstimator {
    fn estimate(&self, samples: &VecDeque<PopulationSample>, config: &PoetConfigView) -> f64 {
        if samples.is_empty() {
            return 1.0;
        }
        let sum: f64 = samples
            .iter()
            .map(|s| s.local_mean / config.target_wait_time)
            .sum();
        sum / samples.len() as f64
    }
}

/// Minimum-of-exponentials estimator: the winning duration over a
/// population of N exponential waits is itself exponential with mean 1/N of
/// the local mean, so `Σ means / Σ (duration − min_wait)` recovers N.
/// Provided for compatibility with networks that size timers from actual
/// win durations.
#[derive(Debug, Default)]
pub struct MinExponentialEstimator;

impl PopulationEstimator for MinExponentialEstimator {
    fn estimate(&self, samples: &VecDeque<PopulationSample>, config: &PoetConfigView) -> f64 {
        let sum_means: f64 = samples.iter().map(|s| s.local_mean).sum();
        let sum_waits: f64 = samples
            .iter()
            .map(|s| s.duration - config.minimum_wait_time)
            .sum();
        if sum_waits <= 0.0 {
            return samples.len().max(1) as f64;
        }
        sum_means / sum_waits
    }
}

/// Deterministic claim statistics for one point in the chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Blocks claimed by all validators since the last non-PoET block
    total_block_claim_count: u64,
    /// Most recent certificates, oldest first, capped at the sample size
    population_samples: VecDeque<PopulationSample>,
    /// Claimants of the most recent blocks, oldest first, same cap
    win_history: VecDeque<ValidatorId>,
    validators: HashMap<ValidatorId, ValidatorState>,
}

impl ConsensusState {
    pub fn total_block_claim_count(&self) -> u64 {
        self.total_block_claim_count
    }

    pub fn population_samples(&self) -> &VecDeque<PopulationSample> {
        &self.population_samples
    }

    /// The expected wait for the next timer, from the ratio ramp while
    /// bootstrapping and from the population estimate afterwards.
    pub fn compute_local_mean(&self, config: &PoetConfigView) -> f64 {
        self.compute_local_mean_with(&MeanRatioEstimator, config)
    }

    pub fn compute_local_mean_with(
        &self,
        estimator: &dyn PopulationEstimator,
        config: &PoetConfigView,
    ) -> f64 {
        let sample_size = config.population_estimate_sample_size;
        let count = self.population_samples.len();
        if count < sample_size {
            let ratio = count as f64 / sample_size as f64;
            config.target_wait_time * (1.0 - ratio * ratio)
                + config.initial_wait_time * ratio * ratio
        } else {
            config.target_wait_time * estimator.estimate(&self.population_samples, config)
        }
    }

    /// Record a certificate's duration and mean in the sample window.
    pub fn observe_sample(&mut self, duration: f64, local_mean: f64, config: &PoetConfigView) {
        self.population_samples.push_back(PopulationSample {
            duration,
            local_mean,
        });
        while self.population_samples.len() > config.population_estimate_sample_size {
            self.population_samples.pop_front();
        }
    }

    /// The recorded state for a validator, or its starting state derived
    /// from the registry entry if it has never claimed.
    pub fn get_validator_state(&self, validator_info: &ValidatorInfo) -> ValidatorState {
        self.validators
            .get(&validator_info.id)
            .cloned()
            .unwrap_or(ValidatorState {
                key_block_claim_count: 0,
                poet_public_key: validator_info.poet_public_key,
                total_block_claim_count: 0,
                commit_block_number: validator_info.commit_block_num,
            })
    }

    /// Apply one committed claim to the statistics.
    pub fn validator_did_claim_block(
        &mut self,
        validator_info: &ValidatorInfo,
        certificate: &WaitCertificate,
        config: &PoetConfigView,
    ) {
        self.total_block_claim_count += 1;
        self.observe_sample(certificate.duration, certificate.local_mean, config);

        self.win_history.push_back(validator_info.id);
        while self.win_history.len() > config.population_estimate_sample_size {
            self.win_history.pop_front();
        }

        let previous = self.validators.get(&validator_info.id);
        let total_block_claim_count =
            previous.map(|v| v.total_block_claim_count).unwrap_or(0) + 1;

        // Same key: plain increment. New key: the claim count restarts and
        // the registration commit point rolls forward.
        let (key_block_claim_count, commit_block_number) = match previous {
            Some(v) if v.poet_public_key == validator_info.poet_public_key => {
                (v.key_block_claim_count + 1, v.commit_block_number)
            }
            _ => (1, validator_info.commit_block_num),
        };

        debug!(
            validator = %validator_info.name,
            poet_public_key = %validator_info.poet_public_key,
            key_block_claim_count,
            total_block_claim_count,
            "updated claim statistics"
        );

        self.validators.insert(
            validator_info.id,
            ValidatorState {
                key_block_claim_count,
                poet_public_key: validator_info.poet_public_key,
                total_block_claim_count,
                commit_block_number,
            },
        );
    }

    /// Has the validator exhausted its current key?
    pub fn validator_has_claimed_block_limit(
        &self,
        validator_info: &ValidatorInfo,
        config: &PoetConfigView,
    ) -> bool {
        let state = self.get_validator_state(validator_info);
        if state.poet_public_key != validator_info.poet_public_key {
            // Claims so far were under an older key; the new key is fresh
            return false;
        }
        if state.key_block_claim_count >= config.key_block_claim_limit {
            info!(
                validator = %validator_info.name,
                claimed = state.key_block_claim_count,
                limit = config.key_block_claim_limit,
                "validator reached block claim limit for current key"
            );
            return true;
        }
        false
    }

    /// Is the validator claiming before its registration has aged the
    /// required number of blocks?
    ///
    /// The delay is capped at one less than the number of registered
    /// validators (with more delay than that, a full rotation of key
    /// refreshes would deadlock the network), and skipped entirely while
    /// the chain is younger than the capped delay.
    pub fn validator_is_claiming_too_early(
        &self,
        validator_info: &ValidatorInfo,
        block_num: u64,
        registered_validators: usize,
        config: &PoetConfigView,
    ) -> bool {
        let claim_delay = config
            .block_claim_delay
            .min((registered_validators as u64).saturating_sub(1));

        if self.total_block_claim_count < claim_delay {
            debug!(
                chain_length = self.total_block_claim_count,
                claim_delay, "skipping block claim delay check on young chain"
            );
            return false;
        }

        let state = self.get_validator_state(validator_info);
        let blocks_since_commit = block_num
            .saturating_sub(state.commit_block_number)
            .saturating_sub(1);

        if blocks_since_commit < claim_delay {
            info!(
                validator = %validator_info.name,
                committed = state.commit_block_number,
                claiming = block_num,
                claim_delay,
                "validator claiming too soon after registration"
            );
            return true;
        }
        false
    }

    /// One-sample z-test on the validator's win frequency over the sample
    /// window. Skipped while the chain or the validator's win count is too
    /// short to be meaningful.
    pub fn validator_is_claiming_too_frequently(
        &self,
        validator_info: &ValidatorInfo,
        population_estimate: f64,
        config: &PoetConfigView,
    ) -> bool {
        if self.total_block_claim_count < config.population_estimate_sample_size as u64 {
            return false;
        }

        let observed = self
            .win_history
            .iter()
            .filter(|id| **id == validator_info.id)
            .count() as u64;
        if observed < config.ztest_minimum_win_count {
            return false;
        }

        // A population of one wins every block by construction
        if population_estimate <= 1.0 {
            return false;
        }

        let n = self.win_history.len() as f64;
        let p = 1.0 / population_estimate;
        let expected = n * p;
        let standard_deviation = (n * p * (1.0 - p)).sqrt();
        let z_score = (observed as f64 - expected) / standard_deviation;

        if z_score > config.ztest_maximum_win_deviation {
            info!(
                validator = %validator_info.name,
                observed,
                expected,
                z_score,
                "zTest failed: validator winning more frequently than expected"
            );
            return true;
        }

        debug!(validator = %validator_info.name, observed, expected, z_score, "zTest passed");
        false
    }
}

/// The certificate identifier the next block built on `parent_block_id`
/// must link to: the parent's certificate identifier, or the null id at
/// genesis or on top of a non-PoET block.
pub fn previous_certificate_id(
    enclave: &dyn EnclaveOracle,
    chain: &dyn BlockSource,
    parent_block_id: &BlockId,
) -> Result<CertificateId, StateError> {
    if *parent_block_id == NULL_BLOCK_ID {
        return Ok(CertificateId::NULL);
    }
    let block = chain
        .block(parent_block_id)
        .ok_or_else(|| StateError::MissingBlock(short_id(parent_block_id)))?;
    if block.consensus.is_empty() {
        return Ok(CertificateId::NULL);
    }
    let payload = ConsensusPayload::decode(&block.consensus)?;
    let certificate = WaitCertificate::from_payload(enclave, &payload)?;
    Ok(certificate.identifier)
}

/// Replay memoization keyed by block id.
pub struct ConsensusStateCache {
    cache: Mutex<LruCache<BlockId, ConsensusState>>,
}

impl ConsensusStateCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Consensus state as of `block_id` (i.e., after that block committed),
    /// rebuilding from the nearest cached ancestor or from genesis.
    pub fn state_for_block(
        &self,
        block_id: &BlockId,
        chain: &dyn BlockSource,
        registry: &dyn RegistryView,
        enclave: &dyn EnclaveOracle,
        config: &PoetConfigView,
    ) -> Result<ConsensusState, StateError> {
        // Walk backward collecting replay inputs until a cached state, a
        // non-PoET stretch, or genesis terminates the walk.
        let mut pending: Vec<(BlockId, Option<(WaitCertificate, ValidatorInfo)>)> = Vec::new();
        let mut state = ConsensusState::default();
        let mut current = *block_id;

        while current != NULL_BLOCK_ID {
            if let Some(cached) = self.cache.lock().expect("state cache lock").get(&current) {
                state = cached.clone();
                break;
            }

            let block = chain
                .block(&current)
                .ok_or_else(|| StateError::MissingBlock(short_id(&current)))?;

            if block.consensus.is_empty() {
                // Claimed under another consensus: statistics restart here
                pending.push((current, None));
            } else {
                let payload = ConsensusPayload::decode(&block.consensus)?;
                let certificate = WaitCertificate::from_payload(enclave, &payload)?;
                let validator_info = registry
                    .validator_info(&block.block_id, &block.signer_id)
                    .ok_or_else(|| {
                        StateError::UnregisteredClaimant(
                            short_id(&block.signer_id),
                            short_id(&block.block_id),
                        )
                    })?;
                debug!(
                    block = %short_id(&current),
                    "rebuilding consensus state"
                );
                pending.push((current, Some((certificate, validator_info))));
            }

            current = block.previous_block_id;
        }

        // Replay oldest to newest on top of the checkpoint state.
        for (replay_block_id, entry) in pending.into_iter().rev() {
            match entry {
                None => state = ConsensusState::default(),
                Some((certificate, validator_info)) => {
                    state.validator_did_claim_block(&validator_info, &certificate, config);
                    self.cache
                        .lock()
                        .expect("state cache lock")
                        .put(replay_block_id, state.clone());
                }
            }
        }

        Ok(state)
    }
}
