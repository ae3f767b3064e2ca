//! Wait timers and the claim lifecycle
//!
//! A wait timer is the in-progress claim ticket: a randomized duration the
//! oracle drew around the local mean. One timer backs at most one
//! certificate, and expiry is always judged against the oracle-held values
//! — the public field copies here are informational.
//!
//! The lifecycle of a claim attempt is the explicit [`ClaimPhase`] machine:
//!
//! ```text
//! Idle -> TimerPending -> Expired -> CertificateIssued
//!            |               |
//!            +---------------+--> Discarded   (fork switch / abandonment)
//! ```

use crate::config::PoetConfigView;
use crate::enclave::{EnclaveError, EnclaveOracle, EnclaveWaitTimer};
use crate::state::ConsensusState;
use crate::types::{short_id, CertificateId, ValidatorId};
use tracing::debug;

/// One randomized wait, one claim attempt.
#[derive(Debug, Clone)]
pub struct WaitTimer {
    pub validator_id: ValidatorId,
    pub previous_certificate_id: CertificateId,
    pub local_mean: f64,
    pub request_time: f64,
    pub duration: f64,
    /// Oracle-held truth; expiry decisions use this, never the copies above.
    enclave_timer: EnclaveWaitTimer,
}

impl WaitTimer {
    /// Ask the oracle for a timer built on the consensus state as of the
    /// block being extended. Fails with [`EnclaveError::NotEnrolled`] when
    /// no sealed key material exists.
    pub fn create(
        enclave: &dyn EnclaveOracle,
        sealed_signup_data: Option<&str>,
        validator_id: &ValidatorId,
        previous_certificate_id: CertificateId,
        consensus_state: &ConsensusState,
        config: &PoetConfigView,
    ) -> Result<WaitTimer, EnclaveError> {
        let sealed = sealed_signup_data.ok_or(EnclaveError::NotEnrolled)?;
        let local_mean = consensus_state.compute_local_mean(config);

        let enclave_timer =
            enclave.create_wait_timer(sealed, validator_id, previous_certificate_id, local_mean)?;

        debug!(
            validator = %short_id(validator_id),
            local_mean,
            duration = enclave_timer.duration,
            previous = %previous_certificate_id,
            "created wait timer"
        );

        Ok(WaitTimer {
            validator_id: *validator_id,
            previous_certificate_id,
            local_mean: enclave_timer.local_mean,
            request_time: enclave_timer.request_time,
            duration: enclave_timer.duration,
            enclave_timer,
        })
    }

    /// The population size this timer's local mean implies.
    pub fn population_estimate(&self, config: &PoetConfigView) -> f64 {
        self.local_mean / config.target_wait_time
    }

    /// True once `now - request_time >= duration`, judged on the
    /// oracle-held values.
    pub fn has_expired(&self, now: f64) -> bool {
        self.enclave_timer.has_expired(now)
    }

    pub(crate) fn enclave_timer(&self) -> &EnclaveWaitTimer {
        &self.enclave_timer
    }
}

impl std::fmt::Display for WaitTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TIMER, {:.2}, {:.2}, {}",
            self.local_mean, self.duration, self.previous_certificate_id
        )
    }
}

/// Lifecycle of one claim attempt.
#[derive(Debug, Clone, Default)]
pub enum ClaimPhase {
    /// No claim in flight
    #[default]
    Idle,
    /// Waiting out the randomized duration
    TimerPending(WaitTimer),
    /// Duration elapsed; certificate may be created
    Expired(WaitTimer),
    /// Certificate created and embedded; attempt complete
    CertificateIssued(CertificateId),
    /// Abandoned (chain head moved, fork switch). No certificate may ever
    /// be created from this attempt.
    Discarded,
}

impl ClaimPhase {
    pub fn start(timer: WaitTimer) -> Self {
        ClaimPhase::TimerPending(timer)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClaimPhase::CertificateIssued(_) | ClaimPhase::Discarded
        )
    }

    /// The timer backing this attempt, while one is outstanding.
    pub fn timer(&self) -> Option<&WaitTimer> {
        match self {
            ClaimPhase::TimerPending(t) | ClaimPhase::Expired(t) => Some(t),
            _ => None,
        }
    }

    /// Non-blocking poll: advance `TimerPending` to `Expired` once the
    /// duration has elapsed. Returns true when the attempt is in `Expired`.
    pub fn poll_expired(&mut self, now: f64) -> bool {
        if let ClaimPhase::TimerPending(timer) = self {
            if timer.has_expired(now) {
                let timer = timer.clone();
                *self = ClaimPhase::Expired(timer);
            }
        }
        matches!(self, ClaimPhase::Expired(_))
    }

    /// Abandon the attempt from any non-terminal phase.
    pub fn discard(&mut self) {
        if !self.is_terminal() {
            *self = ClaimPhase::Discarded;
        }
    }

    /// Record the certificate created from this attempt's timer.
    pub fn mark_issued(&mut self, certificate_id: CertificateId) {
        *self = ClaimPhase::CertificateIssued(certificate_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::simulator::PoetSimulatorEnclave;
    use crate::enclave::ManualClock;
    use std::sync::Arc;

    fn timer_fixture() -> (WaitTimer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(5000.0));
        let enclave = PoetSimulatorEnclave::with_clock(clock.clone());
        let signup = enclave.create_signup_info(&[0u8; 32], "n").unwrap();
        let timer = WaitTimer::create(
            &enclave,
            Some(&signup.sealed_signup_data),
            &[1u8; 32],
            CertificateId([2u8; 16]),
            &ConsensusState::default(),
            &PoetConfigView::default(),
        )
        .unwrap();
        (timer, clock)
    }

    #[test]
    fn test_create_requires_enrollment() {
        let enclave = PoetSimulatorEnclave::new();
        let err = WaitTimer::create(
            &enclave,
            None,
            &[1u8; 32],
            CertificateId::NULL,
            &ConsensusState::default(),
            &PoetConfigView::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EnclaveError::NotEnrolled));
    }

    #[test]
    fn test_expiry_judged_on_oracle_copy() {
        let (mut timer, _clock) = timer_fixture();
        let expiry = timer.request_time + timer.duration;

        assert!(!timer.has_expired(expiry - 0.001));
        assert!(timer.has_expired(expiry));

        // Mutating the public copies does not change the verdict
        timer.duration = 0.0;
        timer.request_time = 0.0;
        assert!(!timer.has_expired(expiry - 0.001));
        assert!(timer.has_expired(expiry));
    }

    #[test]
    fn test_claim_phase_happy_path() {
        let (timer, _clock) = timer_fixture();
        let expiry = timer.request_time + timer.duration;

        let mut phase = ClaimPhase::start(timer);
        assert!(phase.timer().is_some());
        assert!(!phase.poll_expired(expiry - 0.5));
        assert!(matches!(phase, ClaimPhase::TimerPending(_)));

        assert!(phase.poll_expired(expiry + 0.5));
        assert!(matches!(phase, ClaimPhase::Expired(_)));

        phase.mark_issued(CertificateId([9u8; 16]));
        assert!(phase.is_terminal());
        assert!(phase.timer().is_none());
    }

    #[test]
    fn test_discard_from_any_nonterminal() {
        let mut phase = ClaimPhase::Idle;
        phase.discard();
        assert!(matches!(phase, ClaimPhase::Discarded));

        let (timer, _clock) = timer_fixture();
        let mut phase = ClaimPhase::start(timer.clone());
        phase.discard();
        assert!(matches!(phase, ClaimPhase::Discarded));

        let mut phase = ClaimPhase::Expired(timer);
        phase.discard();
        assert!(matches!(phase, ClaimPhase::Discarded));

        // Terminal phases are not overwritten
        let mut phase = ClaimPhase::CertificateIssued(CertificateId([1u8; 16]));
        phase.discard();
        assert!(matches!(phase, ClaimPhase::CertificateIssued(_)));
    }

    #[test]
    fn test_population_estimate_invariant() {
        let (timer, _clock) = timer_fixture();
        let config = PoetConfigView::default();
        let estimate = timer.population_estimate(&config);
        assert!((estimate * config.target_wait_time - timer.local_mean).abs() < 1e-9);
    }
}
