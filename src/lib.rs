//! Proof of Elapsed Time consensus core
//!
//! The leader-election subsystem of a permissioned blockchain validator:
//! deciding which validator may claim the next block, and validating blocks
//! claimed by peers.
//!
//! ## Modules
//!
//! - `enclave`: the trusted-execution oracle boundary and its software simulator
//! - `timer` / `certificate`: wait timers and the wait certificates they become
//! - `state`: deterministic consensus statistics replayed from chain history
//! - `verifier` / `publisher`: the accepting and claiming pipelines
//! - `keystate`: persistence for rotating PoET key pairs
//! - `config` / `registry` / `chain`: views onto on-chain state
//!
//! ## Design Philosophy
//!
//! - **Deterministic**: consensus state is a pure function of chain history;
//!   no wall clock or off-chain input ever feeds a verdict
//! - **Fail closed, reject open**: a local configuration problem stops this
//!   validator from publishing, never from accepting peers' valid blocks
//! - **Capability seams**: the oracle, registry, block store, and settings
//!   are traits, so the consensus logic never knows what backs them

pub mod certificate;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod enclave;
pub mod keystate;
pub mod publisher;
pub mod registry;
pub mod state;
pub mod timer;
pub mod types;
pub mod verifier;

// Re-exports for convenience
pub use certificate::{CertificateError, ConsensusPayload, WaitCertificate};
pub use chain::{ancestors, block_content_hash, BlockRef, BlockSource, InMemoryBlockStore};
pub use config::{InMemorySettings, PoetConfigView, SettingsSource};
pub use crypto::{Keypair, PublicKey, SecretKey, Signature};
pub use enclave::{
    simulator::PoetSimulatorEnclave, Clock, EnclaveError, EnclaveOracle, ManualClock, SignupInfo,
    SystemClock, MINIMUM_WAIT_TIME, TIMER_TIMEOUT_PERIOD,
};
pub use keystate::{KeyState, KeyStateError, KeyStateStore, KeyStateStoreMap};
pub use publisher::{
    nonce_from_block_id, InitializeOutcome, PoetBlockPublisher, PublishError, RegistrationPayload,
};
pub use registry::{InMemoryRegistry, RegistryView, ValidatorInfo};
pub use state::{
    previous_certificate_id, ConsensusState, ConsensusStateCache, MeanRatioEstimator,
    MinExponentialEstimator, PopulationEstimator, PopulationSample, StateError, ValidatorState,
};
pub use timer::{ClaimPhase, WaitTimer};
pub use types::{BlockId, CertificateId, Hash, ValidatorId, NULL_BLOCK_ID};
pub use verifier::{BlockVerdict, BlockVerifier, VerifierError};

/// Error types shared by the low-level primitives
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
