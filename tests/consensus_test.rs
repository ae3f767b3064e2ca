//! End-to-end consensus tests
//!
//! Drives the full claim/verify cycle across a fleet of simulated
//! validators: enrollment, timer races, certificate embedding, and
//! re-verification of every published block by an independent verifier.

use poet_core::certificate::WaitCertificate;
use poet_core::chain::{block_content_hash, BlockRef, InMemoryBlockStore};
use poet_core::config::PoetConfigView;
use poet_core::enclave::simulator::PoetSimulatorEnclave;
use poet_core::enclave::ManualClock;
use poet_core::keystate::KeyStateStoreMap;
use poet_core::publisher::{InitializeOutcome, PoetBlockPublisher, RegistrationPayload};
use poet_core::registry::{InMemoryRegistry, ValidatorInfo};
use poet_core::state::{previous_certificate_id, ConsensusStateCache};
use poet_core::timer::WaitTimer;
use poet_core::types::{BlockId, ValidatorId, NULL_BLOCK_ID};
use poet_core::verifier::{BlockVerdict, BlockVerifier};
use std::path::PathBuf;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn test_data_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("poet_core_{}_{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create test data dir");
    dir
}

/// Shared network fixture: one oracle simulator, one chain, one registry,
/// one manually driven clock.
struct TestNet {
    clock: Arc<ManualClock>,
    enclave: Arc<PoetSimulatorEnclave>,
    chain: Arc<InMemoryBlockStore>,
    registry: Arc<InMemoryRegistry>,
    key_stores: KeyStateStoreMap,
    config: PoetConfigView,
    data_dir: PathBuf,
    next_block_byte: std::cell::Cell<u8>,
}

struct TestValidator {
    id: ValidatorId,
    publisher: PoetBlockPublisher,
    /// This validator's own oracle instance; verification only ever needs
    /// the serialized certificates, so peers never share it.
    enclave: Arc<PoetSimulatorEnclave>,
    sealed_signup_data: String,
}

impl TestNet {
    fn new(tag: &str, config: PoetConfigView) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::starting_at(100_000.0));
        let data_dir = test_data_dir(tag);
        Self {
            clock: clock.clone(),
            enclave: Arc::new(PoetSimulatorEnclave::with_clock(clock)),
            chain: Arc::new(InMemoryBlockStore::new()),
            registry: Arc::new(InMemoryRegistry::new()),
            key_stores: KeyStateStoreMap::new(&data_dir),
            config,
            data_dir,
            next_block_byte: std::cell::Cell::new(0),
        }
    }

    /// Spin up a validator, run its enrollment, and commit the resulting
    /// registration to the registry as of `commit_block_num`.
    fn spawn_validator(&self, id_byte: u8, commit_block_num: u64) -> TestValidator {
        let id: ValidatorId = [id_byte; 32];
        let key_store = self.key_stores.open(&id).expect("open key store");
        let enclave = Arc::new(PoetSimulatorEnclave::with_clock(self.clock.clone()));
        let publisher = PoetBlockPublisher::new(
            self.chain.clone(),
            self.registry.clone(),
            enclave.clone(),
            Arc::new(ConsensusStateCache::new(64)),
            key_store.clone(),
            self.clock.clone(),
            id,
        );

        let outcome = publisher
            .initialize_block(&NULL_BLOCK_ID, 1, &self.config)
            .expect("enrollment must not error");
        let InitializeOutcome::Declined {
            registration: Some(registration),
            ..
        } = outcome
        else {
            panic!("expected enrollment registration");
        };
        self.commit_registration(&registration, commit_block_num);

        let active = key_store
            .active_key()
            .expect("active key readable")
            .expect("active key set");
        let sealed_signup_data = key_store.get(&active).expect("key state").sealed_signup_data;

        // Enrollment declined the genesis parent; a head event clears it
        publisher.on_chain_head_changed(&NULL_BLOCK_ID);

        TestValidator {
            id,
            publisher,
            enclave,
            sealed_signup_data,
        }
    }

    fn commit_registration(&self, registration: &RegistrationPayload, commit_block_num: u64) {
        self.registry.register(ValidatorInfo {
            name: registration.name.clone(),
            id: registration.id,
            poet_public_key: registration.poet_public_key,
            signup_nonce: registration.nonce.clone(),
            commit_block_num,
        });
    }

    fn fresh_block_id(&self) -> BlockId {
        let byte = self.next_block_byte.get() + 1;
        self.next_block_byte.set(byte);
        let mut id = [0u8; 32];
        id[0] = byte;
        id[31] = 0xb1;
        id
    }

    fn verify(&self, block: &BlockRef) -> BlockVerdict {
        let cache = ConsensusStateCache::new(64);
        let verifier = BlockVerifier::new(
            self.chain.as_ref(),
            self.registry.as_ref(),
            self.enclave.as_ref(),
            &cache,
        );
        verifier
            .verify_block(block, &self.config)
            .expect("verification must not error")
    }

    /// Race every validator's armed timer; the shortest duration wins and
    /// publishes. Losers discard on the resulting head change.
    fn race_and_publish(
        &self,
        validators: &[&TestValidator],
        parent: BlockId,
        block_num: u64,
    ) -> BlockRef {
        let mut armed: Vec<&TestValidator> = Vec::new();
        for validator in validators {
            match validator
                .publisher
                .initialize_block(&parent, block_num, &self.config)
                .expect("initialize must not error")
            {
                InitializeOutcome::Ready => armed.push(validator),
                InitializeOutcome::Declined { reason, .. } => {
                    panic!("validator unexpectedly declined: {reason}")
                }
            }
        }

        let winner = armed
            .iter()
            .min_by(|a, b| {
                let da = a.publisher.pending_timer().unwrap().duration;
                let db = b.publisher.pending_timer().unwrap().duration;
                da.partial_cmp(&db).unwrap()
            })
            .expect("at least one armed validator");

        let timer = winner.publisher.pending_timer().unwrap();
        self.clock.advance(timer.duration + 0.01);
        assert!(winner.publisher.check_publish_block(&parent));

        let batch_id = [block_num as u8; 32];
        let content_hash = block_content_hash(&parent, &[batch_id]);
        let certificate = winner
            .publisher
            .finalize_block(&content_hash)
            .expect("finalize");

        let block = BlockRef {
            block_id: self.fresh_block_id(),
            previous_block_id: parent,
            block_num,
            signer_id: winner.id,
            content_hash,
            consensus: certificate.payload().encode(),
        };

        assert_eq!(self.verify(&block), BlockVerdict::Valid, "peer rejected our block");

        self.chain.insert(block.clone());
        for validator in validators {
            validator.publisher.on_chain_head_changed(&block.block_id);
        }
        block
    }

    /// Build a candidate block by hand: honest timer and certificate, but
    /// none of the publisher's self-policing. For testing what peers reject.
    fn craft_block(
        &self,
        validator: &TestValidator,
        parent: BlockId,
        block_num: u64,
    ) -> BlockRef {
        let cache = ConsensusStateCache::new(64);
        let state = cache
            .state_for_block(
                &parent,
                self.chain.as_ref(),
                self.registry.as_ref(),
                self.enclave.as_ref(),
                &self.config,
            )
            .expect("state");
        let prev_cert =
            previous_certificate_id(self.enclave.as_ref(), self.chain.as_ref(), &parent)
                .expect("previous certificate id");
        let timer = WaitTimer::create(
            validator.enclave.as_ref(),
            Some(&validator.sealed_signup_data),
            &validator.id,
            prev_cert,
            &state,
            &self.config,
        )
        .expect("timer");
        self.clock.advance(timer.duration + 0.01);

        let batch_id = [block_num as u8; 32];
        let content_hash = block_content_hash(&parent, &[batch_id]);
        let certificate = WaitCertificate::create(
            validator.enclave.as_ref(),
            &validator.sealed_signup_data,
            &timer,
            &content_hash,
        )
        .expect("certificate");

        BlockRef {
            block_id: self.fresh_block_id(),
            previous_block_id: parent,
            block_num,
            signer_id: validator.id,
            content_hash,
            consensus: certificate.payload().encode(),
        }
    }

    fn cleanup(self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

#[test]
fn test_fleet_builds_chain_every_block_verifies() {
    let net = TestNet::new("fleet", PoetConfigView::default());
    let alice = net.spawn_validator(1, 0);
    let bob = net.spawn_validator(2, 0);
    let carol = net.spawn_validator(3, 0);
    let fleet = [&alice, &bob, &carol];

    let mut parent = NULL_BLOCK_ID;
    let mut heights = Vec::new();
    for block_num in 1..=8u64 {
        let block = net.race_and_publish(&fleet, parent, block_num);
        heights.push(block.block_num);
        parent = block.block_id;
    }
    assert_eq!(heights, (1..=8).collect::<Vec<_>>());
    assert_eq!(net.chain.len(), 8);

    // Chain determinism: two independent reconstructions of the head state
    // agree exactly.
    let state_a = ConsensusStateCache::new(8)
        .state_for_block(
            &parent,
            net.chain.as_ref(),
            net.registry.as_ref(),
            net.enclave.as_ref(),
            &net.config,
        )
        .unwrap();
    let state_b = ConsensusStateCache::new(8)
        .state_for_block(
            &parent,
            net.chain.as_ref(),
            net.registry.as_ref(),
            net.enclave.as_ref(),
            &net.config,
        )
        .unwrap();
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.total_block_claim_count(), 8);

    net.cleanup();
}

#[test]
fn test_certificates_round_trip_across_oracle_instances() {
    let net = TestNet::new("roundtrip", PoetConfigView::default());
    let alice = net.spawn_validator(1, 0);
    let block = net.race_and_publish(&[&alice], NULL_BLOCK_ID, 1);

    // A different validator's oracle instance recovers the identical
    // certificate from the embedded bytes.
    let other_oracle = PoetSimulatorEnclave::new();
    let payload = poet_core::certificate::ConsensusPayload::decode(&block.consensus).unwrap();
    let ours = WaitCertificate::from_payload(net.enclave.as_ref(), &payload).unwrap();
    let theirs = WaitCertificate::from_payload(&other_oracle, &payload).unwrap();
    assert_eq!(ours.identifier, theirs.identifier);
    assert_eq!(ours.duration.to_bits(), theirs.duration.to_bits());
    assert_eq!(ours.block_hash, theirs.block_hash);

    net.cleanup();
}

#[test]
fn test_late_registrant_must_wait_out_claim_delay() {
    let net = TestNet::new("delay", PoetConfigView::default());
    let alice = net.spawn_validator(1, 0);
    let bob = net.spawn_validator(2, 0);

    // Two blocks of history so the bootstrap exemption no longer applies
    let first = net.race_and_publish(&[&alice, &bob], NULL_BLOCK_ID, 1);
    let second = net.race_and_publish(&[&alice, &bob], first.block_id, 2);

    // Carol registers as of block 2 and immediately tries to claim block 3
    let carol = net.spawn_validator(3, 2);
    let eager = net.craft_block(&carol, second.block_id, 3);
    assert!(
        !net.verify(&eager).is_valid(),
        "claim inside the delay window must be rejected"
    );

    // After one more block of history, carol's registration has aged enough
    let third = net.race_and_publish(&[&alice, &bob], second.block_id, 3);
    let patient = net.craft_block(&carol, third.block_id, 4);
    assert_eq!(net.verify(&patient), BlockVerdict::Valid);

    net.cleanup();
}

#[test]
fn test_key_claim_limit_boundary() {
    let config = PoetConfigView {
        key_block_claim_limit: 2,
        ..Default::default()
    };
    let net = TestNet::new("keylimit", config);
    let alice = net.spawn_validator(1, 0);

    // Blocks one and two sit at and under the limit and are accepted
    let first = net.race_and_publish(&[&alice], NULL_BLOCK_ID, 1);
    let second = net.race_and_publish(&[&alice], first.block_id, 2);

    // The publisher itself fails closed now...
    let outcome = alice
        .publisher
        .initialize_block(&second.block_id, 3, &net.config)
        .unwrap();
    assert!(matches!(outcome, InitializeOutcome::Declined { .. }));

    // ...and a crafted limit+1 claim with the spent key is rejected by peers
    let over_limit = net.craft_block(&alice, second.block_id, 3);
    assert!(!net.verify(&over_limit).is_valid());

    net.cleanup();
}

#[test]
fn test_ztest_boundary_on_win_frequency() {
    let config = PoetConfigView {
        population_estimate_sample_size: 5,
        ..Default::default()
    };
    let net = TestNet::new("ztest", config);
    let alice = net.spawn_validator(1, 0);
    let bob = net.spawn_validator(2, 0);

    // Committed history: alice wins twice, bob three times. The window is
    // now full, so the test arms for the next claim.
    let mut parent = NULL_BLOCK_ID;
    for (block_num, validator) in [&alice, &alice, &bob, &bob, &bob].iter().enumerate() {
        let block = net.craft_block(validator, parent, block_num as u64 + 1);
        assert_eq!(net.verify(&block), BlockVerdict::Valid);
        parent = block.block_id;
        net.chain.insert(block);
    }

    // Two wins in the window is below ztest_minimum_win_count: no test,
    // alice's claim stands.
    let alice_claim = net.craft_block(&alice, parent, 6);
    assert_eq!(net.verify(&alice_claim), BlockVerdict::Valid);

    // Three wins meets the minimum, and against the steady-state population
    // estimate that frequency is far past the allowed deviation.
    let bob_claim = net.craft_block(&bob, parent, 6);
    assert!(!net.verify(&bob_claim).is_valid());

    net.cleanup();
}

#[test]
fn test_discarded_timer_never_becomes_certificate() {
    let net = TestNet::new("discard", PoetConfigView::default());
    let alice = net.spawn_validator(1, 0);
    let bob = net.spawn_validator(2, 0);

    let first = net.race_and_publish(&[&alice, &bob], NULL_BLOCK_ID, 1);

    // Alice arms a timer on the new head...
    assert!(matches!(
        alice
            .publisher
            .initialize_block(&first.block_id, 2, &net.config)
            .unwrap(),
        InitializeOutcome::Ready
    ));
    let timer = alice.publisher.pending_timer().unwrap();

    // ...then the chain reorganizes under her.
    alice.publisher.on_chain_head_changed(&[0xee; 32]);
    net.clock.advance(timer.duration + 5.0);

    assert!(!alice.publisher.check_publish_block(&first.block_id));
    let content_hash = block_content_hash(&first.block_id, &[[9u8; 32]]);
    assert!(alice.publisher.finalize_block(&content_hash).is_err());

    net.cleanup();
}
