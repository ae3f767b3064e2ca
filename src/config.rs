//! Consensus configuration view
//!
//! Tunable network parameters live in on-chain settings state. Each
//! parameter has a hard-coded default and a validity predicate; a missing,
//! unparseable, or invalid on-chain value silently falls back to the
//! default. Lookups never fail — a validator must always be able to derive
//! a usable configuration from any state root.

use std::collections::HashMap;
use tracing::debug;

/// Read-only source of raw on-chain setting strings at a particular state
/// root. The journal supplies an implementation backed by settings state;
/// tests use [`InMemorySettings`].
pub trait SettingsSource: Send + Sync {
    fn raw_setting(&self, name: &str) -> Option<String>;
}

/// Simple map-backed settings source
#[derive(Debug, Default, Clone)]
pub struct InMemorySettings {
    values: HashMap<String, String>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }
}

impl SettingsSource for InMemorySettings {
    fn raw_setting(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

// Defaults, one per tunable
const BLOCK_CLAIM_DELAY: u64 = 1;
const INITIAL_WAIT_TIME: f64 = 3000.0;
const KEY_BLOCK_CLAIM_LIMIT: u64 = 25;
const MINIMUM_WAIT_TIME: f64 = 1.0;
const POPULATION_ESTIMATE_SAMPLE_SIZE: usize = 50;
const SIGNUP_COMMIT_MAXIMUM_DELAY: u64 = 10;
const TARGET_WAIT_TIME: f64 = 20.0;
const ZTEST_MAXIMUM_WIN_DEVIATION: f64 = 3.075;
const ZTEST_MINIMUM_WIN_COUNT: u64 = 3;

/// Typed accessor over a [`SettingsSource`].
///
/// Values are resolved once at construction against a single state root, so
/// a view is immutable and consistent for the lifetime of one verification
/// or claim attempt.
#[derive(Debug, Clone)]
pub struct PoetConfigView {
    /// Blocks that must pass after a validator's registration commits
    /// before it may claim a block
    pub block_claim_delay: u64,
    /// Local-mean ceiling used while the chain is bootstrapping
    pub initial_wait_time: f64,
    /// Maximum blocks claimable with one PoET key pair before refresh
    pub key_block_claim_limit: u64,
    /// Lower bound on any wait timer duration, seconds
    pub minimum_wait_time: f64,
    /// Number of recent certificates used for population estimation and
    /// the win-frequency window
    pub population_estimate_sample_size: usize,
    /// Maximum blocks a registration may take to commit before the
    /// publisher abandons it and re-enrolls
    pub signup_commit_maximum_delay: u64,
    /// Desired network-wide average wait, seconds
    pub target_wait_time: f64,
    /// z-score above which a claim is rejected as winning too frequently
    pub ztest_maximum_win_deviation: f64,
    /// Wins required in the sample window before the z-test applies
    pub ztest_minimum_win_count: u64,
}

impl Default for PoetConfigView {
    fn default() -> Self {
        Self {
            block_claim_delay: BLOCK_CLAIM_DELAY,
            initial_wait_time: INITIAL_WAIT_TIME,
            key_block_claim_limit: KEY_BLOCK_CLAIM_LIMIT,
            minimum_wait_time: MINIMUM_WAIT_TIME,
            population_estimate_sample_size: POPULATION_ESTIMATE_SAMPLE_SIZE,
            signup_commit_maximum_delay: SIGNUP_COMMIT_MAXIMUM_DELAY,
            target_wait_time: TARGET_WAIT_TIME,
            ztest_maximum_win_deviation: ZTEST_MAXIMUM_WIN_DEVIATION,
            ztest_minimum_win_count: ZTEST_MINIMUM_WIN_COUNT,
        }
    }
}

impl PoetConfigView {
    /// Resolve every parameter against `source`, falling back to defaults
    /// for absent or invalid values.
    pub fn load(source: &dyn SettingsSource) -> Self {
        Self {
            block_claim_delay: get(source, "poet.block_claim_delay", BLOCK_CLAIM_DELAY, |_| true),
            initial_wait_time: get(source, "poet.initial_wait_time", INITIAL_WAIT_TIME, |v| {
                v.is_finite() && *v >= 0.0
            }),
            key_block_claim_limit: get(
                source,
                "poet.key_block_claim_limit",
                KEY_BLOCK_CLAIM_LIMIT,
                |v| *v > 0,
            ),
            minimum_wait_time: get(source, "poet.minimum_wait_time", MINIMUM_WAIT_TIME, |v| {
                v.is_finite() && *v > 0.0
            }),
            population_estimate_sample_size: get(
                source,
                "poet.population_estimate_sample_size",
                POPULATION_ESTIMATE_SAMPLE_SIZE,
                |v| *v > 0,
            ),
            signup_commit_maximum_delay: get(
                source,
                "poet.signup_commit_maximum_delay",
                SIGNUP_COMMIT_MAXIMUM_DELAY,
                |_| true,
            ),
            target_wait_time: get(source, "poet.target_wait_time", TARGET_WAIT_TIME, |v| {
                v.is_finite() && *v > 0.0
            }),
            ztest_maximum_win_deviation: get(
                source,
                "poet.ztest_maximum_win_deviation",
                ZTEST_MAXIMUM_WIN_DEVIATION,
                |v| v.is_finite() && *v > 0.0,
            ),
            ztest_minimum_win_count: get(
                source,
                "poet.ztest_minimum_win_count",
                ZTEST_MINIMUM_WIN_COUNT,
                |_| true,
            ),
        }
    }
}

/// Parse-and-validate with silent fallback.
fn get<T>(source: &dyn SettingsSource, name: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Debug,
{
    match source.raw_setting(name) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => value,
            _ => {
                debug!(setting = name, raw = %raw, "invalid setting value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let view = PoetConfigView::load(&InMemorySettings::new());
        assert_eq!(view.block_claim_delay, 1);
        assert_eq!(view.initial_wait_time, 3000.0);
        assert_eq!(view.key_block_claim_limit, 25);
        assert_eq!(view.minimum_wait_time, 1.0);
        assert_eq!(view.population_estimate_sample_size, 50);
        assert_eq!(view.target_wait_time, 20.0);
        assert_eq!(view.ztest_maximum_win_deviation, 3.075);
        assert_eq!(view.ztest_minimum_win_count, 3);
    }

    #[test]
    fn test_valid_override() {
        let mut settings = InMemorySettings::new();
        settings.set("poet.target_wait_time", "45.5");
        settings.set("poet.key_block_claim_limit", "100");

        let view = PoetConfigView::load(&settings);
        assert_eq!(view.target_wait_time, 45.5);
        assert_eq!(view.key_block_claim_limit, 100);
    }

    #[test]
    fn test_unparseable_falls_back() {
        let mut settings = InMemorySettings::new();
        settings.set("poet.target_wait_time", "not a number");

        let view = PoetConfigView::load(&settings);
        assert_eq!(view.target_wait_time, 20.0);
    }

    #[test]
    fn test_invalid_value_falls_back() {
        let mut settings = InMemorySettings::new();
        // key_block_claim_limit must be > 0
        settings.set("poet.key_block_claim_limit", "0");
        // minimum_wait_time must be finite and > 0
        settings.set("poet.minimum_wait_time", "-3.0");
        settings.set("poet.target_wait_time", "inf");

        let view = PoetConfigView::load(&settings);
        assert_eq!(view.key_block_claim_limit, 25);
        assert_eq!(view.minimum_wait_time, 1.0);
        assert_eq!(view.target_wait_time, 20.0);
    }
}
