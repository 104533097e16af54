//! Shared aggregation state and privacy-budget unit derivation.
//!
//! During the parallel phase every shard pipeline writes into one
//! [`AggregationState`]; it is the only multi-writer structure in a job. The
//! map is striped over the low-order bucket bits so concurrent writers rarely
//! contend. Once input is drained the state is frozen into an ordered,
//! read-only view consumed by the noising, budgeting, and serialization
//! steps.

use crate::report::SharedInfo;
use crate::{truncate_to_hour, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

const STRIPE_COUNT: usize = 16;

/// The atom of consumption in the privacy-budget ledger.
///
/// Two reports whose envelopes agree on api, reporting origin, hour window,
/// destination, and version derive the same unit and share budget. The key
/// encoding is a ledger contract: each field is fed to SHA-256 followed by a
/// NUL byte, in the order below, with the window rendered as RFC 3339.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct PrivacyBudgetUnit {
    pub key: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub window: Timestamp,
}

impl PrivacyBudgetUnit {
    /// Derive the unit covering one report.
    pub fn for_report(shared_info: &SharedInfo) -> Self {
        let window = truncate_to_hour(shared_info.scheduled_report_time);

        let mut hasher = Sha256::new();
        for field in [
            shared_info.api.as_str(),
            shared_info.reporting_origin.as_str(),
            &window.to_rfc3339(),
            shared_info.attribution_destination.as_deref().unwrap_or(""),
            shared_info.version.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }

        Self {
            key: hex::encode(hasher.finalize()),
            window,
        }
    }
}

#[derive(Debug, Default)]
struct BucketState {
    sum: u64,
    saturated: bool,
    units: HashSet<PrivacyBudgetUnit>,
}

/// Multi-writer accumulator: bucket → (saturating sum, budget-unit set).
#[derive(Debug)]
pub struct AggregationState {
    stripes: Vec<Mutex<HashMap<u128, BucketState>>>,
}

impl Default for AggregationState {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationState {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, bucket: u128) -> &Mutex<HashMap<u128, BucketState>> {
        &self.stripes[(bucket as usize) & (STRIPE_COUNT - 1)]
    }

    /// Record one contribution covered by `unit`. Safe for concurrent
    /// callers; the sum saturates at `u64::MAX`.
    pub fn accept(&self, bucket: u128, value: u32, unit: &PrivacyBudgetUnit) {
        let mut stripe = self
            .stripe(bucket)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let state = stripe.entry(bucket).or_default();
        match state.sum.checked_add(u64::from(value)) {
            Some(sum) => state.sum = sum,
            None => {
                state.sum = u64::MAX;
                state.saturated = true;
            }
        }
        state.units.insert(unit.clone());
    }

    #[cfg(test)]
    fn seed_sum(&self, bucket: u128, sum: u64) {
        let mut stripe = self
            .stripe(bucket)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        stripe.entry(bucket).or_default().sum = sum;
    }

    /// Drain the stripes into an ordered read-only view. Writers must be
    /// finished by the time this is called.
    pub fn freeze(&self) -> FrozenAggregation {
        let mut buckets = BTreeMap::new();
        for stripe in &self.stripes {
            let drained =
                std::mem::take(&mut *stripe.lock().unwrap_or_else(|e| e.into_inner()));
            for (bucket, state) in drained {
                buckets.insert(
                    bucket,
                    FrozenBucket {
                        sum: state.sum,
                        saturated: state.saturated,
                        units: state.units.into_iter().collect(),
                    },
                );
            }
        }
        FrozenAggregation { buckets }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrozenBucket {
    pub sum: u64,
    pub saturated: bool,
    pub units: BTreeSet<PrivacyBudgetUnit>,
}

/// Immutable aggregation result, ordered by bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrozenAggregation {
    buckets: BTreeMap<u128, FrozenBucket>,
}

impl FrozenAggregation {
    pub fn buckets(&self) -> impl Iterator<Item = (&u128, &FrozenBucket)> {
        self.buckets.iter()
    }

    /// The set of non-empty bucket keys.
    pub fn keys(&self) -> BTreeSet<u128> {
        self.buckets.keys().copied().collect()
    }

    pub fn sum(&self, bucket: u128) -> Option<u64> {
        self.buckets.get(&bucket).map(|b| b.sum)
    }

    /// Union of all budget units across buckets, deduplicated.
    pub fn units(&self) -> BTreeSet<PrivacyBudgetUnit> {
        self.buckets
            .values()
            .flat_map(|b| b.units.iter().cloned())
            .collect()
    }

    /// Number of buckets whose sum hit the saturation cap.
    pub fn saturated_count(&self) -> u64 {
        self.buckets.values().filter(|b| b.saturated).count() as u64
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
