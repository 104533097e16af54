//! Noising, thresholding, and the domain-join algebra.
//!
//! The runner consumes the frozen aggregation and the optional output-domain
//! key set and produces the final facts. Exactly one noise sample is drawn
//! per output bucket; the same draw backs the summary fact, the threshold
//! decision, and (in debug runs) the annotated debug fact for that bucket.

use crate::aggregate::FrozenAggregation;
use crate::parameters::{NoiseDistribution, PrivacyParameters};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeSet, HashMap};

/// Membership tags attached to debug facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugAnnotation {
    InReports,
    InDomain,
}

impl DebugAnnotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InReports => "IN_REPORTS",
            Self::InDomain => "IN_DOMAIN",
        }
    }

    pub fn from_str(symbol: &str) -> Option<Self> {
        match symbol {
            "IN_REPORTS" => Some(Self::InReports),
            "IN_DOMAIN" => Some(Self::InDomain),
            _ => None,
        }
    }
}

/// One output row. Summary facts carry no annotations; debug facts tag every
/// bucket with its membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedFact {
    pub bucket: u128,
    pub metric: i64,
    pub unnoised_metric: u64,
    pub annotations: Option<BTreeSet<DebugAnnotation>>,
}

/// Source of additive noise; one call per output bucket.
pub trait NoiseApplier: Send + Sync {
    fn sample(&self) -> i64;
}

/// Distribution-backed noise parameterized by the job's privacy parameters.
pub struct DpNoise {
    params: PrivacyParameters,
}

impl DpNoise {
    pub fn new(params: PrivacyParameters) -> Self {
        Self { params }
    }
}

impl NoiseApplier for DpNoise {
    fn sample(&self) -> i64 {
        let mut rng = rand::thread_rng();
        let drawn = match self.params.distribution {
            NoiseDistribution::Laplace => {
                let scale = self.params.l1_sensitivity / self.params.epsilon;
                // Inverse-CDF sampling over u in (-1/2, 1/2), excluding the
                // endpoint where the quantile diverges.
                let u = loop {
                    let r: f64 = rng.gen();
                    if r > 0.0 {
                        break r - 0.5;
                    }
                };
                -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
            }
            NoiseDistribution::Gaussian => {
                let sigma = self.params.l1_sensitivity
                    * (2.0 * (1.25 / self.params.delta).ln()).sqrt()
                    / self.params.epsilon;
                Normal::new(0.0, sigma)
                    .map(|normal| normal.sample(&mut rng))
                    .unwrap_or(0.0)
            }
        };
        if drawn.is_finite() {
            drawn.round() as i64
        } else {
            0
        }
    }
}

/// Fixed noise, for deterministic runs.
pub struct ConstantNoise(pub i64);

impl NoiseApplier for ConstantNoise {
    fn sample(&self) -> i64 {
        self.0
    }
}

/// Knobs for one noising run.
pub struct RunConfig<'a> {
    pub noise: &'a dyn NoiseApplier,
    /// Minimum noised value for a bucket seen only in reports.
    pub threshold: f64,
    pub thresholding_enabled: bool,
    /// When a domain is present, also keep report-only buckets that pass
    /// thresholding instead of dropping them outright.
    pub domain_optional: bool,
    pub debug_run: bool,
}

/// Facts ready for serialization, ordered by bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NoisedOutput {
    pub summary: Vec<AggregatedFact>,
    pub debug: Option<Vec<AggregatedFact>>,
}

/// Run the domain join, noise application, and thresholding over a frozen
/// aggregation.
pub fn run(
    aggregation: &FrozenAggregation,
    domain: Option<&BTreeSet<u128>>,
    config: &RunConfig<'_>,
) -> NoisedOutput {
    let keys_in_reports = aggregation.keys();
    let mut noise_cache: HashMap<u128, i64> = HashMap::new();

    let mut summary_keys: BTreeSet<u128> = match domain {
        // Domain buckets are always in the output, whether or not any report
        // contributed to them.
        Some(domain_keys) => domain_keys.clone(),
        None => BTreeSet::new(),
    };

    let report_only_kept = domain.is_none() || config.domain_optional;
    if report_only_kept {
        for &bucket in &keys_in_reports {
            if domain.map(|d| d.contains(&bucket)).unwrap_or(false) {
                continue;
            }
            let unnoised = aggregation.sum(bucket).unwrap_or(0);
            let noise = noise_for(&mut noise_cache, config.noise, bucket);
            if passes_threshold(unnoised, noise, config) {
                summary_keys.insert(bucket);
            }
        }
    }

    let summary = summary_keys
        .iter()
        .map(|&bucket| {
            let unnoised = aggregation.sum(bucket).unwrap_or(0);
            let noise = noise_for(&mut noise_cache, config.noise, bucket);
            AggregatedFact {
                bucket,
                metric: noised_metric(unnoised, noise),
                unnoised_metric: unnoised,
                annotations: None,
            }
        })
        .collect();

    let debug = config.debug_run.then(|| {
        let mut union = keys_in_reports.clone();
        if let Some(domain_keys) = domain {
            union.extend(domain_keys.iter().copied());
        }
        union
            .into_iter()
            .map(|bucket| {
                let mut annotations = BTreeSet::new();
                if keys_in_reports.contains(&bucket) {
                    annotations.insert(DebugAnnotation::InReports);
                }
                if domain.map(|d| d.contains(&bucket)).unwrap_or(false) {
                    annotations.insert(DebugAnnotation::InDomain);
                }
                let unnoised = aggregation.sum(bucket).unwrap_or(0);
                let noise = noise_for(&mut noise_cache, config.noise, bucket);
                AggregatedFact {
                    bucket,
                    metric: noised_metric(unnoised, noise),
                    unnoised_metric: unnoised,
                    annotations: Some(annotations),
                }
            })
            .collect()
    });

    NoisedOutput { summary, debug }
}

fn noise_for(
    cache: &mut HashMap<u128, i64>,
    noise: &dyn NoiseApplier,
    bucket: u128,
) -> i64 {
    *cache.entry(bucket).or_insert_with(|| noise.sample())
}

fn passes_threshold(unnoised: u64, noise: i64, config: &RunConfig<'_>) -> bool {
    if !config.thresholding_enabled {
        return true;
    }
    unnoised as f64 + noise as f64 >= config.threshold
}

fn noised_metric(unnoised: u64, noise: i64) -> i64 {
    let value = unnoised as i128 + noise as i128;
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregationState, PrivacyBudgetUnit};
    use crate::report::SharedInfo;
    use crate::testutil::shared_info_json;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn frozen(pairs: &[(u128, u32)]) -> FrozenAggregation {
        let info =
            SharedInfo::from_json(&shared_info_json("https://adtech.example", "1.0", 0))
                .unwrap();
        let unit = PrivacyBudgetUnit::for_report(&info);
        let state = AggregationState::new();
        for &(bucket, value) in pairs {
            state.accept(bucket, value, &unit);
        }
        state.freeze()
    }

    fn config<'a>(noise: &'a dyn NoiseApplier) -> RunConfig<'a> {
        RunConfig {
            noise,
            threshold: 0.0,
            thresholding_enabled: false,
            domain_optional: false,
            debug_run: false,
        }
    }

    fn fact(bucket: u128, metric: i64, unnoised: u64) -> AggregatedFact {
        AggregatedFact {
            bucket,
            metric,
            unnoised_metric: unnoised,
            annotations: None,
        }
    }

    #[test]
    fn no_domain_no_noise() {
        let aggregation = frozen(&[(1, 1), (1, 1), (2, 4), (2, 4)]);
        let noise = ConstantNoise(0);
        let output = run(&aggregation, None, &config(&noise));
        assert_eq!(output.summary, vec![fact(1, 2, 2), fact(2, 8, 8)]);
        assert_eq!(output.debug, None);
    }

    #[test]
    fn thresholding_drops_low_buckets() {
        let aggregation = frozen(&[(1, 1), (1, 1), (2, 4), (2, 4)]);
        let noise = ConstantNoise(-3);
        let mut cfg = config(&noise);
        cfg.thresholding_enabled = true;

        let output = run(&aggregation, None, &cfg);
        assert_eq!(output.summary, vec![fact(2, 5, 8)]);
    }

    #[test]
    fn thresholding_disabled_keeps_negative_metrics() {
        let aggregation = frozen(&[(1, 1), (1, 1), (2, 4), (2, 4)]);
        let noise = ConstantNoise(-3);
        let output = run(&aggregation, None, &config(&noise));
        assert_eq!(output.summary, vec![fact(1, -1, 2), fact(2, 5, 8)]);
    }

    #[test]
    fn domain_join_augments_and_restricts() {
        let aggregation = frozen(&[(1, 1), (1, 1), (2, 4), (2, 4)]);
        let noise = ConstantNoise(0);
        let domain: BTreeSet<u128> = [2, 3].into_iter().collect();

        // Bucket 1 is reports-only and a strict domain drops it; bucket 3 is
        // domain-only and appears with a zero sum.
        let output = run(&aggregation, Some(&domain), &config(&noise));
        assert_eq!(output.summary, vec![fact(2, 8, 8), fact(3, 0, 0)]);
    }

    #[test]
    fn full_domain_keeps_everything() {
        let aggregation = frozen(&[(1, 1), (1, 1), (2, 4), (2, 4)]);
        let noise = ConstantNoise(0);
        let domain: BTreeSet<u128> = [1, 2, 3].into_iter().collect();
        let output = run(&aggregation, Some(&domain), &config(&noise));
        assert_eq!(
            output.summary,
            vec![fact(1, 2, 2), fact(2, 8, 8), fact(3, 0, 0)]
        );
    }

    #[test]
    fn optional_domain_thresholds_report_only_buckets() {
        let aggregation = frozen(&[(1, 2), (2, 40)]);
        let noise = ConstantNoise(0);
        let domain: BTreeSet<u128> = [9].into_iter().collect();
        let mut cfg = config(&noise);
        cfg.domain_optional = true;
        cfg.thresholding_enabled = true;
        cfg.threshold = 10.0;

        // Bucket 1 (2 < 10) is thresholded away; bucket 2 (40) survives; the
        // domain bucket 9 is unconditional.
        let output = run(&aggregation, Some(&domain), &cfg);
        assert_eq!(
            output.summary,
            vec![fact(2, 40, 40), fact(9, 0, 0)]
        );
    }

    #[test]
    fn empty_domain_empties_the_summary() {
        let aggregation = frozen(&[(1, 5)]);
        let noise = ConstantNoise(0);
        let domain = BTreeSet::new();
        let output = run(&aggregation, Some(&domain), &config(&noise));
        assert!(output.summary.is_empty());
    }

    #[test]
    fn debug_run_annotates_membership() {
        let aggregation = frozen(&[(1, 2), (2, 8)]);
        let noise = ConstantNoise(0);
        let domain: BTreeSet<u128> = [2, 3].into_iter().collect();
        let mut cfg = config(&noise);
        cfg.debug_run = true;

        let output = run(&aggregation, Some(&domain), &cfg);
        let debug = output.debug.unwrap();
        assert_eq!(debug.len(), 3);

        let annotations: Vec<&BTreeSet<DebugAnnotation>> =
            debug.iter().map(|f| f.annotations.as_ref().unwrap()).collect();
        assert_eq!(
            *annotations[0],
            BTreeSet::from([DebugAnnotation::InReports])
        );
        assert_eq!(
            *annotations[1],
            BTreeSet::from([DebugAnnotation::InReports, DebugAnnotation::InDomain])
        );
        assert_eq!(*annotations[2], BTreeSet::from([DebugAnnotation::InDomain]));
    }

    struct CountingNoise(AtomicI64);

    impl NoiseApplier for CountingNoise {
        fn sample(&self) -> i64 {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    #[test]
    fn noise_draw_is_reused_between_summary_and_debug() {
        let aggregation = frozen(&[(1, 2), (2, 8)]);
        let noise = CountingNoise(AtomicI64::new(0));
        let domain: BTreeSet<u128> = [2, 3].into_iter().collect();
        let cfg = RunConfig {
            noise: &noise,
            threshold: 0.0,
            thresholding_enabled: false,
            domain_optional: true,
            debug_run: true,
        };

        let output = run(&aggregation, Some(&domain), &cfg);
        let debug = output.debug.unwrap();
        // Exactly one draw per distinct bucket.
        assert_eq!(noise.0.load(Ordering::SeqCst), 3);
        for fact in &output.summary {
            let twin = debug.iter().find(|d| d.bucket == fact.bucket).unwrap();
            assert_eq!(fact.metric, twin.metric);
            assert_eq!(fact.unnoised_metric, twin.unnoised_metric);
        }
    }

    #[test]
    fn metric_clamps_at_the_i64_boundary() {
        assert_eq!(noised_metric(u64::MAX, 10), i64::MAX);
        assert_eq!(noised_metric(0, -5), -5);
        assert_eq!(noised_metric(7, -10), -3);
    }

    #[test]
    fn laplace_noise_is_finite() {
        let noise = DpNoise::new(PrivacyParameters {
            epsilon: 10.0,
            delta: 1e-8,
            l1_sensitivity: 65_536.0,
            distribution: NoiseDistribution::Laplace,
        });
        for _ in 0..1_000 {
            // A sample beyond 100 scale factors has probability ~e^-100.
            assert!(noise.sample().abs() < 100 * 65_536 / 10 + 1);
        }
    }

    #[test]
    fn gaussian_noise_is_finite() {
        let noise = DpNoise::new(PrivacyParameters {
            epsilon: 10.0,
            delta: 1e-8,
            l1_sensitivity: 65_536.0,
            distribution: NoiseDistribution::Gaussian,
        });
        for _ in 0..1_000 {
            noise.sample();
        }
    }
}
