//! Job request shape and parameter parsing.
//!
//! The job lifecycle layer hands over a [`JobRequest`] whose `parameters` map
//! holds everything else as strings; [`JobParameters::from_map`] validates
//! that map up front so the pipeline never has to re-parse mid-flight.

use crate::blob::BlobLocation;
use crate::error::{ProcessError, ReturnCode};
use std::collections::HashMap;

/// Upper bound on any epsilon a job may request.
pub const MAX_EPSILON: f64 = 64.0;

/// Share of errored reports (in percent) tolerated before the job aborts,
/// unless the job overrides it.
pub const DEFAULT_REPORT_ERROR_THRESHOLD_PERCENTAGE: f64 = 10.0;

pub const ATTRIBUTION_REPORT_TO: &str = "attribution_report_to";
pub const OUTPUT_DOMAIN_BUCKET_NAME: &str = "output_domain_bucket_name";
pub const OUTPUT_DOMAIN_BLOB_PREFIX: &str = "output_domain_blob_prefix";
pub const DEBUG_RUN: &str = "debug_run";
pub const DEBUG_PRIVACY_EPSILON: &str = "debug_privacy_epsilon";
pub const REPORT_ERROR_THRESHOLD_PERCENTAGE: &str = "report_error_threshold_percentage";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("required job parameter {0:?} is missing")]
    MissingParameter(&'static str),
    #[error("debug_privacy_epsilon {0} is outside (0, {MAX_EPSILON}]")]
    EpsilonOutOfRange(f64),
    #[error("report_error_threshold_percentage {0:?} is not a percentage in [0, 100]")]
    MalformedThreshold(String),
    #[error("output domain bucket and prefix must be given together")]
    IncompleteDomainLocation,
}

impl From<Error> for ProcessError {
    fn from(e: Error) -> Self {
        ProcessError::new(ReturnCode::InvalidJob, e.to_string())
    }
}

/// Distribution of the additive noise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseDistribution {
    Laplace,
    Gaussian,
}

/// Differential-privacy parameters for one job.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrivacyParameters {
    pub epsilon: f64,
    pub delta: f64,
    pub l1_sensitivity: f64,
    pub distribution: NoiseDistribution,
}

impl PrivacyParameters {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Laplace tail bound on the noised count of a bucket seen only in
    /// reports: values below this are indistinguishable from noise alone.
    pub fn default_threshold(&self) -> f64 {
        (self.l1_sensitivity / self.epsilon) * (1.0 / (2.0 * self.delta)).ln()
    }
}

/// A leased aggregation job.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub job_id: String,
    pub input: BlobLocation,
    pub output: BlobLocation,
    pub parameters: HashMap<String, String>,
}

/// Validated view of a job's string parameter map.
#[derive(Clone, Debug, PartialEq)]
pub struct JobParameters {
    pub attribution_report_to: String,
    pub output_domain: Option<BlobLocation>,
    pub debug_run: bool,
    pub debug_privacy_epsilon: Option<f64>,
    pub report_error_threshold_percentage: f64,
}

impl JobParameters {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, Error> {
        let attribution_report_to = map
            .get(ATTRIBUTION_REPORT_TO)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingParameter(ATTRIBUTION_REPORT_TO))?
            .clone();

        let output_domain = match (
            map.get(OUTPUT_DOMAIN_BUCKET_NAME).filter(|v| !v.is_empty()),
            map.get(OUTPUT_DOMAIN_BLOB_PREFIX).filter(|v| !v.is_empty()),
        ) {
            (Some(bucket), Some(prefix)) => Some(BlobLocation::new(bucket.clone(), prefix.clone())),
            (None, None) => None,
            _ => return Err(Error::IncompleteDomainLocation),
        };

        let debug_run = map
            .get(DEBUG_RUN)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // An unparseable override is tolerated and ignored; a parseable value
        // outside (0, MAX_EPSILON] rejects the job.
        let debug_privacy_epsilon = match map.get(DEBUG_PRIVACY_EPSILON) {
            None => None,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(e) if e > 0.0 && e <= MAX_EPSILON => Some(e),
                Ok(e) => return Err(Error::EpsilonOutOfRange(e)),
                Err(_) => None,
            },
        };

        let report_error_threshold_percentage = match map.get(REPORT_ERROR_THRESHOLD_PERCENTAGE)
        {
            None => DEFAULT_REPORT_ERROR_THRESHOLD_PERCENTAGE,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(pct) if (0.0..=100.0).contains(&pct) => pct,
                _ => return Err(Error::MalformedThreshold(raw.clone())),
            },
        };

        Ok(Self {
            attribution_report_to,
            output_domain,
            debug_run,
            debug_privacy_epsilon,
            report_error_threshold_percentage,
        })
    }
}
