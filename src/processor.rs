//! Job orchestration: the fan-out/fan-in pipeline and its return codes.
//!
//! One job moves through reading, aggregating, domain join, noising,
//! budgeting, and writing. Shard pipelines run concurrently, bounded by the
//! configured width; everything after the drain runs on the orchestrator
//! task. Budget is debited exactly once, after noising and before writing,
//! so no failure path can leak output without paying for it.

use crate::aggregate::{AggregationState, FrozenAggregation, PrivacyBudgetUnit};
use crate::blob::BlobStore;
use crate::budget::{self, PrivacyBudgetBridge};
use crate::codec;
use crate::domain;
use crate::error::{ErrorCounter, ErrorSummary, JobResult, ProcessError, ReturnCode};
use crate::hpke::{Decryptor, Error as DecryptError, KeyFetchError, KeyFetcher};
use crate::noise::{self, DpNoise, NoiseApplier, RunConfig};
use crate::parameters::{JobParameters, JobRequest, PrivacyParameters};
use crate::results::ResultLogger;
use crate::validation::{default_validators, run_chain, ReportValidator};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many shard pipelines may be in flight at once.
const DEFAULT_CONCURRENCY: usize = 8;

/// Drives aggregation jobs end to end. Capabilities are fixed at
/// construction; every [`process`](Self::process) call is an independent job.
pub struct Processor {
    store: Arc<dyn BlobStore>,
    decryptor: Decryptor,
    bridge: Arc<dyn PrivacyBudgetBridge>,
    validators: Arc<Vec<Box<dyn ReportValidator>>>,
    privacy: PrivacyParameters,
    noise_override: Option<Arc<dyn NoiseApplier>>,
    threshold_override: Option<f64>,
    thresholding_enabled: bool,
    domain_optional: bool,
    concurrency: usize,
}

impl Processor {
    pub fn new(
        store: Arc<dyn BlobStore>,
        keys: Arc<dyn KeyFetcher>,
        bridge: Arc<dyn PrivacyBudgetBridge>,
        privacy: PrivacyParameters,
    ) -> Self {
        Self {
            store,
            decryptor: Decryptor::new(keys),
            bridge,
            validators: Arc::new(default_validators()),
            privacy,
            noise_override: None,
            threshold_override: None,
            thresholding_enabled: true,
            domain_optional: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Replace the distribution-backed noise source.
    pub fn with_noise(mut self, noise: Arc<dyn NoiseApplier>) -> Self {
        self.noise_override = Some(noise);
        self
    }

    /// Replace the threshold derived from the privacy parameters.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold_override = Some(threshold);
        self
    }

    pub fn with_thresholding(mut self, enabled: bool) -> Self {
        self.thresholding_enabled = enabled;
        self
    }

    pub fn with_domain_optional(mut self, enabled: bool) -> Self {
        self.domain_optional = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_validators(mut self, validators: Vec<Box<dyn ReportValidator>>) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    /// Process one job to completion. Failures are encoded in the result's
    /// return code; this never panics the caller's control loop.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub async fn process(&self, job: &JobRequest) -> JobResult {
        let params = match JobParameters::from_map(&job.parameters) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "rejecting job with invalid parameters");
                return JobResult::failure(
                    ReturnCode::InvalidJob,
                    e.to_string(),
                    ErrorSummary::new(),
                );
            }
        };

        let mut summary = ErrorSummary::new();

        let frozen = match self.aggregate_reports(job, &params, &mut summary).await {
            Ok(frozen) => frozen,
            Err(e) => {
                warn!(code = %e.code, error = %e.message, "job failed during aggregation");
                return JobResult::failure(e.code, e.message, summary);
            }
        };
        info!(
            buckets = frozen.len(),
            report_errors = summary.total_report_errors(),
            "input drained"
        );

        let domain_keys = match &params.output_domain {
            Some(location) => {
                match domain::read_output_domain(self.store.as_ref(), location).await {
                    Ok(keys) => {
                        info!(domain_buckets = keys.len(), "read output domain");
                        Some(keys)
                    }
                    Err(e) => {
                        return JobResult::failure(
                            ReturnCode::InputDataReadFailed,
                            e.to_string(),
                            summary,
                        )
                    }
                }
            }
            None => None,
        };

        let privacy = match params.debug_privacy_epsilon {
            Some(epsilon) => self.privacy.with_epsilon(epsilon),
            None => self.privacy,
        };
        let noise: Arc<dyn NoiseApplier> = match &self.noise_override {
            Some(noise) => Arc::clone(noise),
            None => Arc::new(DpNoise::new(privacy)),
        };
        let threshold = self
            .threshold_override
            .unwrap_or_else(|| privacy.default_threshold());
        let output = noise::run(
            &frozen,
            domain_keys.as_ref(),
            &RunConfig {
                noise: noise.as_ref(),
                threshold,
                thresholding_enabled: self.thresholding_enabled,
                domain_optional: self.domain_optional,
                debug_run: params.debug_run,
            },
        );

        let budget_failure = self.consume_budget(job, &params, &frozen).await;
        if let Some((code, message)) = &budget_failure {
            if !params.debug_run {
                return JobResult::failure(*code, message.clone(), summary);
            }
            warn!(code = %code, "budget failure tolerated in debug run");
        }

        let logger = ResultLogger::new(Arc::clone(&self.store));
        if let Err(e) = logger
            .write(&job.output, &output.summary, output.debug.as_deref())
            .await
        {
            return JobResult::failure(ReturnCode::ResultWriteError, e.to_string(), summary);
        }

        let return_code = match budget_failure {
            Some((ReturnCode::PrivacyBudgetExhausted, _)) => {
                ReturnCode::DebugSuccessWithPrivacyBudgetExhausted
            }
            Some(_) => ReturnCode::DebugSuccessWithPrivacyBudgetError,
            None if summary.total_report_errors() > 0 => ReturnCode::SuccessWithErrors,
            None => ReturnCode::Success,
        };
        info!(return_code = %return_code, facts = output.summary.len(), "job finished");
        JobResult {
            return_code,
            message: format!("wrote {} summary facts", output.summary.len()),
            error_summary: summary,
        }
    }

    /// Fan the input shards out over the worker pool and drain them into a
    /// frozen aggregation.
    async fn aggregate_reports(
        &self,
        job: &JobRequest,
        params: &JobParameters,
        summary: &mut ErrorSummary,
    ) -> Result<FrozenAggregation, ProcessError> {
        let shard_keys = self
            .store
            .list(&job.input.bucket, &job.input.prefix)
            .await
            .map_err(|e| ProcessError::new(ReturnCode::InputDataReadFailed, e.to_string()))?;
        if shard_keys.is_empty() {
            return Err(ProcessError::new(
                ReturnCode::InputDataReadFailed,
                format!(
                    "no report shards under {}/{}",
                    job.input.bucket, job.input.prefix
                ),
            ));
        }
        info!(shards = shard_keys.len(), "listed report shards");

        let context = Arc::new(ShardContext {
            store: Arc::clone(&self.store),
            decryptor: self.decryptor.clone(),
            validators: Arc::clone(&self.validators),
            params: params.clone(),
            state: AggregationState::new(),
            input_bucket: job.input.bucket.clone(),
        });

        let mut pipelines = stream::iter(shard_keys)
            .map(|key| {
                let context = Arc::clone(&context);
                tokio::spawn(async move { process_shard(context, key).await })
            })
            .buffer_unordered(self.concurrency);

        let mut records_seen = 0u64;
        let mut accepted = 0u64;
        while let Some(joined) = pipelines.next().await {
            let outcome = joined.map_err(|e| {
                ProcessError::new(
                    ReturnCode::InternalError,
                    format!("shard pipeline died: {e}"),
                )
            })??;
            records_seen += outcome.records;
            accepted += outcome.accepted;
            summary.merge(&outcome.errors);

            // Error-threshold early exit: the remaining shards are abandoned
            // without touching budget or output. A batch that is uniformly
            // unsupported-version is reported as such instead.
            let total_errors = summary.total_report_errors();
            if (total_errors as f64) * 100.0
                > params.report_error_threshold_percentage * (records_seen as f64)
            {
                if let Some(e) = uniform_version_failure(accepted, summary) {
                    return Err(e);
                }
                return Err(ProcessError::new(
                    ReturnCode::ReportsWithErrorsExceededThreshold,
                    format!(
                        "{total_errors} of {records_seen} reports failed, over the {}% threshold",
                        params.report_error_threshold_percentage
                    ),
                ));
            }
        }
        drop(pipelines);

        if let Some(e) = uniform_version_failure(accepted, summary) {
            return Err(e);
        }

        let frozen = context.state.freeze();
        summary.add_raw(ErrorCounter::NumSaturatedSums, frozen.saturated_count());
        Ok(frozen)
    }

    /// Debit the deduplicated unit set; `None` means the batch was paid for.
    async fn consume_budget(
        &self,
        job: &JobRequest,
        params: &JobParameters,
        frozen: &FrozenAggregation,
    ) -> Option<(ReturnCode, String)> {
        let units: Vec<PrivacyBudgetUnit> = frozen.units().into_iter().collect();
        if units.is_empty() {
            return None;
        }

        match self
            .bridge
            .consume(&job.job_id, &units, &params.attribution_report_to)
            .await
        {
            Ok(exhausted) if exhausted.is_empty() => None,
            Ok(exhausted) => Some((
                ReturnCode::PrivacyBudgetExhausted,
                format!(
                    "{} of {} privacy budget units exhausted",
                    exhausted.len(),
                    units.len()
                ),
            )),
            Err(budget::Error::Unauthenticated) => Some((
                ReturnCode::PrivacyBudgetAuthenticationError,
                budget::Error::Unauthenticated.to_string(),
            )),
            Err(budget::Error::Unauthorized) => Some((
                ReturnCode::PrivacyBudgetAuthorizationError,
                budget::Error::Unauthorized.to_string(),
            )),
            Err(e @ budget::Error::Transport(_)) => {
                Some((ReturnCode::InternalError, e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("privacy", &self.privacy)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// A batch whose every report was rejected for its version is a version
/// failure, not an error-rate failure.
fn uniform_version_failure(accepted: u64, summary: &ErrorSummary) -> Option<ProcessError> {
    if accepted == 0 && summary.all_errors_are(ErrorCounter::UnsupportedReportVersion) {
        Some(ProcessError::new(
            ReturnCode::UnsupportedReportVersion,
            "every report in the batch carries an unsupported version",
        ))
    } else {
        None
    }
}

struct ShardContext {
    store: Arc<dyn BlobStore>,
    decryptor: Decryptor,
    validators: Arc<Vec<Box<dyn ReportValidator>>>,
    params: JobParameters,
    state: AggregationState,
    input_bucket: String,
}

#[derive(Debug, Default)]
struct ShardOutcome {
    records: u64,
    accepted: u64,
    errors: ErrorSummary,
}

/// Stream one shard through decode, decrypt, validate, and accumulate.
async fn process_shard(
    context: Arc<ShardContext>,
    key: String,
) -> Result<ShardOutcome, ProcessError> {
    let bytes = context
        .store
        .get(&context.input_bucket, &key)
        .await
        .map_err(|e| {
            ProcessError::new(
                ReturnCode::InputDataReadFailed,
                format!("reading shard {key}: {e}"),
            )
        })?;
    let reports = codec::decode_report_shard(&bytes).map_err(|e| {
        ProcessError::new(
            ReturnCode::InputDataReadFailed,
            format!("decoding shard {key}: {e}"),
        )
    })?;

    let mut outcome = ShardOutcome::default();
    for encrypted in reports {
        outcome.records += 1;
        match context.decryptor.decrypt(&encrypted).await {
            Ok(report) => {
                if let Some(counter) = run_chain(&context.validators, &report, &context.params)
                {
                    outcome.errors.record(counter);
                    continue;
                }
                let unit = PrivacyBudgetUnit::for_report(&report.shared_info);
                for contribution in &report.contributions {
                    context
                        .state
                        .accept(contribution.bucket, contribution.value, &unit);
                }
                outcome.accepted += 1;
            }
            Err(DecryptError::KeyFetch(KeyFetchError::PermissionDenied(key_id))) => {
                return Err(ProcessError::new(
                    ReturnCode::PermissionError,
                    format!("key service denied access to key {key_id}"),
                ));
            }
            Err(DecryptError::KeyFetch(KeyFetchError::Unavailable(message))) => {
                return Err(ProcessError::new(
                    ReturnCode::InternalError,
                    format!("key service unavailable: {message}"),
                ));
            }
            Err(DecryptError::KeyFetch(KeyFetchError::Service(message))) => {
                debug!(error = %message, "key service failed for report");
                outcome.errors.record(ErrorCounter::ServiceError);
            }
            Err(e) => {
                debug!(error = %e, "report failed to decrypt");
                outcome.errors.record(ErrorCounter::DecryptionError);
            }
        }
    }
    debug!(shard = %key, records = outcome.records, accepted = outcome.accepted, "drained shard");
    Ok(outcome)
}
