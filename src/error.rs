//! Job failure taxonomy and per-report error accounting.
//!
//! Failures travel one of two channels. Per-report problems are counted in an
//! [`ErrorSummary`] and never abort the job by themselves; job-fatal problems
//! are a single [`ProcessError`] carrying a [`ReturnCode`] and terminate the
//! pipeline without writing results or debiting budget.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Terminal status of a job, surfaced as `ResultInfo.return_code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ReturnCode {
    Success,
    SuccessWithErrors,
    ReportsWithErrorsExceededThreshold,
    InputDataReadFailed,
    UnsupportedReportVersion,
    InvalidJob,
    PermissionError,
    InternalError,
    PrivacyBudgetExhausted,
    PrivacyBudgetAuthenticationError,
    PrivacyBudgetAuthorizationError,
    ResultWriteError,
    DebugSuccessWithPrivacyBudgetError,
    DebugSuccessWithPrivacyBudgetExhausted,
}

impl ReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SuccessWithErrors => "SUCCESS_WITH_ERRORS",
            Self::ReportsWithErrorsExceededThreshold => {
                "REPORTS_WITH_ERRORS_EXCEEDED_THRESHOLD"
            }
            Self::InputDataReadFailed => "INPUT_DATA_READ_FAILED",
            Self::UnsupportedReportVersion => "UNSUPPORTED_REPORT_VERSION",
            Self::InvalidJob => "INVALID_JOB",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::PrivacyBudgetExhausted => "PRIVACY_BUDGET_EXHAUSTED",
            Self::PrivacyBudgetAuthenticationError => "PRIVACY_BUDGET_AUTHENTICATION_ERROR",
            Self::PrivacyBudgetAuthorizationError => "PRIVACY_BUDGET_AUTHORIZATION_ERROR",
            Self::ResultWriteError => "RESULT_WRITE_ERROR",
            Self::DebugSuccessWithPrivacyBudgetError => {
                "DEBUG_SUCCESS_WITH_PRIVACY_BUDGET_ERROR"
            }
            Self::DebugSuccessWithPrivacyBudgetExhausted => {
                "DEBUG_SUCCESS_WITH_PRIVACY_BUDGET_EXHAUSTED"
            }
        }
    }

    /// Whether the job produced output. Debug runs that out-ran a budget
    /// failure still count as successes.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::SuccessWithErrors
                | Self::DebugSuccessWithPrivacyBudgetError
                | Self::DebugSuccessWithPrivacyBudgetExhausted
        )
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classes of per-report problems tracked in the error summary.
///
/// Every increment of a report-scoped counter also increments
/// `NumReportsWithErrors`; `NumSaturatedSums` is bucket-scoped bookkeeping and
/// is excluded from that total.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub enum ErrorCounter {
    DecryptionError,
    ServiceError,
    UnsupportedReportVersion,
    ReportingOriginMismatch,
    NumSaturatedSums,
    NumReportsWithErrors,
}

impl ErrorCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecryptionError => "DECRYPTION_ERROR",
            Self::ServiceError => "SERVICE_ERROR",
            Self::UnsupportedReportVersion => "UNSUPPORTED_REPORT_VERSION",
            Self::ReportingOriginMismatch => "REPORTING_ORIGIN_MISMATCH",
            Self::NumSaturatedSums => "NUM_SATURATED_SUMS",
            Self::NumReportsWithErrors => "NUM_REPORTS_WITH_ERRORS",
        }
    }
}

impl fmt::Display for ErrorCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running error accounting for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorSummary {
    counts: BTreeMap<ErrorCounter, u64>,
}

impl ErrorSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one report-scoped error under `counter`.
    pub fn record(&mut self, counter: ErrorCounter) {
        *self.counts.entry(counter).or_insert(0) += 1;
        *self.counts.entry(ErrorCounter::NumReportsWithErrors).or_insert(0) += 1;
    }

    /// Add to a counter without touching the report-error total.
    pub fn add_raw(&mut self, counter: ErrorCounter, n: u64) {
        if n > 0 {
            *self.counts.entry(counter).or_insert(0) += n;
        }
    }

    /// Fold another summary (e.g. one shard's) into this one.
    pub fn merge(&mut self, other: &ErrorSummary) {
        for (counter, n) in &other.counts {
            *self.counts.entry(*counter).or_insert(0) += n;
        }
    }

    /// Total number of reports that failed, across all counters.
    pub fn total_report_errors(&self) -> u64 {
        self.counts
            .get(&ErrorCounter::NumReportsWithErrors)
            .copied()
            .unwrap_or(0)
    }

    pub fn count(&self, counter: ErrorCounter) -> u64 {
        self.counts.get(&counter).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<ErrorCounter, u64> {
        &self.counts
    }

    /// True when every recorded report error is `counter`.
    pub fn all_errors_are(&self, counter: ErrorCounter) -> bool {
        let total = self.total_report_errors();
        total > 0 && self.count(counter) == total
    }
}

/// A job-fatal failure: return code plus human-readable context.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProcessError {
    pub code: ReturnCode,
    pub message: String,
}

impl ProcessError {
    pub fn new(code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Final outcome handed back to the job lifecycle layer.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub return_code: ReturnCode,
    pub message: String,
    pub error_summary: ErrorSummary,
}

impl JobResult {
    pub fn failure(code: ReturnCode, message: impl Into<String>, summary: ErrorSummary) -> Self {
        Self {
            return_code: code,
            message: message.into(),
            error_summary: summary,
        }
    }
}
