//! Per-report validation chain.
//!
//! Validators run in order after decryption; the first failure tags the
//! report with an [`ErrorCounter`] and the report contributes nothing to the
//! aggregation or the budget call.

use crate::error::ErrorCounter;
use crate::parameters::JobParameters;
use crate::report::{Report, SUPPORTED_MAJOR_VERSION};

/// One validation predicate; `None` means the report passes.
pub trait ReportValidator: Send + Sync {
    fn validate(&self, report: &Report, params: &JobParameters) -> Option<ErrorCounter>;
}

/// Rejects reports whose envelope major version is not the supported one.
pub struct ReportVersionValidator;

impl ReportValidator for ReportVersionValidator {
    fn validate(&self, report: &Report, _params: &JobParameters) -> Option<ErrorCounter> {
        if report.shared_info.major_version() == Some(SUPPORTED_MAJOR_VERSION) {
            None
        } else {
            Some(ErrorCounter::UnsupportedReportVersion)
        }
    }
}

/// Rejects reports whose reporting origin differs from the one the job
/// claimed; their budget would otherwise be debited against the wrong party.
pub struct ReportingOriginValidator;

impl ReportValidator for ReportingOriginValidator {
    fn validate(&self, report: &Report, params: &JobParameters) -> Option<ErrorCounter> {
        if report.shared_info.reporting_origin == params.attribution_report_to {
            None
        } else {
            Some(ErrorCounter::ReportingOriginMismatch)
        }
    }
}

/// The validators every job runs, in order.
pub fn default_validators() -> Vec<Box<dyn ReportValidator>> {
    vec![
        Box::new(ReportVersionValidator),
        Box::new(ReportingOriginValidator),
    ]
}

/// Run `report` through the chain, short-circuiting on the first failure.
pub fn run_chain(
    validators: &[Box<dyn ReportValidator>],
    report: &Report,
    params: &JobParameters,
) -> Option<ErrorCounter> {
    validators
        .iter()
        .find_map(|validator| validator.validate(report, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SharedInfo;
    use crate::testutil::shared_info_json;
    use std::collections::HashMap;

    fn report(origin: &str, version: &str) -> Report {
        Report {
            shared_info: SharedInfo::from_json(&shared_info_json(origin, version, 0)).unwrap(),
            contributions: vec![],
        }
    }

    fn params(origin: &str) -> JobParameters {
        JobParameters::from_map(&HashMap::from([(
            "attribution_report_to".to_string(),
            origin.to_string(),
        )]))
        .unwrap()
    }

    #[test]
    fn version_validator() {
        let validator = ReportVersionValidator;
        let params = params("https://adtech.example");

        assert_eq!(
            validator.validate(&report("https://adtech.example", "1.0"), &params),
            None
        );
        assert_eq!(
            validator.validate(&report("https://adtech.example", "1.99"), &params),
            None
        );
        assert_eq!(
            validator.validate(&report("https://adtech.example", "0.1"), &params),
            Some(ErrorCounter::UnsupportedReportVersion)
        );
        assert_eq!(
            validator.validate(&report("https://adtech.example", "2.0"), &params),
            Some(ErrorCounter::UnsupportedReportVersion)
        );
        assert_eq!(
            validator.validate(&report("https://adtech.example", "junk"), &params),
            Some(ErrorCounter::UnsupportedReportVersion)
        );
    }

    #[test]
    fn origin_validator() {
        let validator = ReportingOriginValidator;
        let params = params("https://adtech.example");

        assert_eq!(
            validator.validate(&report("https://adtech.example", "1.0"), &params),
            None
        );
        assert_eq!(
            validator.validate(&report("https://other.example", "1.0"), &params),
            Some(ErrorCounter::ReportingOriginMismatch)
        );
    }

    #[test]
    fn chain_short_circuits_in_order() {
        let validators = default_validators();
        let params = params("https://adtech.example");

        // Both validators would fire; the version validator runs first.
        assert_eq!(
            run_chain(&validators, &report("https://other.example", "0.1"), &params),
            Some(ErrorCounter::UnsupportedReportVersion)
        );
        assert_eq!(
            run_chain(&validators, &report("https://other.example", "1.0"), &params),
            Some(ErrorCounter::ReportingOriginMismatch)
        );
        assert_eq!(
            run_chain(&validators, &report("https://adtech.example", "1.0"), &params),
            None
        );
    }
}
