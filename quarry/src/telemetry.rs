//! Tracing and telemetry helpers for quarry.
//!
//! Span constructors for the job lifecycle plus thin recording functions
//! that feed the `metrics` module when that feature is enabled and cost
//! nothing when it is not.

use tracing::{info_span, Span};

use crate::holder::RunResult;

/// Create a tracing span for one job attempt.
#[must_use]
pub fn job_run_span(job_id: impl AsRef<str>, kind: &str, run_count: u32) -> Span {
    info_span!(
        "quarry.run",
        job_id = %job_id.as_ref(),
        job_kind = kind,
        run_count,
    )
}

/// Label used for the outcome of an attempt.
#[must_use]
pub fn outcome_label(result: &RunResult) -> &'static str {
    match result {
        RunResult::Success => "success",
        RunResult::TryAgain { .. } => "retry",
        RunResult::FailRunLimit
        | RunResult::FailForCancel
        | RunResult::FailSingleId
        | RunResult::FailShouldReRun => "cancelled",
    }
}

/// Record a job acceptance.
pub fn record_job_added(kind: &str) {
    #[cfg(feature = "metrics")]
    crate::metrics::JOBS_ADDED_TOTAL
        .with_label_values(&[kind])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record a finished attempt and its duration.
pub fn record_job_finished(kind: &str, result: &RunResult, duration_secs: f64) {
    #[cfg(feature = "metrics")]
    {
        crate::metrics::JOBS_FINISHED_TOTAL
            .with_label_values(&[kind, outcome_label(result)])
            .inc();
        crate::metrics::JOB_DURATION_SECONDS
            .with_label_values(&[kind])
            .observe(duration_secs);
    }
    #[cfg(not(feature = "metrics"))]
    {
        let _ = (kind, result, duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RetryConstraint;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&RunResult::Success), "success");
        assert_eq!(
            outcome_label(&RunResult::TryAgain {
                constraint: RetryConstraint::default()
            }),
            "retry"
        );
        assert_eq!(outcome_label(&RunResult::FailRunLimit), "cancelled");
    }

    #[test]
    fn test_span_carries_job_fields() {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let span = job_run_span("0192f0c1", "adhoc", 2);
            assert!(!span.is_disabled() || span.is_none());
        });
    }
}
