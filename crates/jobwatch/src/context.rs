use tracing::{Span, info_span};
use url::Url;

use crate::LOG_TARGET;
use crate::posting::Timestamp;

/// Per-run logging and clock context.
///
/// Created by the caller for exactly one pipeline run and handed to every
/// stage, so nothing in the pipeline reaches for global state to decide the
/// observation time or where its log lines belong.
#[derive(Debug, Clone)]
pub struct RunContext {
    observed_at: Timestamp,
    span: Span,
}

impl RunContext {
    pub fn new(target: &Url) -> Self {
        Self::with_observed_at(target, Timestamp::now())
    }

    pub fn with_observed_at(target: &Url, observed_at: Timestamp) -> Self {
        let span = info_span!(
            target: LOG_TARGET,
            "run",
            url = %target,
            observed_at = %observed_at,
        );
        Self { observed_at, span }
    }

    /// Timestamp stamped on every posting parsed during this run.
    pub fn observed_at(&self) -> Timestamp {
        self.observed_at
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
