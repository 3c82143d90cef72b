use serde::Serialize;
use tracing::{Instrument as _, debug, error, info, warn};
use url::Url;

use crate::context::RunContext;
use crate::detector;
use crate::fetcher::PageFetcher;
use crate::formatter::{self, Formatter};
use crate::notifier::{DisabledNotifier, Notifier};
use crate::parser::ListingParser;
use crate::posting::Posting;
use crate::store::PostingStore;

pub const LOG_TARGET: &str = "jobwatch::pipeline";

pub const DEFAULT_SUBJECT_LABEL: &str = "Kelio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    Fetching,
    Parsing,
    Diffing,
    EmptyResult,
    Saving,
    Notifying,
    Done,
    Error,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every stage the run went through, in order.
    pub stages: Vec<RunStage>,
    pub new_postings: Vec<Posting>,
    /// Whether the notifier accepted the report of new postings.
    pub notified: bool,
    pub error: Option<String>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            stages: vec![RunStage::Start],
            new_postings: Vec::new(),
            notified: false,
            error: None,
        }
    }

    fn enter(&mut self, stage: RunStage) {
        debug!(target: LOG_TARGET, ?stage, "Entering stage");
        self.stages.push(stage);
    }

    pub fn final_stage(&self) -> RunStage {
        self.stages.last().copied().unwrap_or(RunStage::Start)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// One-line human readable summary.
    pub fn message(&self) -> String {
        match &self.error {
            Some(err) => format!("Run failed: {err}"),
            None if self.new_postings.is_empty() => "No new postings".to_owned(),
            None => format!("Found {} new posting(s)", self.new_postings.len()),
        }
    }
}

/// Fetch, parse, diff, persist and report for one watched page.
pub struct Pipeline {
    url: Url,
    fetcher: PageFetcher,
    parser: ListingParser,
    store: PostingStore,
    formatter: Formatter,
    notifier: Box<dyn Notifier>,
    subject_label: String,
}

impl Pipeline {
    pub fn new(url: Url, fetcher: PageFetcher, parser: ListingParser, store: PostingStore) -> Self {
        Self {
            url,
            fetcher,
            parser,
            store,
            formatter: Formatter::basic(),
            notifier: Box::new(DisabledNotifier),
            subject_label: DEFAULT_SUBJECT_LABEL.to_owned(),
        }
    }

    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_subject_label(mut self, label: impl Into<String>) -> Self {
        self.subject_label = label.into();
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn store(&self) -> &PostingStore {
        &self.store
    }

    pub fn report_subject(&self, count: usize) -> String {
        format!(
            "[{}] {count} new developer job posting(s)",
            self.subject_label
        )
    }

    pub fn failure_subject(&self) -> String {
        format!("[{} Scraper] Notification", self.subject_label)
    }

    /// Execute one run. Never fails: errors end up in the report.
    pub async fn run_once(&self, cx: &RunContext) -> RunReport {
        self.run_stages(cx).instrument(cx.span().clone()).await
    }

    async fn run_stages(&self, cx: &RunContext) -> RunReport {
        let mut report = RunReport::new();
        info!(target: LOG_TARGET, "Run started");

        let known_titles = self.store.known_titles();
        debug!(target: LOG_TARGET, known = known_titles.len(), "Known titles loaded");

        report.enter(RunStage::Fetching);
        let page = match self.fetcher.fetch(&self.url).await {
            Ok(page) => page,
            Err(err) => return self.fail(report, err.to_string()).await,
        };
        info!(
            target: LOG_TARGET,
            strategy = page.strategy,
            len = page.markup.len(),
            "Page fetched"
        );

        report.enter(RunStage::Parsing);
        let parsed = self.parser.parse(&page.markup, cx.observed_at());

        report.enter(RunStage::Diffing);
        let new_postings = detector::diff(&parsed, &known_titles);
        info!(
            target: LOG_TARGET,
            parsed = parsed.len(),
            new = new_postings.len(),
            "Change detection done"
        );

        if new_postings.is_empty() {
            report.enter(RunStage::EmptyResult);
            report.enter(RunStage::Done);
            info!(target: LOG_TARGET, "No new postings");
            return report;
        }
        report.new_postings = new_postings;

        report.enter(RunStage::Saving);
        if let Err(err) = self.store.merge_and_save(&report.new_postings) {
            return self.fail(report, err.to_string()).await;
        }

        report.enter(RunStage::Notifying);
        let html = self.formatter.format(&report.new_postings).await;
        let subject = self.report_subject(report.new_postings.len());
        match self.notifier.send(&subject, &html).await {
            Ok(()) => report.notified = true,
            Err(err) => warn!(
                target: LOG_TARGET,
                channel = self.notifier.channel_name(),
                err = %err,
                "Failed to deliver report"
            ),
        }

        report.enter(RunStage::Done);
        info!(
            target: LOG_TARGET,
            new = report.new_postings.len(),
            notified = report.notified,
            "Run finished"
        );
        report
    }

    async fn fail(&self, mut report: RunReport, message: String) -> RunReport {
        let failed_in = report.final_stage();
        report.enter(RunStage::Error);
        error!(target: LOG_TARGET, stage = ?failed_in, err = %message, "Run failed");

        let body = formatter::failure_html(&message);
        if let Err(err) = self.notifier.send(&self.failure_subject(), &body).await {
            warn!(
                target: LOG_TARGET,
                channel = self.notifier.channel_name(),
                err = %err,
                "Failed to deliver failure notification"
            );
        }

        report.error = Some(message);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_message_summarizes_outcome() {
        let mut report = RunReport::new();
        assert_eq!(report.message(), "No new postings");
        assert_eq!(report.final_stage(), RunStage::Start);

        report.new_postings.push(Posting {
            title: "Dev".into(),
            link: "https://www.bodet.com/1".into(),
            company: String::new(),
            location: "Cholet".into(),
            observed_at: "2024-01-01 00:00".parse().unwrap(),
        });
        assert_eq!(report.message(), "Found 1 new posting(s)");

        report.enter(RunStage::Error);
        report.error = Some("boom".into());
        assert!(!report.is_success());
        assert_eq!(report.message(), "Run failed: boom");
        assert_eq!(report.final_stage(), RunStage::Error);
    }

    #[test]
    fn stages_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStage::EmptyResult).unwrap(),
            "\"empty_result\""
        );
    }
}
