use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};
use tracing::info;
use url::Url;

pub const LOG_TARGET: &str = "jobwatch::notify";

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
pub const DEFAULT_SENDER: &str = "onboarding@resend.dev";

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum NotifyError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
    #[snafu(display("Invalid delivery endpoint: {source}"))]
    Endpoint { source: url::ParseError },
    #[snafu(display("Delivery request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Delivery rejected with {status}: {body}"))]
    Rejected { status: StatusCode, body: String },
}

pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

/// A channel reports are delivered through.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel_name(&self) -> &'static str;

    async fn send(&self, subject: &str, html: &str) -> NotifyResult<()>;
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Sends reports as email through the Resend HTTP API.
pub struct ResendNotifier {
    client: reqwest::Client,
    api_key: String,
    sender: String,
    receiver: String,
    endpoint: Url,
}

impl ResendNotifier {
    pub fn new(
        api_key: impl Into<String>,
        sender: impl Into<String>,
        receiver: impl Into<String>,
    ) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            endpoint: Url::parse(RESEND_ENDPOINT).context(EndpointSnafu)?,
        })
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    fn channel_name(&self) -> &'static str {
        "resend"
    }

    async fn send(&self, subject: &str, html: &str) -> NotifyResult<()> {
        let request = EmailRequest {
            from: &self.sender,
            to: [&self.receiver],
            subject,
            html,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return RejectedSnafu { status, body }.fail();
        }

        info!(
            target: LOG_TARGET,
            subject,
            receiver = %self.receiver,
            "Email sent"
        );
        Ok(())
    }
}

/// Accepts every report without delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    fn channel_name(&self) -> &'static str {
        "disabled"
    }

    async fn send(&self, subject: &str, _html: &str) -> NotifyResult<()> {
        info!(target: LOG_TARGET, subject, "Notifications disabled, skipping delivery");
        Ok(())
    }
}
