use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use std::{fmt, io};

use backon::{ExponentialBuilder, Retryable as _};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONNECTION, HeaderMap, HeaderValue,
    UPGRADE_INSECURE_REQUESTS,
};
use reqwest::{Client, StatusCode};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};
use url::Url;

pub const LOG_TARGET: &str = "jobwatch::fetch";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Tokens that only appear when the real listings page was served, as
/// opposed to an interstitial or error page returned with a 200.
pub const DEFAULT_PAGE_SIGNATURES: &[&str] = &["offres-d-emploi", "contentpane"];

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// Extra time the browser gets on top of the settle period before it is
/// killed.
pub const BROWSER_GRACE: Duration = Duration::from_secs(30);

const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StrategyError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
    #[snafu(display("HTTP request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Unexpected HTTP status: {status}"))]
    Status { status: StatusCode },
    #[snafu(display("Page signature not found in {len} bytes of content"))]
    MissingSignature { len: usize },
    #[snafu(display("Failed to launch browser `{program}`: {source}"))]
    BrowserSpawn { program: String, source: io::Error },
    #[snafu(display("Failed to collect browser output: {source}"))]
    BrowserIo { source: io::Error },
    #[snafu(display("Browser exited with {status}: {stderr}"))]
    BrowserExit { status: ExitStatus, stderr: String },
    #[snafu(display("Browser did not finish within {timeout:?}"))]
    BrowserTimeout { timeout: Duration },
    #[snafu(display("Browser produced no page content"))]
    BrowserEmpty,
}

pub type StrategyResult<T> = std::result::Result<T, StrategyError>;

/// Final error of one strategy after its retry policy ran out.
#[derive(Debug)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub attempts: usize,
    pub error: StrategyError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt(s)): {}",
            self.strategy, self.attempts, self.error
        )
    }
}

struct FmtFailures<'a>(&'a [StrategyFailure]);

impl fmt::Display for FmtFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no strategies configured");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if 0 < i {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(failure, f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("Failed to fetch page with every strategy: {}", FmtFailures(failures)))]
    Exhausted { failures: Vec<StrategyFailure> },
}

impl FetchError {
    pub fn failures(&self) -> &[StrategyFailure] {
        match self {
            FetchError::Exhausted { failures } => failures,
        }
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// How many times a strategy is tried and how long to wait in between.
///
/// Delays grow exponentially from `base_delay`, doubling each retry, and
/// never exceed `max_delay`. A strategy is always tried at least once, even
/// with `max_attempts` set to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub const fn exponential(
        max_attempts: usize,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Retries without sleeping in between. Mostly useful in tests.
    pub const fn immediate(max_attempts: usize) -> Self {
        Self::exponential(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Policy of the direct HTTP strategy: 3 attempts, 2s base, 10s cap.
    pub const fn http_default() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(10))
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Successfully retrieved markup and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub markup: String,
    pub strategy: &'static str,
}

/// One way of retrieving the raw markup of a page.
#[async_trait::async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, url: &Url) -> StrategyResult<String>;
}

/// Tries its strategies in order, each under its own retry policy, and
/// returns the first markup obtained.
#[derive(Default)]
pub struct PageFetcher {
    strategies: Vec<(Box<dyn FetchStrategy>, RetryPolicy)>,
}

impl PageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct HTTP first, headless browser as a fallback.
    pub fn with_default_strategies(http: HttpStrategy, browser: BrowserStrategy) -> Self {
        Self::new()
            .with_strategy(http, RetryPolicy::http_default())
            .with_strategy(browser, RetryPolicy::once())
    }

    pub fn with_strategy(
        mut self,
        strategy: impl FetchStrategy + 'static,
        policy: RetryPolicy,
    ) -> Self {
        self.strategies.push((Box::new(strategy), policy));
        self
    }

    pub fn strategy_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.iter().map(|(s, _)| s.name())
    }

    pub async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        let mut failures = Vec::new();

        for (strategy, policy) in &self.strategies {
            let strategy = strategy.as_ref();
            let name = strategy.name();
            let mut attempts = 0;

            info!(target: LOG_TARGET, strategy = name, %url, "Fetching page");
            let res = (|| {
                attempts += 1;
                strategy.fetch(url)
            })
            .retry(policy.backoff())
            .notify(|err: &StrategyError, delay: Duration| {
                warn!(
                    target: LOG_TARGET,
                    strategy = name,
                    err = %err,
                    retry_in = ?delay,
                    "Fetch attempt failed, retrying"
                );
            })
            .await;

            match res {
                Ok(markup) => {
                    debug!(target: LOG_TARGET, strategy = name, attempts, len = markup.len(), "Page fetched");
                    return Ok(FetchedPage {
                        markup,
                        strategy: name,
                    });
                }
                Err(error) => {
                    warn!(target: LOG_TARGET, strategy = name, attempts, err = %error, "Fetch strategy exhausted");
                    failures.push(StrategyFailure {
                        strategy: name,
                        attempts,
                        error,
                    });
                }
            }
        }

        ExhaustedSnafu { failures }.fail()
    }
}

/// Returns true if `body` contains any of `signatures`, or if no signatures
/// are configured.
pub fn page_has_signature<S: AsRef<str>>(body: &str, signatures: &[S]) -> bool {
    signatures.is_empty() || signatures.iter().any(|s| body.contains(s.as_ref()))
}

fn preview(s: &str) -> String {
    s.chars().take(PREVIEW_CHARS).collect()
}

/// Plain HTTP GET posing as a desktop browser.
pub struct HttpStrategy {
    client: Client,
    signatures: Vec<String>,
}

impl HttpStrategy {
    pub fn new() -> StrategyResult<Self> {
        Self::with_options(DEFAULT_PAGE_SIGNATURES, DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_options<S: AsRef<str>>(
        signatures: &[S],
        timeout: Duration,
    ) -> StrategyResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr,fr-FR;q=0.8,en-US;q=0.5,en;q=0.3"),
        );
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context(BuildClientSnafu)?;

        Ok(Self {
            client,
            signatures: signatures.iter().map(|s| s.as_ref().to_owned()).collect(),
        })
    }
}

#[async_trait::async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &Url) -> StrategyResult<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        debug!(
            target: LOG_TARGET,
            %status,
            content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown"),
            "Received response"
        );
        if !status.is_success() {
            return StatusSnafu { status }.fail();
        }

        let body = response.text().await.context(HttpSnafu)?;
        if !page_has_signature(&body, &self.signatures) {
            debug!(target: LOG_TARGET, preview = %preview(&body), "Listings section not found");
            return MissingSignatureSnafu { len: body.len() }.fail();
        }

        Ok(body)
    }
}

/// Renders the page in a headless Chromium and dumps the resulting DOM.
///
/// The browser runs as a child process that is killed whenever the fetch
/// future completes or is dropped.
pub struct BrowserStrategy {
    program: String,
    settle: Duration,
    grace: Duration,
}

impl BrowserStrategy {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            settle: DEFAULT_SETTLE,
            grace: BROWSER_GRACE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn command_args(&self, url: &Url) -> Vec<String> {
        vec![
            "--headless=new".into(),
            "--no-sandbox".into(),
            "--disable-dev-shm-usage".into(),
            "--disable-gpu".into(),
            "--window-size=1920,1080".into(),
            format!("--user-agent={BROWSER_USER_AGENT}"),
            format!("--virtual-time-budget={}", self.settle.as_millis()),
            "--dump-dom".into(),
            url.to_string(),
        ]
    }
}

#[async_trait::async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch(&self, url: &Url) -> StrategyResult<String> {
        info!(target: LOG_TARGET, program = %self.program, settle = ?self.settle, "Launching headless browser");

        let child = tokio::process::Command::new(&self.program)
            .args(self.command_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(BrowserSpawnSnafu {
                program: self.program.clone(),
            })?;

        let timeout = self.settle + self.grace;
        // On timeout the child is dropped, and with it killed.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res.context(BrowserIoSnafu)?,
            Err(_) => return BrowserTimeoutSnafu { timeout }.fail(),
        };

        if !output.status.success() {
            return BrowserExitSnafu {
                status: output.status,
                stderr: preview(String::from_utf8_lossy(&output.stderr).trim()),
            }
            .fail();
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        if html.trim().is_empty() {
            return BrowserEmptySnafu.fail();
        }
        debug!(target: LOG_TARGET, len = html.len(), "Browser rendered page");

        Ok(html)
    }
}
