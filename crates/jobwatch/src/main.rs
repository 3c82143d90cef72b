use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::builder::BoolishValueParser;
use jobwatch::PROJECT_NAME;
use jobwatch::context::RunContext;
use jobwatch::fetcher::{BrowserStrategy, FetchError, HttpStrategy, PageFetcher, StrategyError};
use jobwatch::formatter::{DEFAULT_LLM_MODEL, FormatError, Formatter, LlmRenderer};
use jobwatch::notifier::{DEFAULT_SENDER, NotifyError, ResendNotifier};
use jobwatch::parser::{DEFAULT_SITE_ORIGIN, ListingParser, ParserError};
use jobwatch::pipeline::{DEFAULT_SUBJECT_LABEL, Pipeline};
use jobwatch::posting::{DEFAULT_KEYWORDS, DEFAULT_LOCATIONS, FilterCriteria, Timestamp};
use jobwatch::store::{PostingStore, StoreError};
use serde_json::json;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

pub const LOG_TARGET: &str = "jobwatch::main";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(display("No page to watch, set --url or SCRAPER_URL"))]
    MissingUrl,
    #[snafu(display("Fetcher setup error: {source}"))]
    FetcherSetup { source: StrategyError },
    #[snafu(display("Fetch error: {source}"))]
    Fetch { source: FetchError },
    #[snafu(display("Parser error: {source}"))]
    Parser { source: ParserError },
    #[snafu(display("Formatter error: {source}"))]
    Formatter { source: FormatError },
    #[snafu(display("Notifier error: {source}"))]
    Notifier { source: NotifyError },
    #[snafu(display("Store error: {source}"))]
    Store { source: StoreError },
    #[snafu(display("Failed to read {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to encode output: {source}"))]
    Json { source: serde_json::Error },
    #[snafu(display("{message}"))]
    RunFailed { message: String },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

/// Jobwatch - watches a job board page and reports new developer postings
#[derive(Debug, Parser)]
#[command(name = PROJECT_NAME, version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Listings page to watch
    #[arg(long, env = "SCRAPER_URL", global = true)]
    pub url: Option<Url>,

    /// Origin relative posting links are resolved against
    #[arg(long, env = "SITE_ORIGIN", default_value = DEFAULT_SITE_ORIGIN, global = true)]
    pub site_origin: Url,

    /// CSV file holding every posting seen so far
    #[arg(long, env = "JOBS_CSV_PATH", default_value = "data/jobs.csv", global = true)]
    pub data_file: PathBuf,

    /// Title keywords, comma separated
    #[arg(long, env = "JOBWATCH_KEYWORDS", value_delimiter = ',', global = true)]
    pub keywords: Vec<String>,

    /// Accepted locations, comma separated
    #[arg(long, env = "JOBWATCH_LOCATIONS", value_delimiter = ',', global = true)]
    pub locations: Vec<String>,

    /// Headless browser used when plain HTTP fails
    #[arg(long, env = "CHROME_BIN", default_value = "chromium", global = true)]
    pub browser: String,

    /// Seconds the browser lets scripts run before dumping the page
    #[arg(long, env = "JOBWATCH_SETTLE_SECS", default_value = "5", global = true)]
    pub settle_secs: u64,

    /// Deliver reports by email (accepts true/false, yes/no, on/off, 1/0)
    #[arg(
        long,
        env = "SEND_EMAIL",
        global = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub send_email: bool,

    #[arg(long, env = "RESEND_API_KEY", hide_env_values = true, global = true)]
    pub resend_api_key: Option<String>,

    #[arg(long, env = "EMAIL_SENDER", default_value = DEFAULT_SENDER, global = true)]
    pub email_sender: String,

    #[arg(long, env = "EMAIL_RECEIVER", global = true)]
    pub email_receiver: Option<String>,

    /// Enables LLM formatting of reports
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true, global = true)]
    pub groq_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_LLM_MODEL, global = true)]
    pub llm_model: String,

    /// Label in notification subjects
    #[arg(long, env = "JOBWATCH_SUBJECT_LABEL", default_value = DEFAULT_SUBJECT_LABEL, global = true)]
    pub subject_label: String,
}

impl Opts {
    fn criteria(&self) -> FilterCriteria {
        let keywords: Vec<&str> = if self.keywords.is_empty() {
            DEFAULT_KEYWORDS.to_vec()
        } else {
            self.keywords.iter().map(String::as_str).collect()
        };
        let locations: Vec<&str> = if self.locations.is_empty() {
            DEFAULT_LOCATIONS.to_vec()
        } else {
            self.locations.iter().map(String::as_str).collect()
        };
        FilterCriteria::new(keywords, locations)
    }

    fn url(&self) -> CliResult<Url> {
        self.url.clone().context(MissingUrlSnafu)
    }

    fn store(&self) -> PostingStore {
        PostingStore::new(&self.data_file)
    }

    fn parser(&self) -> CliResult<ListingParser> {
        ListingParser::new(self.criteria(), self.site_origin.clone()).context(ParserSnafu)
    }

    fn fetcher(&self) -> CliResult<PageFetcher> {
        let http = HttpStrategy::new().context(FetcherSetupSnafu)?;
        let browser = BrowserStrategy::new(&self.browser)
            .with_settle(Duration::from_secs(self.settle_secs));
        Ok(PageFetcher::with_default_strategies(http, browser))
    }

    fn formatter(&self) -> CliResult<Formatter> {
        Ok(match &self.groq_api_key {
            Some(key) => Formatter::with_renderer(
                LlmRenderer::new(key, &self.llm_model).context(FormatterSnafu)?,
            ),
            None => {
                info!(target: LOG_TARGET, "No LLM key configured, using basic formatting");
                Formatter::basic()
            }
        })
    }

    fn pipeline(&self) -> CliResult<Pipeline> {
        let pipeline = Pipeline::new(self.url()?, self.fetcher()?, self.parser()?, self.store())
            .with_formatter(self.formatter()?)
            .with_subject_label(&self.subject_label);

        if !self.send_email {
            info!(target: LOG_TARGET, "Email delivery disabled");
            return Ok(pipeline);
        }
        match (&self.resend_api_key, &self.email_receiver) {
            (Some(key), Some(receiver)) => Ok(pipeline.with_notifier(
                ResendNotifier::new(key, &self.email_sender, receiver).context(NotifierSnafu)?,
            )),
            _ => {
                warn!(
                    target: LOG_TARGET,
                    "Email delivery requested but API key or receiver missing, disabling it"
                );
                Ok(pipeline)
            }
        }
    }
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Run the pipeline once (default)
    Run,
    /// Reset the stored postings
    Clear,
    /// Print stored postings, newest first
    List,
    /// Development commands
    Dev {
        #[command(subcommand)]
        dev_command: DevCommand,
    },
}

#[derive(Debug, Parser)]
pub enum DevCommand {
    /// Fetch the watched page and report which strategy got it
    Fetch,
    /// Parse a saved page and print matching postings
    Parse {
        #[arg(long)]
        file: PathBuf,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    let dotenv = dotenvy::dotenv();
    init_logging()?;
    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!(target: LOG_TARGET, err = %err, "Failed to load .env file");
        }
    }

    let opts = Opts::parse();

    match &opts.command {
        None | Some(Command::Run) => run(&opts).await,
        Some(Command::Clear) => clear(&opts),
        Some(Command::List) => list(&opts),
        Some(Command::Dev { dev_command }) => handle_dev_command(&opts, dev_command).await,
    }
}

async fn run(opts: &Opts) -> CliResult<()> {
    let pipeline = opts.pipeline()?;
    info!(
        target: LOG_TARGET,
        url = %pipeline.url(),
        data_file = %pipeline.store().path().display(),
        "Starting run"
    );

    let cx = RunContext::new(pipeline.url());
    let report = pipeline.run_once(&cx).await;

    let output = json!({
        "success": report.is_success(),
        "new_postings": report.new_postings.len(),
        "message": report.message(),
    });
    println!("{}", serde_json::to_string_pretty(&output).context(JsonSnafu)?);

    match report.error {
        Some(message) => RunFailedSnafu { message }.fail(),
        None => Ok(()),
    }
}

fn clear(opts: &Opts) -> CliResult<()> {
    let store = opts.store();
    store.clear().context(StoreSnafu)?;
    println!(
        "{}",
        json!({ "success": true, "message": format!("Cleared {}", store.path().display()) })
    );
    Ok(())
}

fn list(opts: &Opts) -> CliResult<()> {
    let mut postings = opts.store().try_load().context(StoreSnafu)?;
    // stable sort keeps insertion order among equal timestamps
    postings.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    println!(
        "{}",
        serde_json::to_string_pretty(&postings).context(JsonSnafu)?
    );
    Ok(())
}

async fn handle_dev_command(opts: &Opts, dev_command: &DevCommand) -> CliResult<()> {
    match dev_command {
        DevCommand::Fetch => {
            let url = opts.url()?;
            let fetcher = opts.fetcher()?;
            info!(
                target: LOG_TARGET,
                strategies = ?fetcher.strategy_names().collect::<Vec<_>>(),
                "Testing fetch"
            );

            match fetcher.fetch(&url).await {
                Ok(page) => {
                    println!(
                        "Fetched {} bytes from {url} using {}",
                        page.markup.len(),
                        page.strategy
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Failed to fetch {url}:");
                    for failure in e.failures() {
                        eprintln!("  {failure}");
                    }
                    Err(CliError::Fetch { source: e })
                }
            }
        }
        DevCommand::Parse { file } => {
            let markup = std::fs::read_to_string(file).context(ReadFileSnafu { path: file })?;
            let postings = opts.parser()?.parse(&markup, Timestamp::now());

            println!("Found {} matching posting(s):", postings.len());
            println!();
            for (i, posting) in postings.iter().enumerate() {
                println!("Posting {}:", i + 1);
                println!("  Title: {}", posting.title);
                println!("  Company: {}", posting.company);
                println!("  Location: {}", posting.location);
                println!("  Link: {}", posting.link);
                println!();
            }
            Ok(())
        }
    }
}

pub fn init_logging() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CliError::Logging)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    fn send_email(args: &[&str]) -> bool {
        let mut argv = vec![PROJECT_NAME];
        argv.extend_from_slice(args);
        Opts::try_parse_from(argv).unwrap().send_email
    }

    #[test]
    fn command_is_named_after_the_project() {
        assert_eq!(Opts::command().get_name(), PROJECT_NAME);
    }

    #[test]
    fn send_email_accepts_boolish_values() {
        for value in ["True", "TRUE", "true", "yes", "1", "on"] {
            assert!(send_email(&[format!("--send-email={value}").as_str(), "clear"]), "{value}");
        }
        for value in ["False", "false", "no", "0", "off"] {
            assert!(!send_email(&[format!("--send-email={value}").as_str(), "clear"]), "{value}");
        }
    }

    #[test]
    fn bare_send_email_flag_enables_delivery() {
        assert!(send_email(&["--send-email", "run"]));
        assert!(send_email(&["run", "--send-email"]));
    }

    #[test]
    fn send_email_rejects_garbage() {
        assert!(Opts::try_parse_from([PROJECT_NAME, "--send-email=maybe"]).is_err());
    }
}
