//! HTML rendering of new postings for the notification body.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use maud::{DOCTYPE, Markup, html};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, info, warn};
use url::Url;

use crate::posting::Posting;

pub const LOG_TARGET: &str = "jobwatch::format";

pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";

const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const REPORT_TITLE: &str = "New Job Listings";

const SYSTEM_PROMPT: &str = "You design HTML emails that announce job postings. \
Produce one complete HTML document (DOCTYPE, html, head, body) that renders in common email \
clients such as Outlook and Gmail. Use a single column at most 600px wide, web-safe fonts \
and inline `style` attributes only, no <style> blocks or external stylesheets. Prefer tables \
for layout. Group the postings by location under a clear heading per location. Make every \
title stand out, show the company and location below it, and give each posting an \
`Apply Here` <a> link to its URL. Emojis are welcome. Reply with the HTML only.";

#[derive(Debug, Snafu)]
pub enum FormatError {
    #[snafu(display("Failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
    #[snafu(display("Invalid completion endpoint: {source}"))]
    Endpoint { source: url::ParseError },
    #[snafu(display("Completion request failed: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("Completion endpoint returned {status}: {body}"))]
    Status { status: StatusCode, body: String },
    #[snafu(display("Completion reply has no content"))]
    EmptyReply,
}

pub type FormatResult<T> = std::result::Result<T, FormatError>;

/// Turns a non-empty list of postings into an HTML document.
#[async_trait]
pub trait ContentRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, postings: &[Posting]) -> FormatResult<String>;
}

/// Postings grouped by location, groups and members in first-seen order.
fn group_by_location(postings: &[Posting]) -> Vec<(&str, Vec<&Posting>)> {
    let mut groups: Vec<(&str, Vec<&Posting>)> = Vec::new();
    for posting in postings {
        match groups
            .iter()
            .position(|(location, _)| *location == posting.location)
        {
            Some(i) => groups[i].1.push(posting),
            None => groups.push((&posting.location, vec![posting])),
        }
    }
    groups
}

fn render_posting(posting: &Posting) -> Markup {
    html! {
        div style="border: 1px solid #ddd; padding: 15px; margin-bottom: 15px; border-radius: 5px;" {
            h3 style="margin-top: 0; color: #2a5885;" { "📋 " (posting.title) }
            p style="margin: 5px 0;" { "🏢 " (posting.company) }
            p style="margin: 5px 0;" { "📍 " (posting.location) }
            p style="margin: 5px 0;" {
                a href=(posting.link) style="color: #0066cc;" { "🔗 Apply Here" }
            }
        }
    }
}

/// Deterministic email body: one section per location.
pub fn basic_html(postings: &[Posting]) -> String {
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="UTF-8";
                title { (REPORT_TITLE) }
            }
            body style="font-family: Arial, Helvetica, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;" {
                h1 style="color: #333; text-align: center;" { (REPORT_TITLE) }
                @for (location, members) in group_by_location(postings) {
                    div style="margin-bottom: 30px;" {
                        h2 style="background-color: #f0f0f0; padding: 10px; border-radius: 5px;" {
                            "📍 " (location)
                        }
                        @for posting in members {
                            (render_posting(posting))
                        }
                    }
                }
            }
        }
    }
    .into_string()
}

/// Body of the notification sent when a run fails.
pub fn failure_html(message: &str) -> String {
    html! {
        p { "Critical error: " (message) }
    }
    .into_string()
}

/// Strip the markdown code fences chat models like to wrap HTML in.
pub fn strip_code_fences(reply: &str) -> String {
    let mut content = reply.trim();

    if content.starts_with("```") {
        content = match content.find('\n') {
            Some(newline) => &content[newline + 1..],
            // Single line reply: drop the fence and any language tag before the markup.
            None => content
                .trim_start_matches('`')
                .trim_start_matches(|c: char| c.is_ascii_alphanumeric())
                .trim_start(),
        };
    }
    if let Some(stripped) = content.strip_suffix("```") {
        content = stripped.trim_end();
    }

    if content.contains("```") {
        warn!(target: LOG_TARGET, "Reply contains stray code fences, dropping them");
        return content
            .lines()
            .filter(|line| line.trim() != "```")
            .collect::<Vec<_>>()
            .join("\n");
    }

    content.to_owned()
}

fn postings_prompt(postings: &[Posting]) -> String {
    let mut prompt = String::from(
        "Format these new job postings into an HTML email grouped by location:\n",
    );
    for p in postings {
        let _ = write!(
            prompt,
            "\nTitle: {}\nCompany: {}\nLocation: {}\nLink: {}\n",
            p.title, p.company, p.location, p.link
        );
    }
    prompt
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    max_completion_tokens: u32,
    top_p: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Renders postings with an OpenAI-compatible chat completion endpoint.
pub struct LlmRenderer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: Url,
}

impl LlmRenderer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> FormatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: Url::parse(DEFAULT_LLM_ENDPOINT).context(EndpointSnafu)?,
        })
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl ContentRenderer for LlmRenderer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn render(&self, postings: &[Posting]) -> FormatResult<String> {
        let prompt = postings_prompt(postings);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.7,
            max_completion_tokens: 4096,
            top_p: 0.95,
            stream: false,
        };

        debug!(target: LOG_TARGET, endpoint = %self.endpoint, model = %self.model, "Requesting completion");
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context(RequestSnafu)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu { status, body }.fail();
        }

        let reply: ChatResponse = response.json().await.context(RequestSnafu)?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .context(EmptyReplySnafu)?;

        let html = strip_code_fences(&content);
        if html.is_empty() {
            return EmptyReplySnafu.fail();
        }
        Ok(html)
    }
}

/// Produces the notification body. Never fails.
///
/// An optional renderer is tried first; on any error the deterministic
/// [`basic_html`] rendering is used instead.
#[derive(Default)]
pub struct Formatter {
    renderer: Option<Box<dyn ContentRenderer>>,
}

impl Formatter {
    pub fn basic() -> Self {
        Self::default()
    }

    pub fn with_renderer(renderer: impl ContentRenderer + 'static) -> Self {
        Self {
            renderer: Some(Box::new(renderer)),
        }
    }

    pub async fn format(&self, postings: &[Posting]) -> String {
        if postings.is_empty() {
            return String::new();
        }

        if let Some(renderer) = &self.renderer {
            match renderer.render(postings).await {
                Ok(html) => {
                    info!(target: LOG_TARGET, renderer = renderer.name(), "Postings formatted");
                    return html;
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        renderer = renderer.name(),
                        err = %err,
                        "Formatting failed, falling back to basic HTML"
                    );
                }
            }
        }

        basic_html(postings)
    }
}
