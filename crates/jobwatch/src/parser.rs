use scraper::{ElementRef, Html, Selector};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, info, warn};
use url::Url;

use crate::posting::{FilterCriteria, Posting, Timestamp};

pub const LOG_TARGET: &str = "jobwatch::parse";

/// Origin relative posting links are resolved against.
pub const DEFAULT_SITE_ORIGIN: &str = "https://www.bodet.com";

/// Listing rows alternate between these two classes.
const ROW_SELECTOR: &str = "tr.sectiontableentry1, tr.sectiontableentry2";
/// Any row of the listings table, used when the classes are missing.
const FALLBACK_ROW_SELECTOR: &str = "table.contentpane tr";

const MIN_CELLS: usize = 4;

#[derive(Debug, Snafu)]
pub enum ParserError {
    #[snafu(display("Invalid CSS selector: {selector}"))]
    Selector { selector: &'static str },
}

pub type ParserResult<T> = std::result::Result<T, ParserError>;

/// Why a candidate row did not produce a posting.
#[derive(Debug, Snafu)]
pub enum RowSkip {
    #[snafu(display("Row has {cells} cell(s), expected at least 4"))]
    TooFewCells { cells: usize },
    #[snafu(display("First cell has no link"))]
    NoAnchor,
    #[snafu(display("Title link has no href"))]
    NoHref,
    #[snafu(display("Title is empty"))]
    EmptyTitle,
    #[snafu(display("Link `{href}` cannot be resolved: {source}"))]
    InvalidLink {
        href: String,
        source: url::ParseError,
    },
}

fn selector(selector: &'static str) -> ParserResult<Selector> {
    Selector::parse(selector).map_err(|_| ParserError::Selector { selector })
}

/// Trimmed text content with inner whitespace runs collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extracts postings from the listings table and keeps those matching the
/// filter criteria.
pub struct ListingParser {
    criteria: FilterCriteria,
    origin: Url,
    rows: Selector,
    fallback_rows: Selector,
    cells: Selector,
    anchor: Selector,
}

impl ListingParser {
    pub fn new(criteria: FilterCriteria, origin: Url) -> ParserResult<Self> {
        Ok(Self {
            criteria,
            origin,
            rows: selector(ROW_SELECTOR)?,
            fallback_rows: selector(FALLBACK_ROW_SELECTOR)?,
            cells: selector("td")?,
            anchor: selector("a")?,
        })
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Parse `markup` and return matching postings in document order.
    ///
    /// Never fails: rows that cannot be interpreted are skipped one by one.
    pub fn parse(&self, markup: &str, observed_at: Timestamp) -> Vec<Posting> {
        let document = Html::parse_document(markup);
        debug!(target: LOG_TARGET, len = markup.len(), "Parsing listings page");

        let mut rows: Vec<_> = document.select(&self.rows).collect();
        debug!(target: LOG_TARGET, count = rows.len(), "Listing rows found");
        if rows.is_empty() {
            warn!(target: LOG_TARGET, "No listing rows found, trying the broader selector");
            rows = document.select(&self.fallback_rows).collect();
            debug!(target: LOG_TARGET, count = rows.len(), "Fallback rows found");
        }

        let mut postings = Vec::new();
        for (index, row) in rows.into_iter().enumerate() {
            let posting = match self.extract_row(row, observed_at) {
                Ok(posting) => posting,
                Err(skip) => {
                    debug!(target: LOG_TARGET, row = index, reason = %skip, "Skipping row");
                    continue;
                }
            };

            debug!(
                target: LOG_TARGET,
                title = %posting.title,
                location = %posting.location,
                "Found posting"
            );
            if self.criteria.matches(&posting.title, &posting.location) {
                debug!(target: LOG_TARGET, title = %posting.title, "Posting matches criteria");
                postings.push(posting);
            }
        }

        info!(target: LOG_TARGET, count = postings.len(), "Matching postings parsed");
        postings
    }

    fn extract_row(
        &self,
        row: ElementRef<'_>,
        observed_at: Timestamp,
    ) -> Result<Posting, RowSkip> {
        let cells: Vec<_> = row.select(&self.cells).collect();
        if cells.len() < MIN_CELLS {
            return TooFewCellsSnafu { cells: cells.len() }.fail();
        }

        let anchor = cells[0].select(&self.anchor).next().context(NoAnchorSnafu)?;
        let href = anchor.value().attr("href").context(NoHrefSnafu)?;

        let title = element_text(anchor);
        if title.is_empty() {
            return EmptyTitleSnafu.fail();
        }

        let link = self
            .origin
            .join(href.trim())
            .context(InvalidLinkSnafu { href })?;

        Ok(Posting {
            title,
            link: link.to_string(),
            company: element_text(cells[1]),
            location: element_text(cells[3]),
            observed_at,
        })
    }
}
