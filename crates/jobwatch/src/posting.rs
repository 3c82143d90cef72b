use std::collections::BTreeSet;
use std::{fmt, str};

use serde::{Serialize, Serializer};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Title keywords of interest on the watched board.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "dev",
    "développeur",
    "developpeur",
    "développement",
    "angular",
    "vue",
    "vue js",
    "vue.js",
    "nodejs",
    "javascript",
    "js",
    "php",
    "symfony",
    "frontend",
    "front-end",
    "front",
    "back-end",
    "backend",
    "back",
    "fullstack",
    "full-stack",
    "full stack",
];

/// Accepted office locations.
pub const DEFAULT_LOCATIONS: &[&str] = &["cholet", "trémentines", "angers"];

/// Observation time of a posting, truncated to the minute (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let dt = dt.to_offset(UtcOffset::UTC);
        let dt = PrimitiveDateTime::new(dt.date(), dt.time());
        let t = dt.time();
        Self(dt - time::Duration::new(i64::from(t.second()), t.nanosecond() as i32))
    }

    pub fn as_datetime(self) -> OffsetDateTime {
        self.0.assume_utc()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self
            .0
            .format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
            .map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl str::FromStr for Timestamp {
    type Err = time::error::Parse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrimitiveDateTime::parse(
            s.trim(),
            format_description!("[year]-[month]-[day] [hour]:[minute]"),
        )
        .map(Self)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// A single job listing as seen on the watched page.
///
/// Two postings are the same posting when their `title` and `link` match
/// exactly; the other fields are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Posting {
    pub title: String,
    pub link: String,
    pub company: String,
    pub location: String,
    pub observed_at: Timestamp,
}

impl Posting {
    pub fn key(&self) -> (&str, &str) {
        (&self.title, &self.link)
    }

    pub fn is_same_posting(&self, other: &Posting) -> bool {
        self.key() == other.key()
    }
}

/// Keyword/location predicate a posting must satisfy to be retained.
#[derive(Debug, Clone)]
pub struct FilterCriteria {
    keywords: Vec<String>,
    locations: BTreeSet<String>,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS, DEFAULT_LOCATIONS)
    }
}

impl FilterCriteria {
    pub fn new<K, L>(
        keywords: impl IntoIterator<Item = K>,
        locations: impl IntoIterator<Item = L>,
    ) -> Self
    where
        K: AsRef<str>,
        L: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            locations: locations
                .into_iter()
                .map(|l| l.as_ref().trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.locations.iter().map(String::as_str)
    }

    /// Case-insensitive substring match, not whole-word: `js` matches
    /// `Node.js Developer`.
    pub fn matches_title(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.keywords.iter().any(|k| title.contains(k.as_str()))
    }

    pub fn accepts_location(&self, location: &str) -> bool {
        self.locations.contains(&location.trim().to_lowercase())
    }

    pub fn matches(&self, title: &str, location: &str) -> bool {
        self.matches_title(title) && self.accepts_location(location)
    }
}
