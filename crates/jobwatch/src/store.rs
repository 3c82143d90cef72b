use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::posting::{Posting, Timestamp};

pub const LOG_TARGET: &str = "jobwatch::store";

/// Column order of the persisted file. Every column is always written.
pub const HEADER: [&str; 5] = ["title", "link", "company", "location", "date"];

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },
    #[snafu(display("Malformed posting record: {source}"))]
    Csv { source: csv::Error },
    #[snafu(display("Invalid date `{date}` in record {record}: {source}"))]
    InvalidDate {
        record: usize,
        date: String,
        source: time::error::Parse,
    },
    #[snafu(display("Failed to replace {}: {source}", path.display()))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Serialize, Deserialize)]
struct PostingRecord {
    title: String,
    link: String,
    company: String,
    location: String,
    date: String,
}

impl From<&Posting> for PostingRecord {
    fn from(p: &Posting) -> Self {
        Self {
            title: p.title.clone(),
            link: p.link.clone(),
            company: p.company.clone(),
            location: p.location.clone(),
            date: p.observed_at.to_string(),
        }
    }
}

impl PostingRecord {
    fn into_posting(self, record: usize) -> StoreResult<Posting> {
        let observed_at: Timestamp = self.date.parse().context(InvalidDateSnafu {
            record,
            date: self.date.as_str(),
        })?;
        Ok(Posting {
            title: self.title,
            link: self.link,
            company: self.company,
            location: self.location,
            observed_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records that were not in the store before.
    pub added: usize,
    /// Size of the store after the merge.
    pub total: usize,
}

/// Union of `existing` and `new` without duplicate `(title, link)` pairs.
///
/// The first occurrence of a pair wins, so stored postings are never
/// overwritten by later duplicates. Returns the merged set and how many
/// entries of `new` made it in.
pub fn merge_postings(existing: Vec<Posting>, new: &[Posting]) -> (Vec<Posting>, usize) {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(existing.len() + new.len());

    for posting in existing {
        if seen.insert((posting.title.clone(), posting.link.clone())) {
            merged.push(posting);
        }
    }

    let mut added = 0;
    for posting in new {
        if seen.insert((posting.title.clone(), posting.link.clone())) {
            merged.push(posting.clone());
            added += 1;
        }
    }

    (merged, added)
}

/// Every posting ever accepted for one watched page, kept in a CSV file.
///
/// The whole file is read on load and rewritten on save. Writes go to a
/// temporary file in the same directory that then replaces the old file, so
/// readers never observe a truncated store.
#[derive(Debug, Clone)]
pub struct PostingStore {
    path: PathBuf,
}

impl PostingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all stored postings.
    ///
    /// A missing store is empty. An unreadable or corrupt one is logged and
    /// treated as empty too.
    pub fn load(&self) -> Vec<Posting> {
        match self.try_load() {
            Ok(postings) => postings,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    path = %self.path.display(),
                    err = %err,
                    "Could not read stored postings, treating store as empty"
                );
                Vec::new()
            }
        }
    }

    pub fn try_load(&self) -> StoreResult<Vec<Posting>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: LOG_TARGET, path = %self.path.display(), "No stored postings yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err).context(IoSnafu { path: &self.path }),
        };

        let mut reader = csv::Reader::from_reader(file);
        let mut postings = Vec::new();
        for (i, record) in reader.deserialize::<PostingRecord>().enumerate() {
            let record = record.context(CsvSnafu)?;
            postings.push(record.into_posting(i + 1)?);
        }

        debug!(target: LOG_TARGET, count = postings.len(), "Loaded stored postings");
        Ok(postings)
    }

    /// Titles of every stored posting, the key used for change detection.
    pub fn known_titles(&self) -> HashSet<String> {
        self.load().into_iter().map(|p| p.title).collect()
    }

    /// Add `new` to the store and persist the result.
    pub fn merge_and_save(&self, new: &[Posting]) -> StoreResult<MergeOutcome> {
        let existing = self.load();
        let (merged, added) = merge_postings(existing, new);

        self.write(&merged)?;

        info!(
            target: LOG_TARGET,
            added,
            total = merged.len(),
            "Saved postings"
        );
        Ok(MergeOutcome {
            added,
            total: merged.len(),
        })
    }

    /// Replace the store with an empty one.
    pub fn clear(&self) -> StoreResult<()> {
        self.write(&[])?;
        info!(target: LOG_TARGET, path = %self.path.display(), "Cleared stored postings");
        Ok(())
    }

    fn write(&self, postings: &[Posting]) -> StoreResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).context(IoSnafu { path: dir })?;

        let mut tmp = NamedTempFile::new_in(dir).context(IoSnafu { path: dir })?;
        let tmp_path = tmp.path().to_path_buf();
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file_mut());
            writer.write_record(HEADER).context(CsvSnafu)?;
            for posting in postings {
                writer
                    .serialize(PostingRecord::from(posting))
                    .context(CsvSnafu)?;
            }
            writer.flush().context(IoSnafu { path: &tmp_path })?;
        }
        tmp.as_file()
            .sync_all()
            .context(IoSnafu { path: &tmp_path })?;

        tmp.persist(&self.path)
            .context(PersistSnafu { path: &self.path })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn posting(title: &str, link: &str) -> Posting {
        Posting {
            title: title.into(),
            link: link.into(),
            company: "Bodet Software".into(),
            location: "Cholet".into(),
            observed_at: "2024-01-15 10:00".parse().unwrap(),
        }
    }

    fn store(dir: &TempDir) -> PostingStore {
        PostingStore::new(dir.path().join("data").join("jobs.csv"))
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.load().is_empty());
        assert!(store.known_titles().is_empty());
    }

    #[test]
    fn load_after_save_returns_saved_postings() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let postings = vec![
            posting("Job 1", "https://www.bodet.com/1"),
            posting("Job 2", "https://www.bodet.com/2"),
        ];

        let outcome = store.merge_and_save(&postings).unwrap();

        assert_eq!(outcome, MergeOutcome { added: 2, total: 2 });
        assert_eq!(store.load(), postings);
    }

    #[test]
    fn saving_twice_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let postings = vec![posting("Job 1", "link1"), posting("Job 2", "link2")];

        store.merge_and_save(&postings).unwrap();
        let outcome = store.merge_and_save(&postings).unwrap();

        assert_eq!(outcome, MergeOutcome { added: 0, total: 2 });
        assert_eq!(store.load().len(), 2);
    }

    #[test]
    fn appends_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.merge_and_save(&[posting("Job 1", "link1")]).unwrap();
        store.merge_and_save(&[posting("Job 2", "link2")]).unwrap();

        let titles: Vec<_> = store.load().into_iter().map(|p| p.title).collect();
        assert_eq!(titles, ["Job 1", "Job 2"]);
    }

    #[test]
    fn first_seen_wins() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.merge_and_save(&[posting("Job 1", "link1")]).unwrap();

        let mut later = posting("Job 1", "link1");
        later.company = "Someone Else".into();
        later.observed_at = "2024-02-01 09:00".parse().unwrap();
        let outcome = store.merge_and_save(&[later]).unwrap();

        assert_eq!(outcome.added, 0);
        let stored = store.load();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].company, "Bodet Software");
        assert_eq!(stored[0].observed_at.to_string(), "2024-01-15 10:00");
    }

    #[test]
    fn same_title_different_link_are_distinct_records() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .merge_and_save(&[posting("Job 1", "/old"), posting("Job 1", "/new")])
            .unwrap();

        assert_eq!(store.load().len(), 2);
        assert_eq!(store.known_titles().len(), 1);
    }

    #[test]
    fn duplicates_within_one_batch_collapse() {
        let (merged, added) = merge_postings(
            vec![],
            &[posting("Job 1", "a"), posting("Job 1", "a"), posting("Job 2", "a")],
        );
        assert_eq!(added, 2);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn file_has_header_and_every_column() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut p = posting("Développeur, \"Vue\"", "https://www.bodet.com/x");
        p.company = String::new();

        store.merge_and_save(&[p.clone()]).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            content,
            "title,link,company,location,date\n\
             \"Développeur, \"\"Vue\"\"\",https://www.bodet.com/x,,Cholet,2024-01-15 10:00\n"
        );
        assert_eq!(store.load(), vec![p]);
    }

    #[test]
    fn corrupt_store_is_treated_as_empty_and_replaced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            "title,link,company,location,date\nJob 1,link1,Bodet,Cholet,not a date\n",
        )
        .unwrap();

        assert!(store.try_load().is_err());
        assert!(store.load().is_empty());

        store.merge_and_save(&[posting("Job 2", "link2")]).unwrap();
        let titles: Vec<_> = store.load().into_iter().map(|p| p.title).collect();
        assert_eq!(titles, ["Job 2"]);
    }

    #[test]
    fn missing_column_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "title,link\nJob 1,link1\n").unwrap();

        assert!(matches!(store.try_load(), Err(StoreError::Csv { .. })));
        assert!(store.load().is_empty());
    }

    #[test]
    fn empty_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "").unwrap();

        assert!(store.try_load().unwrap().is_empty());
    }

    #[test]
    fn clear_leaves_header_only() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.merge_and_save(&[posting("Job 1", "link1")]).unwrap();

        store.clear().unwrap();

        assert!(store.load().is_empty());
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "title,link,company,location,date\n"
        );
    }

    #[test]
    fn no_temporary_files_are_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.merge_and_save(&[posting("Job 1", "link1")]).unwrap();
        store.merge_and_save(&[posting("Job 2", "link2")]).unwrap();

        let entries: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["jobs.csv"]);
    }
}
