use std::collections::HashSet;

use crate::posting::Posting;

/// Postings from `parsed` whose title is not in `known_titles`.
///
/// Titles are the change key: a title republished under a different link is
/// not new. Exact `(title, link)` repeats within `parsed` are collapsed to
/// their first occurrence, while distinct links sharing an unseen title are
/// all reported. Order follows `parsed`.
pub fn diff(parsed: &[Posting], known_titles: &HashSet<String>) -> Vec<Posting> {
    let mut seen = HashSet::new();
    parsed
        .iter()
        .filter(|p| !known_titles.contains(&p.title))
        .filter(|p| seen.insert(p.key()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(title: &str, link: &str) -> Posting {
        Posting {
            title: title.into(),
            link: link.into(),
            company: "Bodet".into(),
            location: "Cholet".into(),
            observed_at: "2024-03-01 12:00".parse().unwrap(),
        }
    }

    fn titles(known: &[&str]) -> HashSet<String> {
        known.iter().map(|t| (*t).to_owned()).collect()
    }

    #[test]
    fn unseen_titles_are_new() {
        let parsed = [posting("Job 1", "l1"), posting("Job 2", "l2")];
        let new = diff(&parsed, &titles(&["Job 1"]));
        assert_eq!(new, vec![posting("Job 2", "l2")]);
    }

    #[test]
    fn republished_link_is_not_new() {
        let parsed = [posting("Backend Developer", "https://www.bodet.com/new")];
        let new = diff(&parsed, &titles(&["Backend Developer"]));
        assert!(new.is_empty());
    }

    #[test]
    fn nothing_known_means_everything_is_new() {
        let parsed = [posting("A", "1"), posting("B", "2"), posting("C", "3")];
        assert_eq!(diff(&parsed, &HashSet::new()), parsed.to_vec());
    }

    #[test]
    fn exact_repeats_collapse_but_distinct_links_stay() {
        let parsed = [
            posting("Job 1", "l1"),
            posting("Job 1", "l1"),
            posting("Job 1", "l2"),
        ];
        let new = diff(&parsed, &HashSet::new());
        assert_eq!(new, vec![posting("Job 1", "l1"), posting("Job 1", "l2")]);
    }

    #[test]
    fn result_is_disjoint_from_known_and_a_subset_of_parsed() {
        let parsed = [posting("A", "1"), posting("B", "2"), posting("C", "3")];
        let known = titles(&["B", "Z"]);
        let new = diff(&parsed, &known);
        for p in &new {
            assert!(!known.contains(&p.title));
            assert!(parsed.contains(p));
        }
        assert_eq!(new.len(), 2);
    }
}
