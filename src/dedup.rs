//! Deduplicator stage: collapses the collector's per-comment rows down to
//! one row per pull request, partitioned by PR state, and aggregates
//! per-repository counts that drive the counterfactual sampler.

use csv::StringRecord;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::record::{parse_pr_url, RepoCountRow};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Failed to read input CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Input CSV is missing required column '{0}'")]
    MissingColumn(String),
}

/// One allowed-state slice of the input: first row per (repo, PR number),
/// plus the per-repository aggregates over the same slice.
#[derive(Debug)]
pub struct Partition {
    pub rows: Vec<StringRecord>,
    pub counts: Vec<RepoCountRow>,
}

/// Run the deduplicator over the collector output, writing per-PR row files
/// and per-repository count files for the MERGED and MERGED+CLOSED slices.
pub fn run(input: &Path, output_dir: &Path) -> Result<(), DedupError> {
    let mut reader = csv::Reader::from_path(input)?;
    let headers = reader.headers()?.clone();
    let records = reader.records().collect::<Result<Vec<_>, _>>()?;
    info!(rows = records.len(), input = %input.display(), "loaded collector rows");

    for (label, states) in [
        ("merged", &["MERGED"][..]),
        ("without-open", &["MERGED", "CLOSED"][..]),
    ] {
        let partition = split_unique(&headers, &records, states)?;
        info!(
            partition = label,
            rows = partition.rows.len(),
            repositories = partition.counts.len(),
            "partition built"
        );

        let rows_path = output_dir.join(format!("unique-vrt-{label}.csv"));
        let mut writer = csv::Writer::from_path(&rows_path)?;
        writer.write_record(&headers)?;
        for row in &partition.rows {
            writer.write_record(row)?;
        }
        writer.flush().map_err(csv::Error::from)?;

        let counts_path = output_dir.join(format!("vrt-counts-{label}.csv"));
        let mut writer = csv::Writer::from_path(&counts_path)?;
        for count in &partition.counts {
            writer.serialize(count)?;
        }
        writer.flush().map_err(csv::Error::from)?;
    }
    Ok(())
}

/// First row per (repository, PR number) among rows whose state is in
/// `allowed_states`, in input order, plus per-repository counts.
/// `comment_count` counts every allowed row of the repo, deduplicated or not.
pub fn split_unique(
    headers: &StringRecord,
    records: &[StringRecord],
    allowed_states: &[&str],
) -> Result<Partition, DedupError> {
    let url_index = column_index(headers, "url")?;
    let state_index = column_index(headers, "state")?;

    let mut rows = Vec::new();
    let mut seen: HashMap<String, HashSet<u64>> = HashMap::new();
    let mut repo_order: Vec<String> = Vec::new();
    let mut comment_counts: HashMap<String, u64> = HashMap::new();

    for record in records {
        let state = record
            .get(state_index)
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        if !allowed_states.contains(&state.as_str()) {
            continue;
        }
        let url = record.get(url_index).unwrap_or_default().trim();
        let Some(pr) = parse_pr_url(url) else {
            warn!(url, "row with unparseable PR URL skipped");
            continue;
        };
        let slug = pr.repo_slug();

        *comment_counts.entry(slug.clone()).or_default() += 1;
        let numbers = seen.entry(slug.clone()).or_insert_with(|| {
            repo_order.push(slug.clone());
            HashSet::new()
        });
        if numbers.insert(pr.number) {
            rows.push(record.clone());
        }
    }

    let counts = repo_order
        .into_iter()
        .map(|slug| {
            let numbers = &seen[&slug];
            let mut sorted: Vec<u64> = numbers.iter().copied().collect();
            sorted.sort_unstable();
            RepoCountRow {
                comment_count: comment_counts[&slug],
                unique_pr_count: numbers.len() as u64,
                pull_numbers: sorted
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                repository_name: slug,
            }
        })
        .collect();

    Ok(Partition { rows, counts })
}

fn column_index(headers: &StringRecord, name: &str) -> Result<usize, DedupError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| DedupError::MissingColumn(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    fn sample_input() -> (StringRecord, Vec<StringRecord>) {
        let headers = record(&["pr_title", "url", "state", "extra"]);
        let records = vec![
            record(&["a", "https://github.com/o/r/pull/1#issuecomment-1", "MERGED", "x"]),
            record(&["a2", "https://github.com/o/r/pull/1#issuecomment-2", "MERGED", "y"]),
            record(&["b", "https://github.com/o/r/pull/2", "CLOSED", "z"]),
            record(&["c", "https://github.com/o/s/pull/9", "MERGED", "w"]),
            record(&["d", "https://github.com/o/r/pull/3", "OPEN", "q"]),
            record(&["e", "not-a-url", "MERGED", "v"]),
        ];
        (headers, records)
    }

    #[test]
    fn test_merged_partition_one_row_per_pr() {
        let (headers, records) = sample_input();
        let partition = split_unique(&headers, &records, &["MERGED"]).unwrap();

        // PR o/r#1 appears twice, kept once, first row wins
        assert_eq!(partition.rows.len(), 2);
        assert_eq!(partition.rows[0].get(0), Some("a"));
        assert_eq!(partition.rows[1].get(0), Some("c"));

        assert_eq!(partition.counts.len(), 2);
        assert_eq!(partition.counts[0].repository_name, "o/r");
        assert_eq!(partition.counts[0].comment_count, 2);
        assert_eq!(partition.counts[0].unique_pr_count, 1);
        assert_eq!(partition.counts[0].pull_numbers, "1");
        assert_eq!(partition.counts[1].repository_name, "o/s");
        assert_eq!(partition.counts[1].unique_pr_count, 1);
    }

    #[test]
    fn test_without_open_partition_excludes_open() {
        let (headers, records) = sample_input();
        let partition = split_unique(&headers, &records, &["MERGED", "CLOSED"]).unwrap();

        assert_eq!(partition.rows.len(), 3);
        let states: Vec<_> = partition.rows.iter().map(|r| r.get(2).unwrap()).collect();
        assert!(!states.contains(&"OPEN"));

        let repo = &partition.counts[0];
        assert_eq!(repo.repository_name, "o/r");
        assert_eq!(repo.unique_pr_count, 2);
        assert_eq!(repo.pull_numbers, "1, 2");
    }

    #[test]
    fn test_parsed_url_fragment_tolerated() {
        // comment URLs carry #issuecomment fragments; the PR parses anyway
        let url = "https://github.com/o/r/pull/1#issuecomment-1";
        let pr = parse_pr_url(url).unwrap();
        assert_eq!(pr.number, 1);
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let headers = record(&["pr_title", "url"]);
        let err = split_unique(&headers, &[], &["MERGED"]).unwrap_err();
        assert!(matches!(err, DedupError::MissingColumn(col) if col == "state"));
    }
}
