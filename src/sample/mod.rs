//! Counterfactual sampler: for every repository with k unique VRT pull
//! requests, draws k comparable non-VRT pull requests from that repository's
//! candidate pool. Each draw must touch at least one file with a target
//! extension; draws that fail the check are swapped for candidates from the
//! unselected remainder.

pub mod pool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::github::{GithubClient, GithubError};
use crate::record::{
    parse_github_timestamp, parse_pr_url, CandidateRow, PrUrl, RepoCountRow,
};

#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Github(#[from] GithubError),

    #[error("Failed to read or write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Input CSV is missing required column '{0}'")]
    MissingColumn(String),
}

/// A pool row with its parsed PR coordinates.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pr: PrUrl,
    pub row: CandidateRow,
}

/// What one repository's selection produced.
#[derive(Debug)]
pub struct SelectionOutcome {
    pub selected: Vec<Candidate>,
    pub api_calls: usize,
    pub replacements: usize,
    pub shortfall: bool,
}

/// Decides whether a candidate PR qualifies for selection. The production
/// probe checks modified-file extensions over the GitHub API; tests swap in
/// a canned implementation.
#[async_trait]
pub trait CandidateProbe: Send + Sync {
    async fn qualifies(&self, pr: &PrUrl) -> Result<bool, GithubError>;
}

/// Extension probe over the PR's modified-file list.
pub struct ExtensionProbe<'a> {
    client: &'a GithubClient,
    extensions: Vec<String>,
}

impl<'a> ExtensionProbe<'a> {
    pub fn new(client: &'a GithubClient, extensions: Vec<String>) -> Self {
        Self { client, extensions }
    }
}

#[async_trait]
impl CandidateProbe for ExtensionProbe<'_> {
    async fn qualifies(&self, pr: &PrUrl) -> Result<bool, GithubError> {
        let files = self.client.modified_files(pr).await?;
        Ok(contains_target_extension(&files, &self.extensions))
    }
}

/// Case-insensitive suffix match against the target extension list.
pub fn contains_target_extension(files: &[String], extensions: &[String]) -> bool {
    files.iter().any(|file| {
        let lower = file.to_lowercase();
        extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    })
}

/// Probe one candidate, memoizing the verdict by PR URL. Probe failures
/// count as "does not qualify" unless they are fatal.
async fn cached_qualifies(
    probe: &dyn CandidateProbe,
    cache: &mut HashMap<String, bool>,
    candidate: &Candidate,
    api_calls: &mut usize,
) -> Result<bool, GithubError> {
    if let Some(&verdict) = cache.get(&candidate.row.pr_url) {
        debug!(pr = %candidate.row.pr_url, verdict, "probe cache hit");
        return Ok(verdict);
    }
    *api_calls += 1;
    let verdict = match probe.qualifies(&candidate.pr).await {
        Ok(verdict) => verdict,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            warn!(pr = %candidate.row.pr_url, error = %err, "probe failed, treating as non-qualifying");
            false
        }
    };
    cache.insert(candidate.row.pr_url.clone(), verdict);
    Ok(verdict)
}

/// Select up to `target` candidates from one repository's pool: uniform
/// shuffle, take the head, then replace non-qualifying picks from the
/// remainder (scanned newest-appended first). A pool smaller than the
/// target is a reported shortfall, never an error.
pub async fn select_for_repo(
    probe: &dyn CandidateProbe,
    mut candidates: Vec<Candidate>,
    target: usize,
    cache: &mut HashMap<String, bool>,
) -> Result<SelectionOutcome, GithubError> {
    candidates.shuffle(&mut thread_rng());
    let take = target.min(candidates.len());
    let mut remainder = candidates.split_off(take);
    let mut selected = candidates;

    let mut api_calls = 0;
    let mut replacements = 0;
    for slot in 0..selected.len() {
        if cached_qualifies(probe, cache, &selected[slot], &mut api_calls).await? {
            continue;
        }
        for idx in (0..remainder.len()).rev() {
            if cached_qualifies(probe, cache, &remainder[idx], &mut api_calls).await? {
                selected[slot] = remainder.remove(idx);
                replacements += 1;
                break;
            }
        }
    }

    Ok(SelectionOutcome {
        selected,
        api_calls,
        replacements,
        shortfall: take < target,
    })
}

/// Run the sampler: targets from the counts file, date floors from the
/// collector output, candidates from the pool directory, selection per
/// repository with a process-wide probe cache.
pub async fn run(
    client: &GithubClient,
    config: &Config,
    counts_csv: &Path,
    collector_csv: &Path,
    pool_dir: &Path,
    output: &Path,
) -> Result<(), SampleError> {
    let targets = load_targets(counts_csv)?;
    let oldest = load_oldest_vrt_dates(collector_csv)?;
    info!(
        repositories = targets.len(),
        dated_repositories = oldest.len(),
        "sampler inputs loaded"
    );

    let probe = ExtensionProbe::new(client, config.sample.extensions.clone());
    let mut cache: HashMap<String, bool> = HashMap::new();
    let mut per_repo: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    let mut total_selected = 0usize;
    let mut total_api_calls = 0usize;
    let mut total_replacements = 0usize;
    let mut shortfall_repos = 0usize;

    for (slug, target) in &targets {
        let candidates = load_candidates(pool_dir, slug, oldest.get(slug))?;
        if candidates.is_empty() {
            if *target > 0 {
                warn!(repo = %slug, needed = target, "no candidates available");
                shortfall_repos += 1;
            }
            continue;
        }

        let outcome = select_for_repo(&probe, candidates, *target, &mut cache).await?;
        info!(
            repo = %slug,
            needed = target,
            selected = outcome.selected.len(),
            api_calls = outcome.api_calls,
            replacements = outcome.replacements,
            "repository sampled"
        );
        total_selected += outcome.selected.len();
        total_api_calls += outcome.api_calls;
        total_replacements += outcome.replacements;
        if outcome.shortfall {
            warn!(repo = %slug, needed = target, found = outcome.selected.len(), "pool smaller than target");
            shortfall_repos += 1;
        }
        per_repo.insert(slug.clone(), outcome.selected);
    }

    let mut writer = csv::Writer::from_path(output)?;
    for selected in per_repo.values() {
        for candidate in selected {
            writer.serialize(&candidate.row)?;
        }
    }
    writer.flush().map_err(csv::Error::from)?;

    info!(
        selected = total_selected,
        api_calls = total_api_calls,
        replacements = total_replacements,
        shortfall_repos,
        output = %output.display(),
        "sampling finished"
    );
    Ok(())
}

/// `(owner/repo, unique_pr_count)` pairs in counts-file order.
fn load_targets(counts_csv: &Path) -> Result<Vec<(String, usize)>, SampleError> {
    let mut reader = csv::Reader::from_path(counts_csv)?;
    let mut targets = Vec::new();
    for row in reader.deserialize::<RepoCountRow>() {
        let row = row?;
        targets.push((row.repository_name, row.unique_pr_count as usize));
    }
    Ok(targets)
}

/// Oldest MERGED VRT PR creation date per repository; candidates created
/// before it are not comparable and are filtered out.
fn load_oldest_vrt_dates(
    collector_csv: &Path,
) -> Result<HashMap<String, DateTime<Utc>>, SampleError> {
    let mut reader = csv::Reader::from_path(collector_csv)?;
    let headers = reader.headers()?.clone();
    let url_index = column_index(&headers, "url")?;
    let created_index = column_index(&headers, "created_at")?;
    let state_index = column_index(&headers, "state")?;

    let mut oldest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if record
            .get(state_index)
            .unwrap_or_default()
            .to_uppercase()
            != "MERGED"
        {
            continue;
        }
        let Some(pr) = record.get(url_index).and_then(parse_pr_url) else {
            continue;
        };
        let Some(created) = record
            .get(created_index)
            .and_then(parse_github_timestamp)
        else {
            continue;
        };
        oldest
            .entry(pr.repo_slug())
            .and_modify(|current| {
                if created < *current {
                    *current = created;
                }
            })
            .or_insert(created);
    }
    Ok(oldest)
}

/// One repository's pool file filtered down to usable candidates: MERGED,
/// parseable URL and creation date, not older than the repo's first VRT PR.
/// A missing pool file yields an empty pool.
fn load_candidates(
    pool_dir: &Path,
    slug: &str,
    oldest: Option<&DateTime<Utc>>,
) -> Result<Vec<Candidate>, SampleError> {
    let path = pool_dir.join(format!("pr_details_{}.csv", slug.replace('/', "_")));
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_path(&path)?;
    let mut candidates = Vec::new();
    for row in reader.deserialize::<CandidateRow>() {
        let row = row?;
        if row.state.to_uppercase() != "MERGED" {
            continue;
        }
        let Some(pr) = parse_pr_url(&row.pr_url) else {
            debug!(url = %row.pr_url, "unparseable candidate URL skipped");
            continue;
        };
        let Some(created) = parse_github_timestamp(&row.created_at) else {
            debug!(url = %row.pr_url, "unparseable candidate date skipped");
            continue;
        };
        if oldest.is_some_and(|floor| created < *floor) {
            continue;
        }
        candidates.push(Candidate { pr, row });
    }
    Ok(candidates)
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize, SampleError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| SampleError::MissingColumn(name.to_string()))
}
