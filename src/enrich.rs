//! Enrichment stage: attaches line/file/comment/commit metrics to each
//! sampled pull request. Eight workers fetch independently; results are
//! reassembled in input order and row-level failures stay in the output
//! with an error marker in `fetch_status`.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::github::{GithubClient, GithubError};
use crate::record::{parse_pr_url, CandidateRow, EnrichedRow};

const WORKERS: usize = 8;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Github(#[from] GithubError),

    #[error("Failed to read or write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Enrichment worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fetch metrics for one sampled row. Never fails the batch: every problem
/// is recorded in the returned row's `fetch_status`, except fatal
/// misconfiguration which aborts the run.
async fn fetch_row(client: &GithubClient, row: CandidateRow) -> Result<EnrichedRow, GithubError> {
    let Some(pr) = parse_pr_url(&row.pr_url) else {
        return Ok(EnrichedRow::failed(row, "Error: Invalid PR URL"));
    };

    match client.pr_metrics(&pr).await {
        Ok(metrics) => Ok(EnrichedRow {
            repo_name: row.repo_name,
            pr_title: row.pr_title,
            pr_url: row.pr_url,
            created_at: row.created_at,
            closed_at: row.closed_at,
            total_comments: metrics.total_comments,
            total_commits: metrics.total_commits,
            state: row.state,
            addline: metrics.additions,
            deleteline: metrics.deletions,
            changefile: metrics.changed_files,
            fetch_status: "Success".to_string(),
        }),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(pr = %row.pr_url, error = %err, "metric fetch failed");
            Ok(EnrichedRow::failed(row, &format!("Error: {err}")))
        }
    }
}

/// Run the enrichment stage over the sampler output.
pub async fn run(
    client: Arc<GithubClient>,
    input: &Path,
    output: &Path,
) -> Result<(), EnrichError> {
    let mut reader = csv::Reader::from_path(input)?;
    let rows = reader
        .deserialize::<CandidateRow>()
        .collect::<Result<Vec<_>, _>>()?;
    info!(rows = rows.len(), input = %input.display(), "starting enrichment");

    let semaphore = Arc::new(Semaphore::new(WORKERS));
    let mut tasks: JoinSet<(usize, Result<EnrichedRow, GithubError>)> = JoinSet::new();
    let total = rows.len();
    for (index, row) in rows.into_iter().enumerate() {
        let client = Arc::clone(&client);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            // closing the semaphore is never done here, acquire cannot fail
            let _permit = semaphore.acquire().await;
            (index, fetch_row(&client, row).await)
        });
    }

    let mut enriched: Vec<Option<EnrichedRow>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined?;
        enriched[index] = Some(result?);
    }

    let mut writer = csv::Writer::from_path(output)?;
    let mut successes = 0usize;
    for row in enriched.into_iter().flatten() {
        if row.fetch_status == "Success" {
            successes += 1;
        }
        writer.serialize(row)?;
    }
    writer.flush().map_err(csv::Error::from)?;

    info!(
        successes,
        failures = total - successes,
        output = %output.display(),
        "enrichment finished"
    );
    Ok(())
}
