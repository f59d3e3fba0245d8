//! Candidate-pool sub-stage: for every repository that has VRT pull
//! requests, fetch its other closed PRs per date range and keep the ones a
//! human plausibly reviewed visually (non-bot author, not already in the
//! VRT set, and an embedded image somewhere in the discussion).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use super::SampleError;
use crate::config::{load_date_ranges, Config};
use crate::github::types::PullRequestNode;
use crate::github::GithubClient;
use crate::record::{parse_pr_url, CandidateRow, RepoCountRow};

/// Fetch candidate PRs for every repository in the counts file and write one
/// `pr_details_{owner_repo}.csv` per repository under `output_dir`.
pub async fn run(
    client: &GithubClient,
    config: &Config,
    counts_csv: &Path,
    settings: &Path,
    output_dir: &Path,
) -> Result<(), SampleError> {
    let exclusions = load_exclusions(counts_csv)?;
    let ranges = load_date_ranges(settings)?;
    if ranges.is_empty() {
        warn!(settings = %settings.display(), "no date ranges loaded, nothing to fetch");
        return Ok(());
    }
    info!(
        repositories = exclusions.len(),
        ranges = ranges.len(),
        "building candidate pools"
    );

    for (slug, excluded) in &exclusions {
        let mut rows: Vec<CandidateRow> = Vec::new();
        for range in &ranges {
            let nodes = match client
                .repo_pull_requests(slug, &range.start, &range.end)
                .await
            {
                Ok(nodes) => nodes,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!(repo = %slug, start = %range.start, error = %err, "pool fetch failed for range");
                    continue;
                }
            };
            for node in &nodes {
                if let Some(row) = candidate_from_node(node, excluded, config.sample.require_image)
                {
                    rows.push(row);
                }
            }
        }

        if rows.is_empty() {
            info!(repo = %slug, "no qualifying candidates");
            continue;
        }
        let path = output_dir.join(format!("pr_details_{}.csv", slug.replace('/', "_")));
        let mut writer = csv::Writer::from_path(&path)?;
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        info!(repo = %slug, candidates = rows.len(), output = %path.display(), "pool written");
    }
    Ok(())
}

/// Per-repository sets of PR numbers already in the VRT data, keyed by
/// `owner/repo`. Iteration order follows the counts file.
pub fn load_exclusions(
    counts_csv: &Path,
) -> Result<Vec<(String, HashSet<u64>)>, SampleError> {
    let mut reader = csv::Reader::from_path(counts_csv)?;
    let mut order: Vec<String> = Vec::new();
    let mut sets: HashMap<String, HashSet<u64>> = HashMap::new();
    for row in reader.deserialize::<RepoCountRow>() {
        let row = row?;
        let numbers = row
            .pull_numbers
            .split(',')
            .filter_map(|n| n.trim().parse::<u64>().ok());
        match sets.get_mut(&row.repository_name) {
            Some(existing) => existing.extend(numbers),
            None => {
                order.push(row.repository_name.clone());
                sets.insert(row.repository_name, numbers.collect());
            }
        }
    }
    Ok(order
        .into_iter()
        .map(|slug| {
            let set = sets.remove(&slug).unwrap_or_default();
            (slug, set)
        })
        .collect())
}

/// Markdown image (`![alt](src)`) or raw `<img` tag.
fn contains_image(text: &str) -> bool {
    (text.contains("![") && text.contains("](")) || text.contains("<img")
}

/// Image anywhere in the PR body, issue comments, or review-thread comments.
fn has_image(node: &PullRequestNode) -> bool {
    if node.body.as_deref().is_some_and(contains_image) {
        return true;
    }
    if let Some(comments) = &node.comments {
        if comments
            .nodes
            .iter()
            .flatten()
            .any(|comment| contains_image(&comment.body))
        {
            return true;
        }
    }
    if let Some(threads) = &node.review_threads {
        for thread in threads.nodes.iter().flatten() {
            if let Some(comments) = &thread.comments {
                if comments
                    .nodes
                    .iter()
                    .flatten()
                    .any(|comment| contains_image(&comment.body))
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Apply the bot/exclusion/image filters to one search hit.
fn candidate_from_node(
    node: &PullRequestNode,
    excluded: &HashSet<u64>,
    require_image: bool,
) -> Option<CandidateRow> {
    let url = node.url.as_deref()?;
    let pr = parse_pr_url(url)?;

    let author_is_bot = node
        .author
        .as_ref()
        .and_then(|a| a.typename.as_deref())
        == Some("Bot");
    if author_is_bot || excluded.contains(&pr.number) {
        return None;
    }
    if require_image && !has_image(node) {
        return None;
    }

    let total_comments = node.comments.as_ref().map_or(0, |c| c.total_count)
        + node.review_threads.as_ref().map_or(0, |t| t.total_count);
    Some(CandidateRow {
        repo_name: node
            .repository
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| pr.repo.clone()),
        pr_title: node.title.clone().unwrap_or_default(),
        pr_url: url.to_string(),
        created_at: node.created_at.clone().unwrap_or_default(),
        closed_at: node.closed_at.clone().unwrap_or_default(),
        total_comments,
        total_commits: node.commits.as_ref().map_or(0, |c| c.total_count),
        state: node.state.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{Actor, CommentConnection, CommentNode, RepositoryRef};
    use std::io::Write;

    fn node(number: u64, bot: bool, body: &str) -> PullRequestNode {
        PullRequestNode {
            title: Some(format!("PR {number}")),
            url: Some(format!("https://github.com/o/r/pull/{number}")),
            body: Some(body.to_string()),
            created_at: Some("2021-04-01T00:00:00Z".into()),
            closed_at: Some("2021-04-02T00:00:00Z".into()),
            state: Some("MERGED".into()),
            repository: Some(RepositoryRef { name: "r".into() }),
            author: Some(Actor {
                login: Some("dev".into()),
                typename: Some(if bot { "Bot" } else { "User" }.to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_contains_image_variants() {
        assert!(contains_image("before ![shot](https://x/y.png) after"));
        assert!(contains_image("<img src=\"x.png\">"));
        assert!(!contains_image("no image here [link](url)"));
        assert!(!contains_image(""));
    }

    #[test]
    fn test_candidate_filters() {
        let excluded: HashSet<u64> = [7].into_iter().collect();

        let good = node(1, false, "look: ![s](u)");
        assert!(candidate_from_node(&good, &excluded, true).is_some());

        let bot = node(2, true, "![s](u)");
        assert!(candidate_from_node(&bot, &excluded, true).is_none());

        let vrt = node(7, false, "![s](u)");
        assert!(candidate_from_node(&vrt, &excluded, true).is_none());

        let no_image = node(3, false, "plain text");
        assert!(candidate_from_node(&no_image, &excluded, true).is_none());
        assert!(candidate_from_node(&no_image, &excluded, false).is_some());
    }

    #[test]
    fn test_image_found_in_comments() {
        let mut pr = node(4, false, "plain body");
        pr.comments = Some(CommentConnection {
            total_count: 1,
            nodes: vec![Some(CommentNode {
                body: "screenshot: <img src=a.png>".into(),
                ..Default::default()
            })],
        });
        let row = candidate_from_node(&pr, &HashSet::new(), true).unwrap();
        assert_eq!(row.total_comments, 1);
        assert_eq!(row.repo_name, "r");
    }

    #[test]
    fn test_load_exclusions_parses_padded_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "repository_name,comment_count,unique_pr_count,pull_numbers").unwrap();
        writeln!(file, "o/r,3,2,\"1, 23\"").unwrap();
        writeln!(file, "o/s,1,1,9").unwrap();

        let exclusions = load_exclusions(file.path()).unwrap();
        assert_eq!(exclusions.len(), 2);
        assert_eq!(exclusions[0].0, "o/r");
        assert!(exclusions[0].1.contains(&1));
        assert!(exclusions[0].1.contains(&23));
        assert_eq!(exclusions[1].1.len(), 1);
    }
}
