//! Collector stage: finds pull requests whose discussion contains the VRT
//! marker string, then writes one CSV row per matching non-bot comment.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{load_date_ranges, Config, ConfigError};
use crate::github::types::{CommentNode, FileStats, PullRequestNode};
use crate::github::{GithubClient, GithubError};
use crate::record::{parse_github_timestamp, parse_pr_url, CommentRow};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Github(#[from] GithubError),

    #[error("Failed to write output CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Run the collector: one marker search per date range, PR-level dedup by
/// URL, file stats fetched once per PR, one row per matching comment.
pub async fn run(
    client: &GithubClient,
    config: &Config,
    settings: &Path,
    output: &Path,
) -> Result<(), CollectError> {
    let ranges = load_date_ranges(settings)?;
    if ranges.is_empty() {
        warn!(settings = %settings.display(), "no date ranges loaded, nothing to collect");
        return Ok(());
    }
    info!(ranges = ranges.len(), marker = %config.collect.marker, "starting collection");

    let mut unique: Vec<PullRequestNode> = Vec::new();
    let mut seen_urls: HashSet<String> = HashSet::new();
    for (index, range) in ranges.iter().enumerate() {
        let query = format!(
            "{marker} in:comments,body is:pr created:{start}..{end} closed:{start}..{end}",
            marker = config.collect.marker,
            start = range.start,
            end = range.end,
        );
        info!(period = index + 1, total = ranges.len(), start = %range.start, end = %range.end, "searching period");

        match client
            .search_pull_requests(&query, config.collect.range_cap)
            .await
        {
            Ok(nodes) => {
                for node in nodes {
                    let Some(url) = node.url.clone() else {
                        continue;
                    };
                    if seen_urls.insert(url) {
                        unique.push(node);
                    }
                }
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(period = index + 1, error = %err, "period search failed, moving on");
            }
        }
    }
    info!(unique_prs = unique.len(), "search complete, fetching file stats");

    let mut writer = csv::Writer::from_path(output)?;
    let mut stats_cache: HashMap<String, FileStats> = HashMap::new();
    let mut rows_written = 0usize;

    for node in &unique {
        let Some(url) = node.url.as_deref() else {
            continue;
        };

        let stats = match stats_cache.get(url) {
            Some(cached) => {
                debug!(pr = url, "using cached file stats");
                cached.clone()
            }
            None => {
                let fetched = match parse_pr_url(url) {
                    Some(pr) => match client.file_stats(&pr).await {
                        Ok(stats) => stats,
                        Err(err) if err.is_fatal() => return Err(err.into()),
                        Err(err) => {
                            warn!(pr = url, error = %err, "file stats fetch failed");
                            FileStats::default()
                        }
                    },
                    None => {
                        warn!(pr = url, "unparseable PR URL, no file stats");
                        FileStats::default()
                    }
                };
                stats_cache.insert(url.to_string(), fetched.clone());
                fetched
            }
        };

        for row in comment_rows(node, &config.collect.marker, &stats) {
            writer.serialize(row)?;
            rows_written += 1;
        }
    }
    writer.flush().map_err(csv::Error::from)?;

    info!(rows = rows_written, output = %output.display(), "collection finished");
    Ok(())
}

fn is_bot(author: Option<&crate::github::types::Actor>) -> bool {
    author.and_then(|a| a.typename.as_deref()) == Some("Bot")
}

/// Issue comments and review-thread comments of one PR, merged and sorted by
/// creation time (missing stamps sort first).
fn merged_sorted_comments(node: &PullRequestNode) -> Vec<CommentNode> {
    let mut comments: Vec<CommentNode> = Vec::new();
    if let Some(direct) = &node.comments {
        comments.extend(direct.nodes.iter().flatten().cloned());
    }
    if let Some(threads) = &node.review_threads {
        for thread in threads.nodes.iter().flatten() {
            if let Some(thread_comments) = &thread.comments {
                comments.extend(thread_comments.nodes.iter().flatten().cloned());
            }
        }
    }
    comments.sort_by(|a, b| {
        a.created_at
            .as_deref()
            .unwrap_or("")
            .cmp(b.created_at.as_deref().unwrap_or(""))
    });
    comments
}

/// Direct comment total plus every review thread's comment total.
fn total_comment_count(node: &PullRequestNode) -> u64 {
    let direct = node.comments.as_ref().map_or(0, |c| c.total_count);
    let threaded = node.review_threads.as_ref().map_or(0, |threads| {
        threads
            .nodes
            .iter()
            .flatten()
            .filter_map(|thread| thread.comments.as_ref())
            .map(|c| c.total_count)
            .sum()
    });
    direct + threaded
}

/// Commits committed strictly after the comment. An unparseable comment
/// stamp contributes zero.
fn commits_since(comment_created_at: Option<&str>, commits: &[DateTime<Utc>]) -> u64 {
    let Some(comment_time) = comment_created_at.and_then(parse_github_timestamp) else {
        return 0;
    };
    commits.iter().filter(|time| **time > comment_time).count() as u64
}

/// One row per non-bot comment containing the marker. Non-bot comments are
/// numbered serially across the merged, time-sorted comment list.
fn comment_rows(node: &PullRequestNode, marker: &str, stats: &FileStats) -> Vec<CommentRow> {
    let total_comments = total_comment_count(node);
    let total_commits = node.commits.as_ref().map_or(0, |c| c.total_count);
    let commit_times: Vec<DateTime<Utc>> = node
        .commits
        .iter()
        .flat_map(|c| c.nodes.iter().flatten())
        .filter_map(|edge| edge.commit.as_ref())
        .filter_map(|commit| commit.committed_date.as_deref())
        .filter_map(parse_github_timestamp)
        .collect();

    let mut rows = Vec::new();
    let mut non_bot_serial = 0i64;
    for comment in merged_sorted_comments(node) {
        if is_bot(comment.author.as_ref()) {
            continue;
        }
        non_bot_serial += 1;
        if !comment.body.contains(marker) {
            continue;
        }
        let since = commits_since(comment.created_at.as_deref(), &commit_times);
        rows.push(CommentRow {
            pr_title: node.title.clone().unwrap_or_default(),
            text: comment.body.clone(),
            url: comment.url.clone().unwrap_or_default(),
            comment_index: non_bot_serial,
            commit_count_since_comment: since,
            total_comments,
            total_commits,
            comment_count_since_comment: since,
            created_at: node.created_at.clone().unwrap_or_default(),
            closed_at: node.closed_at.clone().unwrap_or_default(),
            state: node.state.clone().unwrap_or_default(),
            changefile: stats.changefile,
            addline: stats.addline,
            deleteline: stats.deleteline,
            file_changes: stats.joined_changes(),
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{
        Actor, CommentConnection, CommitConnection, CommitEdge, CommitInfo, ReviewThread,
        ReviewThreadConnection,
    };

    fn comment(body: &str, created_at: &str, bot: bool) -> Option<CommentNode> {
        Some(CommentNode {
            body: body.to_string(),
            url: Some(format!("https://github.com/o/r/pull/1#c-{created_at}")),
            created_at: Some(created_at.to_string()),
            author: Some(Actor {
                login: Some("someone".into()),
                typename: Some(if bot { "Bot" } else { "User" }.to_string()),
            }),
        })
    }

    fn pr_with_comments() -> PullRequestNode {
        PullRequestNode {
            title: Some("Add visual tests".into()),
            url: Some("https://github.com/o/r/pull/1".into()),
            created_at: Some("2021-04-01T00:00:00Z".into()),
            closed_at: Some("2021-04-05T00:00:00Z".into()),
            state: Some("MERGED".into()),
            comments: Some(CommentConnection {
                total_count: 3,
                nodes: vec![
                    comment("see www.chromatic.com/test?x later", "2021-04-02T00:00:00Z", false),
                    comment("bot noise www.chromatic.com/test?y", "2021-04-01T06:00:00Z", true),
                    comment("plain remark", "2021-04-01T12:00:00Z", false),
                ],
            }),
            review_threads: Some(ReviewThreadConnection {
                total_count: 1,
                nodes: vec![Some(ReviewThread {
                    comments: Some(CommentConnection {
                        total_count: 1,
                        nodes: vec![comment(
                            "thread: www.chromatic.com/test?z",
                            "2021-04-03T00:00:00Z",
                            false,
                        )],
                    }),
                })],
            }),
            commits: Some(CommitConnection {
                total_count: 4,
                nodes: vec![
                    Some(CommitEdge {
                        commit: Some(CommitInfo {
                            committed_date: Some("2021-04-01T01:00:00Z".into()),
                        }),
                    }),
                    Some(CommitEdge {
                        commit: Some(CommitInfo {
                            committed_date: Some("2021-04-02T12:00:00Z".into()),
                        }),
                    }),
                    Some(CommitEdge {
                        commit: Some(CommitInfo {
                            committed_date: Some("2021-04-04T00:00:00Z".into()),
                        }),
                    }),
                ],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_comment_rows_filters_and_indexes() {
        let node = pr_with_comments();
        let rows = comment_rows(&node, "www.chromatic.com/test?", &FileStats::default());

        // bot comment dropped; plain remark indexed but not emitted
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].comment_index, 2);
        assert!(rows[0].text.contains("test?x"));
        assert_eq!(rows[1].comment_index, 3);
        assert!(rows[1].text.starts_with("thread:"));

        // totals include review-thread comments
        assert_eq!(rows[0].total_comments, 4);
        assert_eq!(rows[0].total_commits, 4);
        assert_eq!(rows[0].state, "MERGED");
    }

    #[test]
    fn test_commits_since_counts_strictly_later() {
        let commits: Vec<DateTime<Utc>> = [
            "2021-04-01T01:00:00Z",
            "2021-04-02T12:00:00Z",
            "2021-04-04T00:00:00Z",
        ]
        .iter()
        .filter_map(|s| parse_github_timestamp(s))
        .collect();

        assert_eq!(commits_since(Some("2021-04-02T00:00:00Z"), &commits), 2);
        assert_eq!(commits_since(Some("2021-04-04T00:00:00Z"), &commits), 0);
        assert_eq!(commits_since(Some("garbage"), &commits), 0);
        assert_eq!(commits_since(None, &commits), 0);
    }

    #[test]
    fn test_merged_comments_sorted_by_creation() {
        let node = pr_with_comments();
        let merged = merged_sorted_comments(&node);
        assert_eq!(merged.len(), 4);
        let stamps: Vec<_> = merged
            .iter()
            .map(|c| c.created_at.as_deref().unwrap())
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn test_is_bot() {
        let bot = Actor {
            login: Some("chromatic".into()),
            typename: Some("Bot".into()),
        };
        let user = Actor {
            login: Some("dev".into()),
            typename: Some("User".into()),
        };
        assert!(is_bot(Some(&bot)));
        assert!(!is_bot(Some(&user)));
        assert!(!is_bot(None));
    }
}
