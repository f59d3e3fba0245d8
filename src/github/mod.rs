pub mod types;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{parse_github_timestamp, PrUrl};
use types::{
    FileStats, GraphqlEnvelope, PrMetrics, PullRequestNode, RateLimit, RepositoryData, SearchData,
};

const GRAPHQL_URL: &str = "https://api.github.com/graphql";
const USER_AGENT: &str = "vrt-pipeline";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RETRIES: u32 = 3;
/// Courtesy pause between search result pages.
const SEARCH_PAGE_DELAY: Duration = Duration::from_secs(2);
/// Courtesy pause between file list pages.
const FILE_PAGE_DELAY: Duration = Duration::from_millis(500);
/// Stop paginating a single PR's file list past this many files.
const FILE_LIST_CAP: usize = 1000;
/// Proactively wait out the rate limit when fewer calls than this remain.
const RATE_LIMIT_FLOOR: i64 = 30;

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("GitHub API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API returned HTTP {0}")]
    Status(StatusCode),

    #[error("GitHub token is invalid or lacks permissions (HTTP 401)")]
    BadCredentials,

    #[error("GitHub token not found in config or environment")]
    MissingToken,

    #[error("GraphQL query failed: {0}")]
    Graphql(String),

    #[error("Failed to decode GraphQL response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),
}

impl GithubError {
    /// Fatal misconfiguration aborts the whole run; everything else degrades
    /// to a per-item error while the batch continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BadCredentials | Self::MissingToken)
    }
}

const SEARCH_COMMENTS_QUERY: &str = r#"
query ($cursor: String, $searchQuery: String!) {
  search(query: $searchQuery, type: ISSUE, first: 20, after: $cursor) {
    edges {
      node {
        ... on PullRequest {
          title
          url
          createdAt
          closedAt
          state
          comments(first: 50) {
            totalCount
            nodes { body, url, author { login, __typename }, createdAt }
          }
          reviewThreads(first: 30) {
            nodes {
              comments(first: 50) {
                totalCount
                nodes { body, url, author { login, __typename }, createdAt }
              }
            }
          }
          commits(first: 100) {
            totalCount
            nodes { commit { committedDate } }
          }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

const POOL_SEARCH_QUERY: &str = r#"
query ($cursor: String, $searchQuery: String!) {
  search(query: $searchQuery, type: ISSUE, first: 30, after: $cursor) {
    edges {
      node {
        ... on PullRequest {
          title
          url
          body
          createdAt
          closedAt
          state
          repository { name }
          author { login, __typename }
          comments(first: 30) {
            totalCount
            nodes { body }
          }
          reviewThreads(first: 10) {
            totalCount
            nodes { comments(first: 30) { nodes { body } } }
          }
          commits { totalCount }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
  rateLimit { remaining resetAt }
}
"#;

const FILE_DETAILS_QUERY: &str = r#"
query ($owner: String!, $repo: String!, $prNumber: Int!, $filesCursor: String) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $prNumber) {
      changedFiles
      additions
      deletions
      files(first: 100, after: $filesCursor) {
        nodes { path, changeType }
        pageInfo { endCursor, hasNextPage }
      }
    }
  }
  rateLimit { remaining resetAt }
}
"#;

const PR_METRICS_QUERY: &str = r#"
query ($owner: String!, $repo: String!, $prNumber: Int!) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $prNumber) {
      additions
      deletions
      changedFiles
      comments { totalCount }
      commits { totalCount }
    }
  }
}
"#;

/// Bearer-authenticated GraphQL client with bounded retry around every call:
/// 401 is fatal, 403 and RATE_LIMITED wait out the reported reset, other
/// transport errors back off linearly up to the retry ceiling.
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
}

impl GithubClient {
    pub fn new(token: &str) -> Result<Self, GithubError> {
        if token.is_empty() || token == "your_token" {
            return Err(GithubError::MissingToken);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            token: token.to_string(),
        })
    }

    /// Issue one GraphQL query, retrying transient failures. Returns the
    /// `data` object on success.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, GithubError> {
        let body = json!({ "query": query, "variables": variables });
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let sent = self
                .http
                .post(GRAPHQL_URL)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    if attempt >= MAX_RETRIES {
                        return Err(err.into());
                    }
                    warn!(attempt, error = %err, "request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(10 * u64::from(attempt))).await;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(GithubError::BadCredentials);
            }
            if status == StatusCode::FORBIDDEN {
                if attempt >= MAX_RETRIES {
                    return Err(GithubError::RetriesExhausted(
                        "rate limited (HTTP 403)".to_string(),
                    ));
                }
                let wait = reset_wait_from_headers(response.headers())
                    .unwrap_or(Duration::from_secs(60 * u64::from(attempt)));
                warn!(attempt, wait_secs = wait.as_secs(), "HTTP 403, waiting for rate limit reset");
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                if attempt >= MAX_RETRIES {
                    return Err(GithubError::Status(status));
                }
                warn!(attempt, %status, "server error, retrying");
                tokio::time::sleep(Duration::from_secs(10 * u64::from(attempt))).await;
                continue;
            }

            let envelope = match response.json::<GraphqlEnvelope>().await {
                Ok(envelope) => envelope,
                Err(err) => {
                    if attempt >= MAX_RETRIES {
                        return Err(err.into());
                    }
                    warn!(attempt, error = %err, "undecodable response body, retrying");
                    tokio::time::sleep(Duration::from_secs(10 * u64::from(attempt))).await;
                    continue;
                }
            };

            if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
                let rate_limited = errors
                    .iter()
                    .any(|error| error.error_type.as_deref() == Some("RATE_LIMITED"));
                if rate_limited {
                    if attempt >= MAX_RETRIES {
                        return Err(GithubError::RetriesExhausted(
                            "rate limited (GraphQL error)".to_string(),
                        ));
                    }
                    let wait = Duration::from_secs(60 * u64::from(attempt));
                    warn!(attempt, wait_secs = wait.as_secs(), "RATE_LIMITED, backing off");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                let messages = errors
                    .iter()
                    .map(|error| error.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(GithubError::Graphql(messages));
            }

            return envelope
                .data
                .ok_or_else(|| GithubError::Graphql("response carried no data".to_string()));
        }
    }

    /// Sleep until the reported reset when the remaining budget is low.
    async fn respect_rate_limit(&self, rate_limit: Option<&RateLimit>) {
        let Some(rate_limit) = rate_limit else {
            return;
        };
        let Some(remaining) = rate_limit.remaining else {
            return;
        };
        if remaining >= RATE_LIMIT_FLOOR {
            return;
        }
        let wait = rate_limit
            .reset_at
            .as_deref()
            .and_then(parse_github_timestamp)
            .map(|reset| (reset - Utc::now()).num_seconds() + 20)
            .filter(|secs| *secs > 0)
            .map_or(Duration::from_secs(90), |secs| {
                Duration::from_secs(secs as u64)
            });
        warn!(remaining, wait_secs = wait.as_secs(), "approaching rate limit, waiting");
        tokio::time::sleep(wait).await;
    }

    async fn search_paginated(
        &self,
        query_doc: &str,
        search_query: &str,
        cap: usize,
    ) -> Result<Vec<PullRequestNode>, GithubError> {
        let mut nodes: Vec<PullRequestNode> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let variables = json!({ "cursor": cursor, "searchQuery": search_query });
            let data = self.graphql(query_doc, variables).await?;
            let page: SearchData = serde_json::from_value(data)?;
            self.respect_rate_limit(page.rate_limit.as_ref()).await;

            let before = nodes.len();
            for edge in page.search.edges {
                // non-PR search hits project to an empty node
                if let Some(node) = edge.node.filter(|node| node.url.is_some()) {
                    nodes.push(node);
                }
            }
            debug!(
                page_hits = nodes.len() - before,
                total = nodes.len(),
                "fetched search page"
            );

            if nodes.len() >= cap {
                warn!(cap, "item cap reached for this search, stopping pagination");
                break;
            }
            if !page.search.page_info.has_next_page {
                break;
            }
            cursor = page.search.page_info.end_cursor;
            tokio::time::sleep(SEARCH_PAGE_DELAY).await;
        }
        Ok(nodes)
    }

    /// All PRs matching a marker search, across every result page (capped).
    pub async fn search_pull_requests(
        &self,
        search_query: &str,
        cap: usize,
    ) -> Result<Vec<PullRequestNode>, GithubError> {
        self.search_paginated(SEARCH_COMMENTS_QUERY, search_query, cap)
            .await
    }

    /// Closed PRs of one repository created inside a date window, used to
    /// build the counterfactual candidate pool.
    pub async fn repo_pull_requests(
        &self,
        repo_slug: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<PullRequestNode>, GithubError> {
        let search_query =
            format!("repo:{repo_slug} is:pr is:closed created:{start}..{end}");
        self.search_paginated(POOL_SEARCH_QUERY, &search_query, usize::MAX)
            .await
    }

    /// Top-level size stats plus the full (paginated) changed-file list for
    /// one PR. The file list is truncated at FILE_LIST_CAP entries.
    pub async fn file_stats(&self, pr: &PrUrl) -> Result<FileStats, GithubError> {
        let mut stats = FileStats::default();
        let mut cursor: Option<String> = None;
        let mut first_page = true;

        loop {
            let variables = json!({
                "owner": pr.owner,
                "repo": pr.repo,
                "prNumber": pr.number,
                "filesCursor": cursor,
            });
            let data = self.graphql(FILE_DETAILS_QUERY, variables).await?;
            let page: RepositoryData = serde_json::from_value(data)?;
            self.respect_rate_limit(page.rate_limit.as_ref()).await;

            let Some(detail) = page.repository.and_then(|repo| repo.pull_request) else {
                return Err(GithubError::Graphql(format!(
                    "pull request {}#{} not found",
                    pr.repo_slug(),
                    pr.number
                )));
            };

            if first_page {
                stats.changefile = detail.changed_files;
                stats.addline = detail.additions;
                stats.deleteline = detail.deletions;
                first_page = false;
            }

            let Some(files) = detail.files else {
                break;
            };
            stats.files.extend(files.nodes.into_iter().flatten());

            if stats.files.len() >= FILE_LIST_CAP {
                warn!(
                    pr = %pr.repo_slug(),
                    number = pr.number,
                    "file list cap reached, returning partial list"
                );
                break;
            }
            if !files.page_info.has_next_page {
                break;
            }
            cursor = files.page_info.end_cursor;
            tokio::time::sleep(FILE_PAGE_DELAY).await;
        }
        Ok(stats)
    }

    /// Paths of every file the PR touches, for the sampler's extension probe.
    pub async fn modified_files(&self, pr: &PrUrl) -> Result<Vec<String>, GithubError> {
        let stats = self.file_stats(pr).await?;
        Ok(stats.files.into_iter().map(|file| file.path).collect())
    }

    /// Single-shot metric fetch for the enrichment stage.
    pub async fn pr_metrics(&self, pr: &PrUrl) -> Result<PrMetrics, GithubError> {
        let variables = json!({
            "owner": pr.owner,
            "repo": pr.repo,
            "prNumber": pr.number,
        });
        let data = self.graphql(PR_METRICS_QUERY, variables).await?;
        let page: RepositoryData = serde_json::from_value(data)?;

        let Some(detail) = page.repository.and_then(|repo| repo.pull_request) else {
            return Err(GithubError::Graphql(format!(
                "pull request {}#{} not found",
                pr.repo_slug(),
                pr.number
            )));
        };
        Ok(PrMetrics {
            additions: detail.additions,
            deletions: detail.deletions,
            changed_files: detail.changed_files,
            total_comments: detail.comments.map(|c| c.total_count),
            total_commits: detail.commits.map(|c| c.total_count),
        })
    }
}

/// Seconds until the window reset advertised by `x-ratelimit-reset`, plus a
/// little slack.
fn reset_wait_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let reset = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()?;
    let wait = reset - Utc::now().timestamp() + 5;
    (wait > 0).then(|| Duration::from_secs(wait as u64))
}
