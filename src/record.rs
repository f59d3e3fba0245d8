use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parsed components of a GitHub pull request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrUrl {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PrUrl {
    /// `owner/repo`, the key used for per-repository grouping everywhere.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Parse `https://github.com/{owner}/{repo}/pull/{number}` into parts.
/// Returns None for anything else; callers treat that as a data-quality
/// issue on the row, not a fatal error.
pub fn parse_pr_url(url: &str) -> Option<PrUrl> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if parsed.host_str() != Some("github.com") {
        return None;
    }
    let segments: Vec<_> = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() != 4 || segments[2] != "pull" {
        return None;
    }
    let number = segments[3].parse::<u64>().ok()?;
    Some(PrUrl {
        owner: segments[0].to_string(),
        repo: segments[1].to_string(),
        number,
    })
}

/// GitHub timestamps are RFC 3339 (`2021-04-01T12:00:00Z`). Unparseable
/// values yield None and the row is dropped or zero-contributes downstream.
pub fn parse_github_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

/// One matching comment on a VRT pull request, as written by the collector.
/// Field order and names are the CSV contract; `comment_count_since_comment`
/// duplicates `commit_count_since_comment` for parity with existing datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRow {
    pub pr_title: String,
    pub text: String,
    pub url: String,
    pub comment_index: i64,
    pub commit_count_since_comment: u64,
    pub total_comments: u64,
    pub total_commits: u64,
    pub comment_count_since_comment: u64,
    pub created_at: String,
    pub closed_at: String,
    pub state: String,
    pub changefile: Option<u64>,
    pub addline: Option<u64>,
    pub deleteline: Option<u64>,
    #[serde(rename = "fileChanges")]
    pub file_changes: Option<String>,
}

/// A counterfactual candidate PR, produced by the pool stage and carried
/// through sampling into enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRow {
    pub repo_name: String,
    pub pr_title: String,
    pub pr_url: String,
    pub created_at: String,
    pub closed_at: String,
    pub total_comments: u64,
    pub total_commits: u64,
    pub state: String,
}

/// A sampled PR with size/activity metrics attached. `fetch_status` is
/// `Success` or an error marker; failed rows stay in the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub repo_name: String,
    pub pr_title: String,
    pub pr_url: String,
    pub created_at: String,
    pub closed_at: String,
    pub total_comments: Option<u64>,
    pub total_commits: Option<u64>,
    pub state: String,
    pub addline: Option<u64>,
    pub deleteline: Option<u64>,
    pub changefile: Option<u64>,
    pub fetch_status: String,
}

impl EnrichedRow {
    pub fn failed(row: CandidateRow, status: &str) -> Self {
        Self {
            repo_name: row.repo_name,
            pr_title: row.pr_title,
            pr_url: row.pr_url,
            created_at: row.created_at,
            closed_at: row.closed_at,
            total_comments: Some(row.total_comments),
            total_commits: Some(row.total_commits),
            state: row.state,
            addline: None,
            deleteline: None,
            changefile: None,
            fetch_status: status.to_string(),
        }
    }
}

/// Per-repository aggregate emitted by the deduplicator and consumed by the
/// sampler: `unique_pr_count` is the target sample size for that repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCountRow {
    pub repository_name: String,
    pub comment_count: u64,
    pub unique_pr_count: u64,
    pub pull_numbers: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_pr_url() {
        let url = parse_pr_url("https://github.com/org/repo/pull/42").unwrap();
        assert_eq!(url.owner, "org");
        assert_eq!(url.repo, "repo");
        assert_eq!(url.number, 42);
        assert_eq!(url.repo_slug(), "org/repo");
    }

    #[test]
    fn test_parse_invalid_pr_url() {
        assert!(parse_pr_url("https://example.com/org/repo/pull/1").is_none());
        assert!(parse_pr_url("not-a-url").is_none());
        assert!(parse_pr_url("https://github.com/org/repo/pulls/42").is_none());
        assert!(parse_pr_url("https://github.com/org/repo/pull/abc").is_none());
    }

    #[test]
    fn test_parse_github_timestamp() {
        let stamp = parse_github_timestamp("2021-04-01T12:00:00Z").unwrap();
        assert_eq!(stamp.timestamp(), 1_617_278_400);
        assert!(parse_github_timestamp("yesterday").is_none());
        assert!(parse_github_timestamp("").is_none());
    }

    #[test]
    fn test_comment_row_csv_header_contract() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(CommentRow {
                pr_title: "t".into(),
                text: "body".into(),
                url: "u".into(),
                comment_index: 1,
                commit_count_since_comment: 0,
                total_comments: 2,
                total_commits: 3,
                comment_count_since_comment: 0,
                created_at: "2021-01-01T00:00:00Z".into(),
                closed_at: "2021-01-02T00:00:00Z".into(),
                state: "MERGED".into(),
                changefile: Some(4),
                addline: None,
                deleteline: None,
                file_changes: None,
            })
            .unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = out.lines().next().unwrap();
        assert_eq!(
            header,
            "pr_title,text,url,comment_index,commit_count_since_comment,\
             total_comments,total_commits,comment_count_since_comment,\
             created_at,closed_at,state,changefile,addline,deleteline,fileChanges"
        );
    }
}
