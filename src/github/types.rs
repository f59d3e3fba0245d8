use serde::Deserialize;
use serde_json::Value;

/// Top-level GraphQL response body: either `data`, `errors`, or both.
#[derive(Debug, Deserialize)]
pub struct GraphqlEnvelope {
    pub data: Option<Value>,
    pub errors: Option<Vec<GraphqlErrorItem>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlErrorItem {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// Served alongside query data when the query selects `rateLimit`; used for
/// proactive back-off before the hard limit trips.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub remaining: Option<i64>,
    pub reset_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchData {
    pub search: SearchConnection,
    #[serde(rename = "rateLimit")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConnection {
    #[serde(default)]
    pub edges: Vec<SearchEdge>,
    pub page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
pub struct SearchEdge {
    pub node: Option<PullRequestNode>,
}

/// A pull request hit from a `search(type: ISSUE)` query. Issues that are
/// not PRs deserialize as an all-None node and are filtered out by `url`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestNode {
    pub title: Option<String>,
    pub url: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<String>,
    pub closed_at: Option<String>,
    pub state: Option<String>,
    pub repository: Option<RepositoryRef>,
    pub author: Option<Actor>,
    pub comments: Option<CommentConnection>,
    pub review_threads: Option<ReviewThreadConnection>,
    pub commits: Option<CommitConnection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub login: Option<String>,
    #[serde(rename = "__typename")]
    pub typename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentConnection {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub nodes: Vec<Option<CommentNode>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    #[serde(default)]
    pub body: String,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub author: Option<Actor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewThreadConnection {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub nodes: Vec<Option<ReviewThread>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewThread {
    pub comments: Option<CommentConnection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitConnection {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub nodes: Vec<Option<CommitEdge>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitEdge {
    pub commit: Option<CommitInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub committed_date: Option<String>,
}

// --- repository(...) { pullRequest(...) } responses ---

#[derive(Debug, Deserialize)]
pub struct RepositoryData {
    pub repository: Option<RepositoryPullRequest>,
    #[serde(rename = "rateLimit")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPullRequest {
    pub pull_request: Option<PullRequestDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestDetail {
    pub changed_files: Option<u64>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub comments: Option<TotalCount>,
    pub commits: Option<TotalCount>,
    pub files: Option<FileConnection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalCount {
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConnection {
    #[serde(default)]
    pub nodes: Vec<Option<FileNode>>,
    pub page_info: PageInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub path: String,
    pub change_type: Option<String>,
}

/// Accumulated result of the paginated file-detail query for one PR.
#[derive(Debug, Clone, Default)]
pub struct FileStats {
    pub changefile: Option<u64>,
    pub addline: Option<u64>,
    pub deleteline: Option<u64>,
    pub files: Vec<FileNode>,
}

impl FileStats {
    /// `CHANGE_TYPE:path` per file, newline-joined; None when no files.
    pub fn joined_changes(&self) -> Option<String> {
        if self.files.is_empty() {
            return None;
        }
        let joined = self
            .files
            .iter()
            .map(|file| {
                format!(
                    "{}:{}",
                    file.change_type.as_deref().unwrap_or("UNKNOWN"),
                    file.path
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Some(joined)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|file| file.path.as_str()).collect()
    }
}

/// Size/activity metrics for one PR, fetched by the enrichment stage.
#[derive(Debug, Clone)]
pub struct PrMetrics {
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub changed_files: Option<u64>,
    pub total_comments: Option<u64>,
    pub total_commits: Option<u64>,
}
