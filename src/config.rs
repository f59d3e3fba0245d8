use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Date settings file not found: {0}")]
    SettingsNotFound(String),
}

const CONFIG_FILE: &str = ".vrt-pipeline.toml";

fn default_marker() -> String {
    "www.chromatic.com/test?".to_string()
}

fn default_range_cap() -> usize {
    1000
}

fn default_extensions() -> Vec<String> {
    [
        ".tsx", ".ts", ".json", ".js", ".md", ".scss", ".lock", ".yml", ".css", ".mdx",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_require_image() -> bool {
    true
}

/// Top-level configuration loaded from .vrt-pipeline.toml.
/// All fields are optional — every stage runs with zero config plus a
/// GITHUB_TOKEN environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub collect: CollectConfig,

    #[serde(default)]
    pub sample: SampleConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    /// Marker string whose presence in a PR comment flags the PR as VRT-using.
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Maximum search hits accepted per date range before moving on.
    #[serde(default = "default_range_cap")]
    pub range_cap: usize,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            range_cap: default_range_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleConfig {
    /// A counterfactual candidate must touch at least one file with one of
    /// these extensions.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Require an embedded image in the PR body or comments when building
    /// the candidate pool.
    #[serde(default = "default_require_image")]
    pub require_image: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            require_image: default_require_image(),
        }
    }
}

impl Config {
    /// Load configuration from .vrt-pipeline.toml in the current directory.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };

        if config.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                config.github.token = Some(token);
            }
        }

        Ok(config)
    }

    /// Load from a specific path (useful for testing).
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Resolve the GitHub token: config file value takes precedence,
    /// falls back to GITHUB_TOKEN env var.
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
    }
}

/// An inclusive creation-date window passed straight into GitHub search
/// query strings. The raw strings are kept as written in settings.txt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// Load date ranges from a settings file: one `start,end` pair per line,
/// `#` comments and blank lines skipped. Malformed or inverted ranges are
/// skipped with a warning; a missing file is fatal.
pub fn load_date_ranges(path: &Path) -> Result<Vec<DateRange>, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|_| ConfigError::SettingsNotFound(path.display().to_string()))?;

    let mut ranges = Vec::new();
    for (line_num, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((start, end)) = line.split_once(',') else {
            warn!(line = line_num + 1, content = line, "invalid date range format, skipping");
            continue;
        };
        let start = start.trim();
        let end = end.trim();
        let (Some(start_day), Some(end_day)) = (parse_day(start), parse_day(end)) else {
            warn!(line = line_num + 1, content = line, "unparseable date, skipping");
            continue;
        };
        if start_day > end_day {
            warn!(line = line_num + 1, content = line, "start after end, skipping");
            continue;
        }
        ranges.push(DateRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(ranges)
}

/// Accepts `2021-04-01` or a full RFC 3339 timestamp.
fn parse_day(value: &str) -> Option<NaiveDate> {
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(day);
    }
    crate::record::parse_github_timestamp(value).map(|stamp| stamp.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.github.token.is_none());
        assert_eq!(config.collect.marker, "www.chromatic.com/test?");
        assert_eq!(config.collect.range_cap, 1000);
        assert_eq!(config.sample.extensions.len(), 10);
        assert!(config.sample.require_image);
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[collect]
marker = "percy.io/"
range_cap = 500

[sample]
extensions = [".vue"]
require_image = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.collect.marker, "percy.io/");
        assert_eq!(config.collect.range_cap, 500);
        assert_eq!(config.sample.extensions, vec![".vue"]);
        assert!(!config.sample.require_image);
    }

    #[test]
    fn test_load_date_ranges_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2021-01-01,2021-06-30").unwrap();
        writeln!(file, "2021-12-31,2021-01-01").unwrap();
        writeln!(file, "only-one-field").unwrap();
        writeln!(file, "soon,later").unwrap();
        writeln!(file, "2022-01-01T00:00:00Z,2022-06-30T23:59:59Z").unwrap();

        let ranges = load_date_ranges(file.path()).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, "2021-01-01");
        assert_eq!(ranges[1].end, "2022-06-30T23:59:59Z");
    }

    #[test]
    fn test_load_date_ranges_missing_file() {
        let err = load_date_ranges(Path::new("/nonexistent/settings.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::SettingsNotFound(_)));
    }
}
