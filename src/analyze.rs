//! Analysis stage: compares the VRT cohort against the sampled visual
//! cohort on time-to-merge, size and activity metrics, and acceptance rate.
//! Results land in one CSV; a significance summary goes to the terminal.

use colored::Colorize;
use csv::StringRecord;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::parse_github_timestamp;
use crate::stats::{
    chi_square_2x2, descriptive, fisher_exact_2x2, log_rank, mann_whitney_u, rank_biserial,
};

const ALPHA: f64 = 0.05;
const COHORT_A: &str = "VRT PR";
const COHORT_B: &str = "Visual PR";

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Failed to read or write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Input CSV is missing required column '{0}'")]
    MissingColumn(String),
}

/// One loaded stage-boundary CSV.
pub struct Table {
    headers: StringRecord,
    rows: Vec<StringRecord>,
}

impl Table {
    pub fn load(path: &Path) -> Result<Self, AnalyzeError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(Self { headers, rows })
    }

    fn column(&self, name: &str) -> Result<usize, AnalyzeError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| AnalyzeError::MissingColumn(name.to_string()))
    }

    fn column_opt(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

#[derive(Debug, Serialize)]
struct ResultRow {
    #[serde(rename = "Metric")]
    metric: String,
    #[serde(rename = "Statistic")]
    statistic: String,
    #[serde(rename = "VRT PR")]
    vrt: String,
    #[serde(rename = "Visual PR")]
    visual: String,
}

/// Total / merged / closed tallies of one cohort.
#[derive(Debug, PartialEq, Eq)]
pub struct StateCounts {
    pub total: u64,
    pub merged: u64,
    pub closed: u64,
}

impl StateCounts {
    fn merged_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.merged as f64 / self.total as f64 * 100.0
        }
    }
}

/// Run the analysis over the VRT rows, the enriched visual rows, and
/// (optionally) a separate visual file for the acceptance-rate tallies.
pub fn run(
    vrt_csv: &Path,
    visual_csv: &Path,
    visual_states_csv: Option<&Path>,
    output: &Path,
) -> Result<(), AnalyzeError> {
    let vrt = Table::load(vrt_csv)?;
    let visual = Table::load(visual_csv)?;
    let visual_states = match visual_states_csv {
        Some(path) => Table::load(path)?,
        None => Table::load(visual_csv)?,
    };
    info!(
        vrt_rows = vrt.rows.len(),
        visual_rows = visual.rows.len(),
        "analysis inputs loaded"
    );

    let mut results: Vec<ResultRow> = Vec::new();

    // acceptance rate
    let counts_a = state_counts(&vrt)?;
    let counts_b = state_counts(&visual_states)?;
    push_state_rows(&mut results, &counts_a, &counts_b);

    let table = [
        [counts_a.merged, counts_a.closed],
        [counts_b.merged, counts_b.closed],
    ];
    if let Some((stat, p)) = chi_square_2x2(table) {
        results.push(stat_row("Acceptance Rate", "Chi-Square Statistic", fmt_stat(stat)));
        results.push(stat_row("Acceptance Rate", "Chi-Square P-Value", fmt_p(p)));
        print_verdict("Acceptance rate (chi-square)", p);
    }
    if let Some((odds_ratio, p)) = fisher_exact_2x2(table) {
        results.push(stat_row(
            "Acceptance Rate",
            "Fisher Exact Odds Ratio",
            fmt_stat(odds_ratio),
        ));
        results.push(stat_row("Acceptance Rate", "Fisher Exact P-Value", fmt_p(p)));
        print_verdict("Acceptance rate (Fisher exact)", p);
        if p < ALPHA {
            let direction = if odds_ratio > 1.0 {
                format!("{COHORT_A} merged more often")
            } else {
                format!("{COHORT_B} merged more often")
            };
            println!("  {}", direction.cyan());
        }
    }

    // time to merge
    let time_metric = "Time to Merge (days)";
    let durations_a = durations_days(&vrt)?;
    let durations_b = durations_days(&visual)?;
    if !durations_a.is_empty() && !durations_b.is_empty() {
        push_descriptive_rows(&mut results, time_metric, &durations_a, &durations_b);
        push_comparison_rows(&mut results, time_metric, &durations_a, &durations_b);
        if let Some((stat, p)) = log_rank(&durations_a, &durations_b) {
            results.push(stat_row(time_metric, "Log-Rank Test Statistic", fmt_stat(stat)));
            results.push(stat_row(time_metric, "Log-Rank Test P-Value", fmt_p(p)));
            print_verdict("Time to merge (log-rank)", p);
        }
    } else {
        debug!(metric = time_metric, "cohort empty, metric skipped");
    }

    // size and activity metrics
    let metrics = [
        ("addline", "Added Lines"),
        ("deleteline", "Deleted Lines"),
        ("total_comments", "Total Comments"),
        ("total_commits", "Total Commits"),
        ("changefile", "Changed Files"),
    ];
    for (column, name) in metrics {
        let values_a = metric_values(&vrt, column)?;
        let values_b = metric_values(&visual, column)?;
        if values_a.is_empty() || values_b.is_empty() {
            debug!(metric = name, "cohort empty, metric skipped");
            continue;
        }
        push_descriptive_rows(&mut results, name, &values_a, &values_b);
        if let Some(p) = push_comparison_rows(&mut results, name, &values_a, &values_b) {
            print_verdict(name, p);
        }
    }

    let mut writer = csv::Writer::from_path(output)?;
    for row in &results {
        writer.serialize(row)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    info!(rows = results.len(), output = %output.display(), "analysis written");
    Ok(())
}

/// MERGED rows with parseable dates and non-negative span, in days.
pub fn durations_days(table: &Table) -> Result<Vec<f64>, AnalyzeError> {
    let created_index = table.column("created_at")?;
    let closed_index = table.column("closed_at")?;
    let state_index = table.column("state")?;

    let mut durations = Vec::new();
    for row in &table.rows {
        if row.get(state_index).unwrap_or_default().to_uppercase() != "MERGED" {
            continue;
        }
        let (Some(created), Some(closed)) = (
            row.get(created_index).and_then(parse_github_timestamp),
            row.get(closed_index).and_then(parse_github_timestamp),
        ) else {
            continue;
        };
        let days = (closed - created).num_seconds() as f64 / 86_400.0;
        if days >= 0.0 {
            durations.push(days);
        }
    }
    Ok(durations)
}

/// Numeric values of one column over MERGED rows with valid dates.
/// Non-numeric and negative values are dropped. A file with no `state`
/// column is treated as all-merged (the enriched merged-only files).
pub fn metric_values(table: &Table, column: &str) -> Result<Vec<f64>, AnalyzeError> {
    let created_index = table.column("created_at")?;
    let closed_index = table.column("closed_at")?;
    let value_index = table.column(column)?;
    let state_index = table.column_opt("state");

    let mut values = Vec::new();
    for row in &table.rows {
        if let Some(state_index) = state_index {
            if row.get(state_index).unwrap_or_default().to_uppercase() != "MERGED" {
                continue;
            }
        }
        if row.get(created_index).and_then(parse_github_timestamp).is_none()
            || row.get(closed_index).and_then(parse_github_timestamp).is_none()
        {
            continue;
        }
        let Some(value) = row
            .get(value_index)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
        else {
            continue;
        };
        if value >= 0.0 {
            values.push(value);
        }
    }
    Ok(values)
}

pub fn state_counts(table: &Table) -> Result<StateCounts, AnalyzeError> {
    let state_index = table.column("state")?;
    let mut counts = StateCounts {
        total: 0,
        merged: 0,
        closed: 0,
    };
    for row in &table.rows {
        counts.total += 1;
        match row.get(state_index).unwrap_or_default().to_uppercase().as_str() {
            "MERGED" => counts.merged += 1,
            "CLOSED" => counts.closed += 1,
            _ => {}
        }
    }
    Ok(counts)
}

fn push_state_rows(results: &mut Vec<ResultRow>, a: &StateCounts, b: &StateCounts) {
    let pairs = [
        ("Total Count", a.total, b.total),
        ("Merged Count", a.merged, b.merged),
        ("Closed Count", a.closed, b.closed),
    ];
    for (statistic, left, right) in pairs {
        results.push(ResultRow {
            metric: "PR State".to_string(),
            statistic: statistic.to_string(),
            vrt: format!("{left}"),
            visual: format!("{right}"),
        });
    }
    results.push(ResultRow {
        metric: "Merged Percentage".to_string(),
        statistic: "Merged Percentage (%)".to_string(),
        vrt: format!("{:.2}", a.merged_pct()),
        visual: format!("{:.2}", b.merged_pct()),
    });
}

fn push_descriptive_rows(results: &mut Vec<ResultRow>, metric: &str, a: &[f64], b: &[f64]) {
    let (Some(stats_a), Some(stats_b)) = (descriptive(a), descriptive(b)) else {
        return;
    };
    let sum_a: f64 = a.iter().sum();
    let sum_b: f64 = b.iter().sum();
    let rows: [(&str, String, String); 7] = [
        ("mean", fmt_stat(stats_a.mean), fmt_stat(stats_b.mean)),
        ("median", fmt_stat(stats_a.median), fmt_stat(stats_b.median)),
        ("std", fmt_stat(stats_a.std), fmt_stat(stats_b.std)),
        ("min", format!("{:.1}", stats_a.min), format!("{:.1}", stats_b.min)),
        ("max", format!("{:.1}", stats_a.max), format!("{:.1}", stats_b.max)),
        (
            "count",
            format!("{}", stats_a.count),
            format!("{}", stats_b.count),
        ),
        ("sum", format!("{sum_a:.0}"), format!("{sum_b:.0}")),
    ];
    for (statistic, vrt, visual) in rows {
        results.push(ResultRow {
            metric: metric.to_string(),
            statistic: statistic.to_string(),
            vrt,
            visual,
        });
    }
}

/// Mann-Whitney U, its p-value, and the rank-biserial effect size. Returns
/// the p-value for the terminal summary.
fn push_comparison_rows(
    results: &mut Vec<ResultRow>,
    metric: &str,
    a: &[f64],
    b: &[f64],
) -> Option<f64> {
    let (u, p) = mann_whitney_u(a, b)?;
    results.push(stat_row(metric, "Mann-Whitney U Statistic", fmt_stat(u)));
    results.push(stat_row(metric, "Mann-Whitney U P-Value", fmt_p(p)));
    if let Some((r, magnitude)) = rank_biserial(u, a.len(), b.len()) {
        results.push(stat_row(
            metric,
            "Effect Size (r)",
            format!("{r:.3} {magnitude}"),
        ));
    }
    Some(p)
}

fn stat_row(metric: &str, statistic: &str, value: String) -> ResultRow {
    ResultRow {
        metric: metric.to_string(),
        statistic: statistic.to_string(),
        vrt: value,
        visual: String::new(),
    }
}

fn print_verdict(label: &str, p: f64) {
    if !p.is_finite() {
        return;
    }
    let verdict = if p < ALPHA {
        "significant difference".green().bold()
    } else {
        "no significant difference".yellow()
    };
    println!("{label}: {verdict} (p = {})", fmt_p(p));
}

fn fmt_stat(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.2}")
    } else {
        String::new()
    }
}

/// Four decimals, switching to scientific notation below 1e-4 (zero stays
/// fixed-point). Exponents are zero-padded to two digits.
fn fmt_p(p: f64) -> String {
    if !p.is_finite() {
        return String::new();
    }
    if p.abs() < 1e-4 && p != 0.0 {
        let formatted = format!("{p:.2e}");
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ("-", digits),
                    None => ("+", exponent),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => formatted,
        };
    }
    format!("{p:.4}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(csv_text: &str) -> Table {
        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let headers = reader.headers().unwrap().clone();
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        Table { headers, rows }
    }

    #[test]
    fn test_durations_filtering() {
        let t = table(
            "created_at,closed_at,state\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,MERGED\n\
             2021-01-01T00:00:00Z,2021-01-02T00:00:00Z,CLOSED\n\
             2021-01-05T00:00:00Z,2021-01-01T00:00:00Z,MERGED\n\
             garbage,2021-01-02T00:00:00Z,MERGED\n\
             2021-01-01T00:00:00Z,2021-01-01T12:00:00Z,merged\n",
        );
        let durations = durations_days(&t).unwrap();
        // closed, negative-span and unparseable rows dropped; lowercase kept
        assert_eq!(durations.len(), 2);
        assert!((durations[0] - 2.0).abs() < 1e-9);
        assert!((durations[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_metric_values_filtering() {
        let t = table(
            "created_at,closed_at,state,addline\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,MERGED,10\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,MERGED,-3\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,MERGED,abc\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,CLOSED,7\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,MERGED,\n\
             bad,2021-01-03T00:00:00Z,MERGED,5\n",
        );
        let values = metric_values(&t, "addline").unwrap();
        assert_eq!(values, vec![10.0]);

        let err = metric_values(&t, "deleteline").unwrap_err();
        assert!(matches!(err, AnalyzeError::MissingColumn(col) if col == "deleteline"));
    }

    #[test]
    fn test_metric_values_without_state_column() {
        let t = table(
            "created_at,closed_at,addline\n\
             2021-01-01T00:00:00Z,2021-01-03T00:00:00Z,4\n",
        );
        assert_eq!(metric_values(&t, "addline").unwrap(), vec![4.0]);
    }

    #[test]
    fn test_state_counts() {
        let t = table(
            "state\nMERGED\nmerged\nCLOSED\nOPEN\n",
        );
        let counts = state_counts(&t).unwrap();
        assert_eq!(
            counts,
            StateCounts {
                total: 4,
                merged: 2,
                closed: 1
            }
        );
        assert!((counts.merged_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_fmt_p_switches_to_scientific() {
        assert_eq!(fmt_p(0.0510974343281542), "0.0511");
        assert_eq!(fmt_p(0.04829022669536673), "0.0483");
        assert_eq!(fmt_p(0.0000483), "4.83e-05");
        assert_eq!(fmt_p(0.0), "0.0000");
        assert_eq!(fmt_p(f64::NAN), "");
    }

    #[test]
    fn test_run_produces_result_csv() {
        let dir = tempfile::tempdir().unwrap();
        let vrt_path = dir.path().join("vrt.csv");
        let visual_path = dir.path().join("visual.csv");
        let output_path = dir.path().join("result.csv");

        let mut vrt = std::fs::File::create(&vrt_path).unwrap();
        writeln!(vrt, "created_at,closed_at,state,addline,deleteline,total_comments,total_commits,changefile").unwrap();
        for i in 1..=6u32 {
            writeln!(
                vrt,
                "2021-01-01T00:00:00Z,2021-01-0{}T00:00:00Z,MERGED,{},{},{},{},{}",
                (i % 8) + 2, i * 10, i * 3, i, i, i
            )
            .unwrap();
        }
        writeln!(vrt, "2021-01-01T00:00:00Z,2021-01-02T00:00:00Z,CLOSED,1,1,1,1,1").unwrap();

        let mut visual = std::fs::File::create(&visual_path).unwrap();
        writeln!(visual, "created_at,closed_at,state,addline,deleteline,total_comments,total_commits,changefile").unwrap();
        for i in 1..=6u32 {
            writeln!(
                visual,
                "2021-01-01T00:00:00Z,2021-01-0{}T00:00:00Z,MERGED,{},{},{},{},{}",
                (i % 7) + 3, i * 20, i * 5, i + 1, i + 1, i + 2
            )
            .unwrap();
        }

        run(&vrt_path, &visual_path, None, &output_path).unwrap();

        let text = std::fs::read_to_string(&output_path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, "Metric,Statistic,VRT PR,Visual PR");
        assert!(text.contains("PR State,Total Count,7,6"));
        assert!(text.contains("Merged Percentage (%)"));
        assert!(text.contains("Time to Merge (days),count,6,6"));
        assert!(text.contains("Added Lines,Mann-Whitney U Statistic"));
        assert!(text.contains("Effect Size (r)"));
        assert!(text.contains("Log-Rank Test Statistic"));
    }
}
