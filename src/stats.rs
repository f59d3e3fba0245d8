//! Descriptive statistics and the hypothesis tests used to compare the VRT
//! and counterfactual cohorts. Semantics follow the scipy/lifelines
//! reference implementations so existing result tables stay comparable:
//! Mann-Whitney U uses the two-sided asymptotic normal approximation with
//! tie and continuity corrections, the 2x2 chi-square applies Yates'
//! correction, and Fisher's exact test sums tables whose point probability
//! does not exceed the observed one.

use statrs::function::erf::erfc;
use statrs::function::gamma::ln_gamma;
use std::cmp::Ordering;
use std::fmt;

/// Mean/median/std/min/max/count of one cohort's metric values.
/// `std` is the sample standard deviation (n-1 denominator), NaN for n < 2.
#[derive(Debug, Clone)]
pub struct Descriptive {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

pub fn descriptive(values: &[f64]) -> Option<Descriptive> {
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    };

    let std = if count < 2 {
        f64::NAN
    } else {
        let ss = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        (ss / (count as f64 - 1.0)).sqrt()
    };

    Some(Descriptive {
        mean,
        median,
        std,
        min: sorted[0],
        max: sorted[count - 1],
        count,
    })
}

/// Two-sided Mann-Whitney U test. Returns (U1, p) where U1 is the statistic
/// of the first sample. None when either sample is empty; p is NaN when the
/// pooled data has no variance (all values tied).
pub fn mann_whitney_u(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n1 = x.len();
    let n2 = y.len();
    if n1 == 0 || n2 == 0 {
        return None;
    }

    let mut pooled: Vec<(f64, bool)> = x
        .iter()
        .map(|&v| (v, true))
        .chain(y.iter().map(|&v| (v, false)))
        .collect();
    pooled.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let n = n1 + n2;
    let mut rank_sum_x = 0.0;
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        let ties = (j - i + 1) as f64;
        let avg_rank = ((i + 1) as f64 + (j + 1) as f64) / 2.0;
        for entry in &pooled[i..=j] {
            if entry.1 {
                rank_sum_x += avg_rank;
            }
        }
        tie_term += ties * ties * ties - ties;
        i = j + 1;
    }

    let n1f = n1 as f64;
    let n2f = n2 as f64;
    let nf = n as f64;
    let u1 = rank_sum_x - n1f * (n1f + 1.0) / 2.0;
    let u2 = n1f * n2f - u1;

    let mean_u = n1f * n2f / 2.0;
    let sigma_sq = n1f * n2f / 12.0 * ((nf + 1.0) - tie_term / (nf * (nf - 1.0)));
    if sigma_sq <= 0.0 {
        return Some((u1, f64::NAN));
    }
    let z = (u1.max(u2) - mean_u - 0.5) / sigma_sq.sqrt();
    let p = (2.0 * norm_sf(z)).clamp(0.0, 1.0);
    Some((u1, p))
}

/// Effect-size magnitude bands for the rank-biserial correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectMagnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectMagnitude {
    fn from_r(r: f64) -> Self {
        let abs_r = r.abs();
        if abs_r < 0.1 {
            Self::Negligible
        } else if abs_r < 0.3 {
            Self::Small
        } else if abs_r < 0.5 {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

impl fmt::Display for EffectMagnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Negligible => "-",
            Self::Small => "(S)",
            Self::Medium => "(M)",
            Self::Large => "(L)",
        };
        write!(f, "{tag}")
    }
}

/// Rank-biserial correlation from a Mann-Whitney U statistic:
/// r = 1 - 2U / (n1 * n2), banded into the usual magnitude classes.
pub fn rank_biserial(u: f64, n1: usize, n2: usize) -> Option<(f64, EffectMagnitude)> {
    if n1 == 0 || n2 == 0 {
        return None;
    }
    let r = 1.0 - (2.0 * u) / (n1 as f64 * n2 as f64);
    Some((r, EffectMagnitude::from_r(r)))
}

/// Two-group log-rank test over fully observed event times (no censoring).
/// Returns (chi-square statistic with 1 df, p).
pub fn log_rank(a: &[f64], b: &[f64]) -> Option<(f64, f64)> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let mut times: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    times.sort_by(|x, y| x.partial_cmp(y).unwrap_or(Ordering::Equal));
    times.dedup();

    let mut observed_minus_expected = 0.0;
    let mut variance = 0.0;
    for &t in &times {
        let deaths_a = a.iter().filter(|&&v| v == t).count() as f64;
        let deaths_b = b.iter().filter(|&&v| v == t).count() as f64;
        let at_risk_a = a.iter().filter(|&&v| v >= t).count() as f64;
        let at_risk_b = b.iter().filter(|&&v| v >= t).count() as f64;
        let deaths = deaths_a + deaths_b;
        let at_risk = at_risk_a + at_risk_b;

        observed_minus_expected += deaths_a - deaths * at_risk_a / at_risk;
        if at_risk > 1.0 {
            variance += deaths * (at_risk_a / at_risk) * (at_risk_b / at_risk) * (at_risk - deaths)
                / (at_risk - 1.0);
        }
    }

    if variance <= 0.0 {
        return None;
    }
    let stat = observed_minus_expected * observed_minus_expected / variance;
    Some((stat, chi2_sf_df1(stat)))
}

/// Chi-square test of independence for a 2x2 table with Yates' continuity
/// correction. Returns (statistic, p); None when any expected cell is zero.
pub fn chi_square_2x2(table: [[u64; 2]; 2]) -> Option<(f64, f64)> {
    let observed = [
        table[0][0] as f64,
        table[0][1] as f64,
        table[1][0] as f64,
        table[1][1] as f64,
    ];
    let row1 = observed[0] + observed[1];
    let row2 = observed[2] + observed[3];
    let col1 = observed[0] + observed[2];
    let col2 = observed[1] + observed[3];
    let n = row1 + row2;
    if n == 0.0 {
        return None;
    }

    let expected = [
        row1 * col1 / n,
        row1 * col2 / n,
        row2 * col1 / n,
        row2 * col2 / n,
    ];
    if expected.iter().any(|e| *e == 0.0) {
        return None;
    }

    let stat = observed
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| {
            let diff = ((o - e).abs() - 0.5).max(0.0);
            diff * diff / e
        })
        .sum::<f64>();
    Some((stat, chi2_sf_df1(stat)))
}

/// Two-sided Fisher's exact test for a 2x2 table. Returns
/// (sample odds ratio, p). Degenerate margins give (NaN, 1.0).
pub fn fisher_exact_2x2(table: [[u64; 2]; 2]) -> Option<(f64, f64)> {
    let [[a, b], [c, d]] = table;
    let row1 = a + b;
    let row2 = c + d;
    let col1 = a + c;
    let n = row1 + row2;
    if n == 0 {
        return None;
    }
    if row1 == 0 || row2 == 0 || col1 == 0 || col1 == n {
        return Some((f64::NAN, 1.0));
    }

    let low = row1.saturating_sub(n - col1);
    let high = row1.min(col1);
    let ln_denom = ln_binomial(n, col1);
    let ln_prob = |k: u64| ln_binomial(row1, k) + ln_binomial(row2, col1 - k) - ln_denom;

    let p_observed = ln_prob(a).exp();
    // scipy's tolerance for "as extreme as observed"
    let threshold = p_observed * (1.0 + 1e-7);
    let mut p = 0.0;
    for k in low..=high {
        let p_k = ln_prob(k).exp();
        if p_k <= threshold {
            p += p_k;
        }
    }

    let odds_ratio = if b == 0 || c == 0 {
        f64::INFINITY
    } else {
        (a as f64 * d as f64) / (b as f64 * c as f64)
    };
    Some((odds_ratio, p.min(1.0)))
}

fn ln_binomial(n: u64, k: u64) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Standard normal survival function.
fn norm_sf(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Chi-square survival function for one degree of freedom.
fn chi2_sf_df1(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    erfc((x / 2.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_descriptive_basic() {
        let stats = descriptive(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_close(stats.mean, 2.5, 1e-12);
        assert_close(stats.median, 2.5, 1e-12);
        assert_close(stats.std, 1.2909944487358056, 1e-12);
        assert_close(stats.min, 1.0, 0.0);
        assert_close(stats.max, 4.0, 0.0);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn test_descriptive_single_value_has_nan_std() {
        let stats = descriptive(&[7.0]).unwrap();
        assert!(stats.std.is_nan());
        assert_close(stats.median, 7.0, 0.0);
        assert!(descriptive(&[]).is_none());
    }

    #[test]
    fn test_mann_whitney_matches_scipy_asymptotic() {
        // scipy.stats.mannwhitneyu(a, b, alternative="two-sided",
        // method="asymptotic") on these samples (with ties across groups)
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let b = [2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0];
        let (u, p) = mann_whitney_u(&a, &b).unwrap();
        assert_close(u, 22.5, 1e-12);
        assert_close(p, 0.040869107495709794, 1e-9);
    }

    #[test]
    fn test_mann_whitney_empty_and_constant() {
        assert!(mann_whitney_u(&[], &[1.0]).is_none());
        let (u, p) = mann_whitney_u(&[5.0, 5.0], &[5.0, 5.0]).unwrap();
        assert_close(u, 2.0, 1e-12);
        assert!(p.is_nan());
    }

    #[test]
    fn test_rank_biserial_reference_value() {
        // r = 1 - 2*100/(20*20) = 0.5, banded large
        let (r, magnitude) = rank_biserial(100.0, 20, 20).unwrap();
        assert_close(r, 0.5, 1e-12);
        assert_eq!(magnitude, EffectMagnitude::Large);
        assert_eq!(magnitude.to_string(), "(L)");
    }

    #[test]
    fn test_rank_biserial_banding_edges() {
        let band = |u: f64, n: usize| rank_biserial(u, n, n).unwrap().1;
        // r = 0.05
        assert_eq!(band(190.0, 20), EffectMagnitude::Negligible);
        // r = 0.1 is small, not negligible
        assert_eq!(band(180.0, 20), EffectMagnitude::Small);
        // r = 0.3 is medium
        assert_eq!(band(140.0, 20), EffectMagnitude::Medium);
        // r = -0.6
        assert_eq!(band(320.0, 20), EffectMagnitude::Large);
        assert!(rank_biserial(1.0, 0, 5).is_none());
    }

    #[test]
    fn test_log_rank_interleaved_groups() {
        let a = [1.0, 3.0, 5.0, 7.0, 9.0, 11.0, 13.0, 15.0];
        let b = [2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0];
        let (stat, p) = log_rank(&a, &b).unwrap();
        assert_close(stat, 0.27624088292356874, 1e-9);
        assert_close(p, 0.5991757276750245, 1e-9);
    }

    #[test]
    fn test_log_rank_separated_groups() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [6.0, 7.0, 8.0, 9.0, 10.0];
        let (stat, p) = log_rank(&a, &b).unwrap();
        assert_close(stat, 9.700742820077764, 1e-9);
        assert_close(p, 0.0018419354016197998, 1e-9);
        assert!(p < 0.05);
    }

    #[test]
    fn test_chi_square_matches_scipy_yates() {
        // scipy.stats.chi2_contingency([[282, 25], [259, 40]])
        let (stat, p) = chi_square_2x2([[282, 25], [259, 40]]).unwrap();
        assert_close(stat, 3.8050767398959544, 1e-9);
        assert_close(p, 0.0510974343281542, 1e-9);
    }

    #[test]
    fn test_fisher_exact_matches_scipy() {
        // scipy.stats.fisher_exact([[282, 25], [259, 40]])
        let (odds_ratio, p) = fisher_exact_2x2([[282, 25], [259, 40]]).unwrap();
        assert_close(odds_ratio, 1.742084942084942, 1e-9);
        assert_close(p, 0.04829022669536673, 1e-9);
    }

    #[test]
    fn test_fisher_exact_degenerate_margins() {
        let (odds_ratio, p) = fisher_exact_2x2([[0, 0], [5, 3]]).unwrap();
        assert!(odds_ratio.is_nan());
        assert_close(p, 1.0, 0.0);
        assert!(fisher_exact_2x2([[0, 0], [0, 0]]).is_none());
    }

    #[test]
    fn test_chi_square_zero_expected_cell() {
        assert!(chi_square_2x2([[0, 0], [5, 3]]).is_none());
    }
}
