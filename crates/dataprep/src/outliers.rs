use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CleanRow;

/// Statistical rule used to bound a numeric column.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutlierMethod {
    /// `[Q1 - k*IQR, Q3 + k*IQR]`
    Iqr { multiplier: f64 },
    /// `[mean - t*sd, mean + t*sd]`, population standard deviation
    ZScore { threshold: f64 },
}

impl Default for OutlierMethod {
    fn default() -> Self {
        Self::Iqr { multiplier: 1.5 }
    }
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iqr { multiplier } => write!(f, "iqr:{multiplier}"),
            Self::ZScore { threshold } => write!(f, "zscore:{threshold}"),
        }
    }
}

impl FromStr for OutlierMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (s.trim(), None),
        };
        let param = |default: f64| -> Result<f64, String> {
            match arg {
                None => Ok(default),
                Some(a) => match a.parse::<f64>() {
                    Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
                    _ => Err(format!("invalid outlier parameter `{a}`")),
                },
            }
        };
        match name.to_ascii_lowercase().as_str() {
            "iqr" => Ok(Self::Iqr { multiplier: param(1.5)? }),
            "zscore" | "z" => Ok(Self::ZScore { threshold: param(3.0)? }),
            other => Err(format!("unknown outlier method `{other}` (expected iqr or zscore)")),
        }
    }
}

impl TryFrom<String> for OutlierMethod {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OutlierMethod> for String {
    fn from(m: OutlierMethod) -> Self {
        m.to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Remove rows outside any column's bounds.
    Drop,
    /// Clamp values to the bounds.
    #[default]
    Cap,
    /// Flag only.
    Keep,
}

impl fmt::Display for OutlierPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drop => "drop",
            Self::Cap => "cap",
            Self::Keep => "keep",
        })
    }
}

impl FromStr for OutlierPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "cap" | "clip" => Ok(Self::Cap),
            "keep" => Ok(Self::Keep),
            other => Err(format!("unknown outlier policy `{other}` (expected drop, cap or keep)")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OutlierConfig {
    pub method: OutlierMethod,
    pub policy: OutlierPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub method: OutlierMethod,
    pub rows_affected: usize,
}

impl ColumnBounds {
    pub fn is_outlier(&self, v: f64) -> bool {
        v < self.lower || v > self.upper
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlierMetadata {
    pub method: OutlierMethod,
    pub policy: OutlierPolicy,
    pub rows_total: usize,
    pub rows_removed: usize,
    pub columns: Vec<ColumnBounds>,
}

/// Linear interpolation between order statistics; `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Bounds for one column. A constant column is bounded by its single value.
pub fn column_bounds(values: &[f64], method: OutlierMethod) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NEG_INFINITY, f64::INFINITY);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (min, max) = (sorted[0], sorted[sorted.len() - 1]);
    if min == max {
        return (min, max);
    }

    match method {
        OutlierMethod::Iqr { multiplier } => {
            let q1 = quantile(&sorted, 0.25);
            let q3 = quantile(&sorted, 0.75);
            let iqr = q3 - q1;
            (q1 - multiplier * iqr, q3 + multiplier * iqr)
        }
        OutlierMethod::ZScore { threshold } => {
            let n = sorted.len() as f64;
            let mean = sorted.iter().sum::<f64>() / n;
            let var = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            (mean - threshold * sd, mean + threshold * sd)
        }
    }
}

/// Computes per-column bounds over `rows` and counts flagged rows.
/// `rows_removed` stays 0 until [`apply_policy`] runs.
pub fn analyze_outliers(
    feature_names: &[&str],
    rows: &[CleanRow],
    cfg: &OutlierConfig,
) -> OutlierMetadata {
    let mut columns = Vec::with_capacity(feature_names.len());
    for (k, name) in feature_names.iter().enumerate() {
        let values: Vec<f64> = rows.iter().map(|r| r.features[k]).collect();
        let (lower, upper) = column_bounds(&values, cfg.method);
        let mut b = ColumnBounds {
            name: name.to_string(),
            lower,
            upper,
            method: cfg.method,
            rows_affected: 0,
        };
        b.rows_affected = values.iter().filter(|&&v| b.is_outlier(v)).count();
        columns.push(b);
    }

    OutlierMetadata {
        method: cfg.method,
        policy: cfg.policy,
        rows_total: rows.len(),
        rows_removed: 0,
        columns,
    }
}

/// Applies the configured policy and records how many rows were removed.
pub fn apply_policy(rows: Vec<CleanRow>, meta: &mut OutlierMetadata) -> Vec<CleanRow> {
    let before = rows.len();
    let out: Vec<CleanRow> = match meta.policy {
        OutlierPolicy::Keep => rows,
        OutlierPolicy::Drop => rows
            .into_iter()
            .filter(|r| {
                !meta
                    .columns
                    .iter()
                    .zip(&r.features)
                    .any(|(b, &v)| b.is_outlier(v))
            })
            .collect(),
        OutlierPolicy::Cap => rows
            .into_iter()
            .map(|mut r| {
                for (b, v) in meta.columns.iter().zip(r.features.iter_mut()) {
                    *v = v.clamp(b.lower, b.upper);
                }
                r
            })
            .collect(),
    };
    meta.rows_removed = before - out.len();
    out
}
