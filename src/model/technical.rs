//! Post-aggregation transforms ("technicals") over the final frame.
//!
//! A technical runs after the combined-layer SQL step, over one metric
//! column at a time. In `group` mode the computation resets on every
//! value of the partition key (all grain dimensions but the last); in
//! `all` mode there is a single partition.

use serde::{Deserialize, Serialize};

use crate::config::TechnicalConfig;
use crate::error::{Error, Result};
use crate::frame::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalType {
    Mean,
    Sum,
    Cumsum,
    Diff,
    PctChange,
    Boll,
    Rank,
}

impl TechnicalType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Some(TechnicalType::Mean),
            "sum" => Some(TechnicalType::Sum),
            "cumsum" => Some(TechnicalType::Cumsum),
            "diff" => Some(TechnicalType::Diff),
            "pct_change" => Some(TechnicalType::PctChange),
            "boll" => Some(TechnicalType::Boll),
            "rank" => Some(TechnicalType::Rank),
            _ => None,
        }
    }

    fn takes_window(&self) -> bool {
        matches!(
            self,
            TechnicalType::Mean | TechnicalType::Sum | TechnicalType::Boll
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TechnicalMode {
    /// Reset on each value of the last dimension's predecessor in the grain.
    #[default]
    Group,
    /// One partition over the whole frame.
    All,
}

impl TechnicalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "group" => Some(TechnicalMode::Group),
            "all" => Some(TechnicalMode::All),
            _ => None,
        }
    }
}

/// Result of applying a technical: a replacement column, or bollinger
/// lower/upper companion columns.
#[derive(Debug, Clone)]
pub enum TechnicalOutput {
    Replace(Vec<Value>),
    Bounds { lower: Vec<Value>, upper: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technical {
    pub kind: TechnicalType,
    pub window: usize,
    pub min_periods: usize,
    pub mode: TechnicalMode,
}

impl Technical {
    /// Parse a shorthand like `"mean(5)"`, `"mean(5,2)"`, `"cumsum"`,
    /// or the full config object.
    pub fn from_config(cfg: &TechnicalConfig) -> Result<Self> {
        match cfg {
            TechnicalConfig::Shorthand(s) => Self::parse(s),
            TechnicalConfig::Full {
                kind,
                window,
                min_periods,
                mode,
            } => {
                let kind_parsed = TechnicalType::parse(kind)
                    .ok_or_else(|| Error::InvalidTechnical(kind.clone(), "unknown type".into()))?;
                let mode = match mode {
                    Some(m) => TechnicalMode::parse(m).ok_or_else(|| {
                        Error::InvalidTechnical(kind.clone(), format!("unknown mode '{}'", m))
                    })?,
                    None => TechnicalMode::default(),
                };
                Self::build(kind_parsed, *window, *min_periods, mode, kind)
            }
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s_trim = s.trim();
        let (name, args) = match s_trim.find('(') {
            Some(open) => {
                let close = s_trim
                    .rfind(')')
                    .ok_or_else(|| Error::InvalidTechnical(s.into(), "unbalanced parens".into()))?;
                (&s_trim[..open], &s_trim[open + 1..close])
            }
            None => (s_trim, ""),
        };

        let kind = TechnicalType::parse(name)
            .ok_or_else(|| Error::InvalidTechnical(s.into(), "unknown type".into()))?;

        let mut window = None;
        let mut min_periods = None;
        for (i, arg) in args.split(',').filter(|a| !a.trim().is_empty()).enumerate() {
            let n: usize = arg.trim().parse().map_err(|_| {
                Error::InvalidTechnical(s.into(), format!("bad argument '{}'", arg.trim()))
            })?;
            match i {
                0 => window = Some(n),
                1 => min_periods = Some(n),
                _ => {
                    return Err(Error::InvalidTechnical(s.into(), "too many arguments".into()));
                }
            }
        }

        Self::build(kind, window, min_periods, TechnicalMode::default(), s)
    }

    fn build(
        kind: TechnicalType,
        window: Option<usize>,
        min_periods: Option<usize>,
        mode: TechnicalMode,
        raw: &str,
    ) -> Result<Self> {
        if kind.takes_window() && window.is_none() {
            return Err(Error::InvalidTechnical(
                raw.into(),
                "window argument required".into(),
            ));
        }
        let window = window.unwrap_or(1).max(1);
        // Windowed transforms default to a full window before emitting.
        let min_periods = min_periods.unwrap_or(window).max(1);
        Ok(Self {
            kind,
            window,
            min_periods,
            mode,
        })
    }

    pub fn with_mode(mut self, mode: TechnicalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Apply to one partition of a metric column.
    pub fn apply(&self, values: &[Value]) -> TechnicalOutput {
        let nums: Vec<Option<f64>> = values.iter().map(|v| v.as_f64()).collect();
        match self.kind {
            TechnicalType::Mean => TechnicalOutput::Replace(to_values(self.rolling(
                &nums,
                |w| mean(w),
            ))),
            TechnicalType::Sum => TechnicalOutput::Replace(to_values(
                self.rolling(&nums, |w| Some(w.iter().sum())),
            )),
            TechnicalType::Cumsum => {
                let mut acc = 0.0;
                let out = nums
                    .iter()
                    .map(|v| {
                        v.map(|x| {
                            acc += x;
                            acc
                        })
                    })
                    .collect();
                TechnicalOutput::Replace(to_values(out))
            }
            TechnicalType::Diff => {
                let out = shift_pair(&nums, |cur, prev| cur - prev);
                TechnicalOutput::Replace(to_values(out))
            }
            TechnicalType::PctChange => {
                let out = shift_pair(&nums, |cur, prev| {
                    if prev == 0.0 {
                        f64::NAN
                    } else {
                        cur / prev - 1.0
                    }
                });
                TechnicalOutput::Replace(to_values(out))
            }
            TechnicalType::Rank => {
                TechnicalOutput::Replace(to_values(rank_average(&nums)))
            }
            TechnicalType::Boll => {
                let means = self.rolling(&nums, |w| mean(w));
                let stds = self.rolling(&nums, |w| std_dev(w));
                let lower = means
                    .iter()
                    .zip(&stds)
                    .map(|(m, s)| match (m, s) {
                        (Some(m), Some(s)) => Some(m - 2.0 * s),
                        _ => None,
                    })
                    .collect();
                let upper = means
                    .iter()
                    .zip(&stds)
                    .map(|(m, s)| match (m, s) {
                        (Some(m), Some(s)) => Some(m + 2.0 * s),
                        _ => None,
                    })
                    .collect();
                TechnicalOutput::Bounds {
                    lower: to_values(lower),
                    upper: to_values(upper),
                }
            }
        }
    }

    /// Rolling window aggregation: positions with fewer than
    /// `min_periods` non-null observations yield NULL.
    fn rolling(
        &self,
        nums: &[Option<f64>],
        f: impl Fn(&[f64]) -> Option<f64>,
    ) -> Vec<Option<f64>> {
        let mut out = Vec::with_capacity(nums.len());
        for i in 0..nums.len() {
            let start = (i + 1).saturating_sub(self.window);
            let window: Vec<f64> = nums[start..=i].iter().flatten().copied().collect();
            if window.len() < self.min_periods {
                out.push(None);
            } else {
                out.push(f(&window));
            }
        }
        out
    }
}

fn mean(w: &[f64]) -> Option<f64> {
    if w.is_empty() {
        None
    } else {
        Some(w.iter().sum::<f64>() / w.len() as f64)
    }
}

// Sample standard deviation (n-1 denominator), matching the usual
// bollinger-band construction.
fn std_dev(w: &[f64]) -> Option<f64> {
    if w.len() < 2 {
        return None;
    }
    let m = mean(w)?;
    let var = w.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
    Some(var.sqrt())
}

fn shift_pair(nums: &[Option<f64>], f: impl Fn(f64, f64) -> f64) -> Vec<Option<f64>> {
    let mut prev: Option<f64> = None;
    nums.iter()
        .map(|v| {
            let out = match (v, prev) {
                (Some(cur), Some(p)) => {
                    let r = f(*cur, p);
                    if r.is_nan() {
                        None
                    } else {
                        Some(r)
                    }
                }
                _ => None,
            };
            if v.is_some() {
                prev = *v;
            }
            out
        })
        .collect()
}

// Average rank of each value (ties share the mean of their positions),
// ascending, 1-based. NULLs stay NULL.
fn rank_average(nums: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut idx: Vec<usize> = (0..nums.len()).filter(|&i| nums[i].is_some()).collect();
    idx.sort_by(|&a, &b| {
        nums[a]
            .partial_cmp(&nums[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = vec![None; nums.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && nums[idx[j + 1]] == nums[idx[i]] {
            j += 1;
        }
        // positions i..=j are tied; average their 1-based ranks
        let rank = (i + 1 + j + 1) as f64 / 2.0;
        for &k in &idx[i..=j] {
            out[k] = Some(rank);
        }
        i = j + 1;
    }
    out
}

fn to_values(nums: Vec<Option<f64>>) -> Vec<Value> {
    nums.into_iter()
        .map(|v| match v {
            Some(x) => Value::Float(x),
            None => Value::Null,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(xs: &[f64]) -> Vec<Value> {
        xs.iter().map(|&x| Value::Float(x)).collect()
    }

    fn floats(out: TechnicalOutput) -> Vec<Option<f64>> {
        match out {
            TechnicalOutput::Replace(v) => v.iter().map(|x| x.as_f64()).collect(),
            _ => panic!("expected replace output"),
        }
    }

    #[test]
    fn test_parse_shorthand() {
        let t = Technical::parse("mean(5)").unwrap();
        assert_eq!(t.kind, TechnicalType::Mean);
        assert_eq!(t.window, 5);
        assert_eq!(t.min_periods, 5);

        let t = Technical::parse("mean(5,2)").unwrap();
        assert_eq!(t.min_periods, 2);

        let t = Technical::parse("cumsum").unwrap();
        assert_eq!(t.kind, TechnicalType::Cumsum);

        assert!(Technical::parse("boll").is_err());
        assert!(Technical::parse("wavelet(3)").is_err());
    }

    #[test]
    fn test_rolling_mean_null_prefix() {
        let t = Technical::parse("mean(5)").unwrap();
        let out = floats(t.apply(&vals(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])));
        assert_eq!(out[..4], [None, None, None, None]);
        assert_eq!(out[4], Some(3.0));
        assert_eq!(out[5], Some(4.0));
    }

    #[test]
    fn test_cumsum_and_diff() {
        let t = Technical::parse("cumsum").unwrap();
        assert_eq!(
            floats(t.apply(&vals(&[1.0, 2.0, 3.0]))),
            [Some(1.0), Some(3.0), Some(6.0)]
        );

        let t = Technical::parse("diff").unwrap();
        assert_eq!(
            floats(t.apply(&vals(&[1.0, 4.0, 2.0]))),
            [None, Some(3.0), Some(-2.0)]
        );
    }

    #[test]
    fn test_pct_change() {
        let t = Technical::parse("pct_change").unwrap();
        let out = floats(t.apply(&vals(&[2.0, 3.0, 1.5])));
        assert_eq!(out[0], None);
        assert_eq!(out[1], Some(0.5));
        assert_eq!(out[2], Some(-0.5));
    }

    #[test]
    fn test_rank_with_ties() {
        let t = Technical::parse("rank").unwrap();
        let out = floats(t.apply(&vals(&[10.0, 20.0, 10.0])));
        assert_eq!(out, [Some(1.5), Some(3.0), Some(1.5)]);
    }

    #[test]
    fn test_boll_bounds() {
        let t = Technical::parse("boll(2)").unwrap();
        match t.apply(&vals(&[1.0, 3.0])) {
            TechnicalOutput::Bounds { lower, upper } => {
                assert!(lower[0].is_null());
                let lo = lower[1].as_f64().unwrap();
                let hi = upper[1].as_f64().unwrap();
                // mean 2, sample std sqrt(2)
                assert!((lo - (2.0 - 2.0 * 2f64.sqrt())).abs() < 1e-9);
                assert!((hi - (2.0 + 2.0 * 2f64.sqrt())).abs() < 1e-9);
            }
            _ => panic!("expected bounds"),
        }
    }

    #[test]
    fn test_nulls_skipped_in_window() {
        let t = Technical::parse("sum(2,1)").unwrap();
        let out = floats(t.apply(&[
            Value::Float(1.0),
            Value::Null,
            Value::Float(3.0),
        ]));
        assert_eq!(out, [Some(1.0), Some(1.0), Some(3.0)]);
    }
}
