//! Series-transform function registry for target expressions.
//!
//! Per-series transforms keep the incoming series name so per-metric state
//! stays attached to the same metric across checks; only `alias` and the
//! aggregations produce new names.

use crate::error::{CheckError, CheckResult};
use klaxon_common::types::MetricValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// One named series inside an evaluated target.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub name: String,
    pub values: Vec<MetricValue>,
}

impl TimeSeries {
    pub fn new(name: impl Into<String>, values: Vec<MetricValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Latest sample in the series, if any.
    pub fn last_value(&self) -> Option<MetricValue> {
        self.values.last().copied()
    }
}

/// An evaluated function argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Series(Vec<TimeSeries>),
    Number(f64),
    Str(String),
}

pub struct Function {
    pub min_args: usize,
    pub max_args: usize,
    pub apply: fn(Vec<Arg>) -> CheckResult<Vec<TimeSeries>>,
}

pub fn registry() -> &'static HashMap<&'static str, Function> {
    static REGISTRY: OnceLock<HashMap<&'static str, Function>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            "movingAverage",
            Function {
                min_args: 2,
                max_args: 2,
                apply: moving_average,
            },
        );
        map.insert(
            "sumSeries",
            Function {
                min_args: 1,
                max_args: usize::MAX,
                apply: |args| aggregate("sumSeries", args, |acc| acc.iter().sum()),
            },
        );
        map.insert(
            "minSeries",
            Function {
                min_args: 1,
                max_args: usize::MAX,
                apply: |args| {
                    aggregate("minSeries", args, |acc| {
                        acc.iter().copied().fold(f64::INFINITY, f64::min)
                    })
                },
            },
        );
        map.insert(
            "maxSeries",
            Function {
                min_args: 1,
                max_args: usize::MAX,
                apply: |args| {
                    aggregate("maxSeries", args, |acc| {
                        acc.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                    })
                },
            },
        );
        map.insert(
            "averageSeries",
            Function {
                min_args: 1,
                max_args: usize::MAX,
                apply: |args| {
                    aggregate("averageSeries", args, |acc| {
                        acc.iter().sum::<f64>() / acc.len() as f64
                    })
                },
            },
        );
        map.insert(
            "alias",
            Function {
                min_args: 2,
                max_args: 2,
                apply: alias,
            },
        );
        map.insert(
            "derivative",
            Function {
                min_args: 1,
                max_args: 1,
                apply: derivative,
            },
        );
        map.insert(
            "absolute",
            Function {
                min_args: 1,
                max_args: 1,
                apply: |args| map_values("absolute", args, f64::abs),
            },
        );
        map.insert(
            "scale",
            Function {
                min_args: 2,
                max_args: 2,
                apply: scale,
            },
        );
        map.insert(
            "timeShift",
            Function {
                min_args: 2,
                max_args: 2,
                apply: time_shift,
            },
        );
        map.insert(
            "summarize",
            Function {
                min_args: 3,
                max_args: 3,
                apply: summarize,
            },
        );
        map
    })
}

fn series_arg(name: &str, arg: Option<Arg>) -> CheckResult<Vec<TimeSeries>> {
    match arg {
        Some(Arg::Series(series)) => Ok(series),
        other => Err(CheckError::Type(format!(
            "{name} expects a series argument, got {other:?}"
        ))),
    }
}

fn number_arg(name: &str, arg: Option<Arg>) -> CheckResult<f64> {
    match arg {
        Some(Arg::Number(number)) => Ok(number),
        other => Err(CheckError::Type(format!(
            "{name} expects a numeric argument, got {other:?}"
        ))),
    }
}

fn string_arg(name: &str, arg: Option<Arg>) -> CheckResult<String> {
    match arg {
        Some(Arg::Str(literal)) => Ok(literal),
        other => Err(CheckError::Type(format!(
            "{name} expects a string argument, got {other:?}"
        ))),
    }
}

fn moving_average(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("movingAverage", args.next())?;
    let window = number_arg("movingAverage", args.next())?;
    let window = window.max(1.0) as usize;

    Ok(series
        .into_iter()
        .map(|s| {
            let averaged = s
                .values
                .iter()
                .enumerate()
                .map(|(i, point)| {
                    let start = (i + 1).saturating_sub(window);
                    let slice = &s.values[start..=i];
                    MetricValue {
                        timestamp: point.timestamp,
                        value: slice.iter().map(|v| v.value).sum::<f64>() / slice.len() as f64,
                    }
                })
                .collect();
            TimeSeries::new(s.name, averaged)
        })
        .collect())
}

/// Combines every input series into one by aggregating samples that share a
/// timestamp.
fn aggregate(
    name: &str,
    args: Vec<Arg>,
    combine: fn(&[f64]) -> f64,
) -> CheckResult<Vec<TimeSeries>> {
    let mut inputs = Vec::new();
    for arg in args {
        inputs.extend(series_arg(name, Some(arg))?);
    }
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for series in &inputs {
        for point in &series.values {
            buckets.entry(point.timestamp).or_default().push(point.value);
        }
    }

    let combined_name = format!(
        "{name}({})",
        inputs
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );
    let values = buckets
        .into_iter()
        .map(|(timestamp, bucket)| MetricValue {
            timestamp,
            value: combine(&bucket),
        })
        .collect();
    Ok(vec![TimeSeries::new(combined_name, values)])
}

fn alias(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("alias", args.next())?;
    let new_name = string_arg("alias", args.next())?;
    Ok(series
        .into_iter()
        .map(|s| TimeSeries::new(new_name.clone(), s.values))
        .collect())
}

/// Difference between consecutive samples; the first sample is consumed.
fn derivative(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("derivative", args.next())?;
    Ok(series
        .into_iter()
        .map(|s| {
            let diffed = s
                .values
                .windows(2)
                .map(|pair| MetricValue {
                    timestamp: pair[1].timestamp,
                    value: pair[1].value - pair[0].value,
                })
                .collect();
            TimeSeries::new(s.name, diffed)
        })
        .collect())
}

fn map_values(
    name: &str,
    args: Vec<Arg>,
    transform: fn(f64) -> f64,
) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg(name, args.next())?;
    Ok(series
        .into_iter()
        .map(|s| {
            let mapped = s
                .values
                .iter()
                .map(|point| MetricValue {
                    timestamp: point.timestamp,
                    value: transform(point.value),
                })
                .collect();
            TimeSeries::new(s.name, mapped)
        })
        .collect())
}

fn scale(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("scale", args.next())?;
    let factor = number_arg("scale", args.next())?;
    Ok(series
        .into_iter()
        .map(|s| {
            let scaled = s
                .values
                .iter()
                .map(|point| MetricValue {
                    timestamp: point.timestamp,
                    value: point.value * factor,
                })
                .collect();
            TimeSeries::new(s.name, scaled)
        })
        .collect())
}

/// Shifts samples forward by `seconds`, presenting older data at the
/// current window position. The target evaluator widens its fetch window by
/// the shift amount.
fn time_shift(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("timeShift", args.next())?;
    let shift = number_arg("timeShift", args.next())? as i64;
    Ok(series
        .into_iter()
        .map(|s| {
            let shifted = s
                .values
                .iter()
                .map(|point| MetricValue {
                    timestamp: point.timestamp + shift,
                    value: point.value,
                })
                .collect();
            TimeSeries::new(s.name, shifted)
        })
        .collect())
}

fn summarize(args: Vec<Arg>) -> CheckResult<Vec<TimeSeries>> {
    let mut args = args.into_iter();
    let series = series_arg("summarize", args.next())?;
    let interval = number_arg("summarize", args.next())? as i64;
    let how = string_arg("summarize", args.next())?;
    if interval <= 0 {
        return Err(CheckError::Type("summarize interval must be positive".into()));
    }
    let combine: fn(&[f64]) -> f64 = match how.as_str() {
        "sum" => |acc| acc.iter().sum(),
        "avg" | "average" => |acc| acc.iter().sum::<f64>() / acc.len() as f64,
        "min" => |acc| acc.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => |acc| acc.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        other => {
            return Err(CheckError::Type(format!(
                "summarize: unknown aggregation '{other}'"
            )))
        }
    };

    Ok(series
        .into_iter()
        .map(|s| {
            let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
            for point in &s.values {
                let bucket = point.timestamp - point.timestamp.rem_euclid(interval);
                buckets.entry(bucket).or_default().push(point.value);
            }
            let values = buckets
                .into_iter()
                .map(|(timestamp, bucket)| MetricValue {
                    timestamp,
                    value: combine(&bucket),
                })
                .collect();
            TimeSeries::new(s.name, values)
        })
        .collect())
}
