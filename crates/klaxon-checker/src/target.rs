use crate::error::{CheckError, CheckResult};
use crate::expression::{parse, BinOp, Node, UnaryOp};
use crate::functions::{registry, Arg, TimeSeries};
use klaxon_store::Store;
use std::collections::HashMap;
use std::sync::Arc;

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Evaluates target expressions against the store's metric windows.
///
/// Series references are prefetched in one pass over the parse tree, then
/// the tree is folded synchronously through the function registry.
pub struct TargetEvaluator {
    store: Arc<dyn Store>,
}

impl TargetEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Evaluates `target` over `[from, to]`, returning its named series.
    pub async fn evaluate(&self, target: &str, from: i64, to: i64) -> CheckResult<Vec<TimeSeries>> {
        let node = parse(target)?;

        // timeShift presents older samples at the window position, so the
        // fetch reaches back far enough to have them.
        let fetch_from = from - max_time_shift(&node);

        let mut refs = Vec::new();
        collect_refs(&node, &mut refs);

        let mut fetched: HashMap<String, Vec<TimeSeries>> = HashMap::new();
        for reference in refs {
            if fetched.contains_key(&reference) {
                continue;
            }
            let series = self.fetch_reference(&reference, fetch_from, to).await?;
            fetched.insert(reference, series);
        }

        match eval_node(&node, &fetched)? {
            Arg::Series(series) => Ok(series
                .into_iter()
                .map(|s| {
                    let trimmed = s
                        .values
                        .into_iter()
                        .filter(|point| point.timestamp >= from && point.timestamp <= to)
                        .collect();
                    TimeSeries::new(s.name, trimmed)
                })
                .filter(|s: &TimeSeries| !s.values.is_empty())
                .collect()),
            other => Err(CheckError::Type(format!(
                "target must evaluate to series, got {other:?}"
            ))),
        }
    }

    /// Resolves a pattern reference through the pattern-metric index; a
    /// literal name with no recorded members falls back to a direct fetch.
    /// Series with no samples in the window are omitted.
    async fn fetch_reference(
        &self,
        reference: &str,
        from: i64,
        to: i64,
    ) -> CheckResult<Vec<TimeSeries>> {
        let mut metrics = self.store.get_pattern_metrics(reference).await?;
        if metrics.is_empty() && !is_wildcard(reference) {
            metrics = vec![reference.to_string()];
        }

        let mut series = Vec::new();
        for metric in metrics {
            let values = self.store.get_metric_values(&metric, from, to).await?;
            if values.is_empty() {
                continue;
            }
            series.push(TimeSeries::new(metric, values));
        }
        Ok(series)
    }
}

fn collect_refs(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Ident(name) => out.push(name.clone()),
        Node::Call { args, .. } => {
            for arg in args {
                collect_refs(arg, out);
            }
        }
        Node::Unary { operand, .. } => collect_refs(operand, out),
        Node::BinOp { lhs, rhs, .. } => {
            collect_refs(lhs, out);
            collect_refs(rhs, out);
        }
        Node::Ternary {
            cond,
            then,
            otherwise,
        } => {
            collect_refs(cond, out);
            collect_refs(then, out);
            collect_refs(otherwise, out);
        }
        Node::Number(_) | Node::Str(_) => {}
    }
}

fn max_time_shift(node: &Node) -> i64 {
    match node {
        Node::Call { name, args } => {
            let mut shift = args.iter().map(max_time_shift).max().unwrap_or(0);
            if name == "timeShift" {
                if let Some(Node::Number(n)) = args.get(1) {
                    shift = shift.max(*n as i64);
                }
            }
            shift
        }
        Node::Unary { operand, .. } => max_time_shift(operand),
        Node::BinOp { lhs, rhs, .. } => max_time_shift(lhs).max(max_time_shift(rhs)),
        Node::Ternary {
            cond,
            then,
            otherwise,
        } => max_time_shift(cond)
            .max(max_time_shift(then))
            .max(max_time_shift(otherwise)),
        _ => 0,
    }
}

fn eval_node(node: &Node, fetched: &HashMap<String, Vec<TimeSeries>>) -> CheckResult<Arg> {
    match node {
        Node::Number(number) => Ok(Arg::Number(*number)),
        Node::Str(literal) => Ok(Arg::Str(literal.clone())),
        Node::Ident(name) => {
            let series = fetched
                .get(name)
                .cloned()
                .unwrap_or_default();
            Ok(Arg::Series(series))
        }
        Node::Call { name, args } => {
            let function = registry()
                .get(name.as_str())
                .ok_or_else(|| CheckError::UnknownFunction(name.clone()))?;
            if args.len() < function.min_args || args.len() > function.max_args {
                let expected = if function.max_args == usize::MAX {
                    format!("at least {}", function.min_args)
                } else if function.min_args == function.max_args {
                    function.min_args.to_string()
                } else {
                    format!("{}..{}", function.min_args, function.max_args)
                };
                return Err(CheckError::Arity {
                    name: name.clone(),
                    expected,
                    got: args.len(),
                });
            }
            let evaluated = args
                .iter()
                .map(|arg| eval_node(arg, fetched))
                .collect::<CheckResult<Vec<Arg>>>()?;
            (function.apply)(evaluated).map(Arg::Series)
        }
        Node::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match eval_node(operand, fetched)? {
            Arg::Number(number) => Ok(Arg::Number(-number)),
            other => Err(CheckError::Type(format!("cannot negate {other:?}"))),
        },
        Node::Unary { op, .. } => Err(CheckError::Type(format!(
            "operator {op:?} is not allowed in targets"
        ))),
        Node::BinOp { op, lhs, rhs } => {
            let left = eval_node(lhs, fetched)?;
            let right = eval_node(rhs, fetched)?;
            let (Arg::Number(a), Arg::Number(b)) = (&left, &right) else {
                return Err(CheckError::Type(format!(
                    "only numeric arithmetic is allowed in targets, got {left:?} {op:?} {right:?}"
                )));
            };
            let value = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => {
                    return Err(CheckError::Type(format!(
                        "operator {op:?} is not allowed in targets"
                    )))
                }
            };
            if !value.is_finite() {
                return Err(CheckError::Type(
                    "arithmetic produced a non-finite value".into(),
                ));
            }
            Ok(Arg::Number(value))
        }
        Node::Ternary { .. } => Err(CheckError::Type(
            "ternary expressions are not allowed in targets".into(),
        )),
    }
}
