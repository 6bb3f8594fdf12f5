//! Single-input relational stages: filter, projection, solution modifiers,
//! grouping, and assignment.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::query::algebra::{Aggregator, ExprAggregator, SortCondition, SortDirection};
use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::query::errors::{EvalError, EvalErrorWithCode};
use crate::query::expr::{prepare, PreparedExpr};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::stream::{collect_bindings, BindingStream, BoxBindingStream};
use crate::query::term::{order_terms, Numeric, Term, Var};
use crate::types::Result;

/// Passes rows whose expression holds; false and evaluation errors drop the row.
pub struct FilterStream {
    input: BoxBindingStream,
    expr: PreparedExpr,
    closed: bool,
}

impl FilterStream {
    /// Filters `input` by `expr`.
    pub fn new(input: BoxBindingStream, expr: PreparedExpr) -> Self {
        Self {
            input,
            expr,
            closed: false,
        }
    }
}

impl BindingStream for FilterStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        while let Some(row) = self.input.try_next()? {
            let start = profile_timer();
            let verdict = self.expr.test(&row);
            record_profile_timer(QueryProfileKind::Filter, start);
            match verdict {
                Ok(true) => return Ok(Some(row)),
                Ok(false) => {}
                Err(err) => trace!(
                    error = %EvalErrorWithCode(&err),
                    expr = %self.expr.expr(),
                    "filter dropped row"
                ),
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.input.close();
        }
    }
}

/// Keeps only the listed variables.
pub struct ProjectStream {
    input: BoxBindingStream,
    vars: Vec<Var>,
    closed: bool,
}

impl ProjectStream {
    /// Projects `input` onto `vars`.
    pub fn new(input: BoxBindingStream, vars: Vec<Var>) -> Self {
        Self {
            input,
            vars,
            closed: false,
        }
    }
}

impl BindingStream for ProjectStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        Ok(self.input.try_next()?.map(|row| row.project(&self.vars)))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.input.close();
        }
    }
}

/// Stable multi-key sort; drains its input on first pull.
pub struct SortStream {
    input: BoxBindingStream,
    keys: Vec<(PreparedExpr, SortDirection)>,
    ctx: Arc<ExecutionContext>,
    sorted: Option<std::vec::IntoIter<Binding>>,
    closed: bool,
}

impl SortStream {
    /// Sorts `input` by `conditions`, most significant first.
    pub fn new(
        input: BoxBindingStream,
        conditions: &[SortCondition],
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        let exprs: Vec<_> = conditions.iter().map(|c| c.expr.clone()).collect();
        let keys = prepare(&exprs, &ctx)
            .into_iter()
            .zip(conditions.iter().map(|c| c.direction))
            .collect();
        Self {
            input,
            keys,
            ctx,
            sorted: None,
            closed: false,
        }
    }

    fn sort(&mut self) -> Result<std::vec::IntoIter<Binding>> {
        let start = profile_timer();
        let rows = collect_bindings(self.input.as_mut(), &self.ctx)?;
        let mut keyed: Vec<(Vec<Option<Term>>, Binding)> = rows
            .into_iter()
            .map(|row| {
                let key = self.keys.iter().map(|(expr, _)| expr.eval(&row).ok()).collect();
                (key, row)
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), (_, direction)) in a.iter().zip(b.iter()).zip(self.keys.iter()) {
                let ord = order_terms(x.as_ref(), y.as_ref());
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        record_profile_timer(QueryProfileKind::Sort, start);
        Ok(keyed
            .into_iter()
            .map(|(_, row)| row)
            .collect::<Vec<_>>()
            .into_iter())
    }
}

impl BindingStream for SortStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        if self.sorted.is_none() {
            self.sorted = Some(self.sort()?);
        }
        Ok(self.sorted.as_mut().and_then(Iterator::next))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sorted = None;
        self.input.close();
    }
}

/// OFFSET / LIMIT. Releases its input as soon as the limit is reached.
pub struct SliceStream {
    input: BoxBindingStream,
    to_skip: usize,
    remaining: Option<usize>,
    closed: bool,
}

impl SliceStream {
    /// Skips `offset` rows then emits at most `length`.
    pub fn new(input: BoxBindingStream, offset: Option<usize>, length: Option<usize>) -> Self {
        Self {
            input,
            to_skip: offset.unwrap_or(0),
            remaining: length,
            closed: false,
        }
    }
}

impl BindingStream for SliceStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        if self.remaining == Some(0) {
            self.close();
            return Ok(None);
        }
        while self.to_skip > 0 {
            if self.input.try_next()?.is_none() {
                return Ok(None);
            }
            self.to_skip -= 1;
        }
        let row = self.input.try_next()?;
        if row.is_some() {
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    self.input.close();
                }
            }
        }
        Ok(row)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.input.close();
        }
    }
}

/// Exact duplicate elimination; emits first occurrences as they stream by.
pub struct DistinctStream {
    input: BoxBindingStream,
    seen: FxHashSet<Binding>,
    closed: bool,
}

impl DistinctStream {
    /// Deduplicates `input`.
    pub fn new(input: BoxBindingStream) -> Self {
        Self {
            input,
            seen: FxHashSet::default(),
            closed: false,
        }
    }
}

impl BindingStream for DistinctStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        while let Some(row) = self.input.try_next()? {
            if self.seen.insert(row.clone()) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.seen.clear();
            self.input.close();
        }
    }
}

/// Approximate duplicate elimination over a bounded window of recent rows.
pub struct ReducedStream {
    input: BoxBindingStream,
    window: LruCache<Binding, ()>,
    closed: bool,
}

impl ReducedStream {
    /// Suppresses repeats among the last `window` distinct rows.
    pub fn new(input: BoxBindingStream, window: usize) -> Self {
        let capacity = NonZeroUsize::new(window).unwrap_or(NonZeroUsize::MIN);
        Self {
            input,
            window: LruCache::new(capacity),
            closed: false,
        }
    }
}

impl BindingStream for ReducedStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        while let Some(row) = self.input.try_next()? {
            if self.window.get(&row).is_none() {
                self.window.put(row.clone(), ());
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.window.clear();
            self.input.close();
        }
    }
}

struct PreparedAggregator {
    var: Var,
    aggregator: Aggregator,
    expr: Option<PreparedExpr>,
}

impl PreparedAggregator {
    fn values(&self, rows: &[Binding]) -> Vec<Term> {
        match &self.expr {
            Some(expr) => rows.iter().filter_map(|row| expr.eval(row).ok()).collect(),
            None => Vec::new(),
        }
    }

    fn evaluate(&self, rows: &[Binding]) -> Option<Term> {
        match &self.aggregator {
            Aggregator::Count { expr: None, distinct } => {
                let count = if *distinct {
                    rows.iter().collect::<FxHashSet<_>>().len()
                } else {
                    rows.len()
                };
                Some(Term::int(i64::try_from(count).ok()?))
            }
            Aggregator::Count { distinct, .. } => {
                let values = self.values(rows);
                let count = if *distinct {
                    values.iter().collect::<BTreeSet<_>>().len()
                } else {
                    values.len()
                };
                Some(Term::int(i64::try_from(count).ok()?))
            }
            Aggregator::Sum(_) => sum(&self.values(rows)).ok().map(Numeric::into_term),
            Aggregator::Avg(_) => {
                let values = self.values(rows);
                if values.is_empty() {
                    return Some(Term::int(0));
                }
                let total = sum(&values).ok()?;
                Some(Term::double(total.as_f64() / values.len() as f64))
            }
            Aggregator::Min(_) => self
                .values(rows)
                .into_iter()
                .min_by(|a, b| order_terms(Some(a), Some(b))),
            Aggregator::Max(_) => self
                .values(rows)
                .into_iter()
                .max_by(|a, b| order_terms(Some(a), Some(b))),
            Aggregator::Sample(_) => self.values(rows).into_iter().next(),
            Aggregator::GroupConcat { separator, .. } => {
                let parts: Vec<_> = self
                    .values(rows)
                    .iter()
                    .map(|t| t.lexical().to_owned())
                    .collect();
                Some(Term::string(parts.join(separator)))
            }
        }
    }
}

fn sum(values: &[Term]) -> std::result::Result<Numeric, EvalError> {
    values.iter().try_fold(Numeric::Integer(0), |acc, term| {
        let value = term
            .as_numeric()
            .ok_or_else(|| EvalError::type_mismatch("sum of non-numeric value"))?;
        Ok(match (acc, value) {
            (Numeric::Integer(a), Numeric::Integer(b)) => {
                Numeric::Integer(a.checked_add(b).ok_or(EvalError::Overflow)?)
            }
            (a, b) => Numeric::Double(a.as_f64() + b.as_f64()),
        })
    })
}

/// GROUP BY with aggregates. Groups are emitted in first-seen order.
pub struct GroupStream {
    input: BoxBindingStream,
    group_vars: Vec<Var>,
    aggregators: Vec<PreparedAggregator>,
    ctx: Arc<ExecutionContext>,
    output: Option<std::vec::IntoIter<Binding>>,
    closed: bool,
}

impl GroupStream {
    /// Groups `input` by `group_vars` and evaluates `aggregators` per group.
    pub fn new(
        input: BoxBindingStream,
        group_vars: Vec<Var>,
        aggregators: &[ExprAggregator],
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        let aggregators = aggregators
            .iter()
            .map(|agg| {
                let expr = match &agg.aggregator {
                    Aggregator::Count { expr, .. } => expr.clone(),
                    Aggregator::Sum(e)
                    | Aggregator::Min(e)
                    | Aggregator::Max(e)
                    | Aggregator::Avg(e)
                    | Aggregator::Sample(e)
                    | Aggregator::GroupConcat { expr: e, .. } => Some(e.clone()),
                };
                PreparedAggregator {
                    var: agg.var.clone(),
                    aggregator: agg.aggregator.clone(),
                    expr: expr.and_then(|e| prepare(std::slice::from_ref(&e), &ctx).pop()),
                }
            })
            .collect();
        Self {
            input,
            group_vars,
            aggregators,
            ctx,
            output: None,
            closed: false,
        }
    }

    fn build(&mut self) -> Result<std::vec::IntoIter<Binding>> {
        let start = profile_timer();
        let rows = collect_bindings(self.input.as_mut(), &self.ctx)?;
        let mut index: FxHashMap<Vec<Option<Term>>, usize> = FxHashMap::default();
        let mut groups: Vec<(Vec<Option<Term>>, Vec<Binding>)> = Vec::new();
        for row in rows {
            let key: Vec<Option<Term>> = self.group_vars.iter().map(|v| row.get(v).cloned()).collect();
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![row]));
                }
            }
        }
        if groups.is_empty() && self.group_vars.is_empty() {
            groups.push((Vec::new(), Vec::new()));
        }
        let output = groups
            .into_iter()
            .map(|(key, members)| {
                let mut out = Binding::new();
                for (var, value) in self.group_vars.iter().zip(key) {
                    if let Some(value) = value {
                        out.insert(var.clone(), value);
                    }
                }
                for agg in &self.aggregators {
                    if let Some(value) = agg.evaluate(&members) {
                        out.insert(agg.var.clone(), value);
                    }
                }
                out
            })
            .collect::<Vec<_>>();
        record_profile_timer(QueryProfileKind::Group, start);
        Ok(output.into_iter())
    }
}

impl BindingStream for GroupStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        if self.output.is_none() {
            self.output = Some(self.build()?);
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output = None;
        self.input.close();
    }
}

/// Extends rows with computed variables.
///
/// A value that disagrees with an existing binding drops the row; an
/// evaluation error leaves the variable unbound.
pub struct AssignStream {
    input: BoxBindingStream,
    assignments: Vec<(Var, PreparedExpr)>,
    closed: bool,
}

impl AssignStream {
    /// Applies `assignments` in order to each row of `input`.
    pub fn new(input: BoxBindingStream, assignments: Vec<(Var, PreparedExpr)>) -> Self {
        Self {
            input,
            assignments,
            closed: false,
        }
    }

    fn extend(&self, mut row: Binding) -> Option<Binding> {
        for (var, expr) in &self.assignments {
            let Ok(value) = expr.eval(&row) else {
                continue;
            };
            match row.get(var) {
                Some(existing) if *existing != value => return None,
                Some(_) => {}
                None => row.insert(var.clone(), value),
            }
        }
        Some(row)
    }
}

impl BindingStream for AssignStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        while let Some(row) = self.input.try_next()? {
            if let Some(row) = self.extend(row) {
                return Ok(Some(row));
            }
            trace!("assignment conflicted with existing binding");
        }
        Ok(None)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::{Expr, FunctionRegistry};
    use crate::query::stream::VecBindingStream;

    fn rows(values: &[(i64, &str)]) -> BoxBindingStream {
        Box::new(VecBindingStream::new(
            values
                .iter()
                .map(|(n, s)| Binding::new().with("n", Term::int(*n)).with("s", Term::string(*s)))
                .collect(),
        ))
    }

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::empty())
    }

    fn prepared(expr: Expr) -> PreparedExpr {
        PreparedExpr::new(expr, Arc::new(FunctionRegistry::with_builtins()))
    }

    fn ints(rows: &[Binding], var: &str) -> Vec<Option<i64>> {
        rows.iter()
            .map(|r| {
                r.get(&Var::new(var)).and_then(|t| match t.as_numeric() {
                    Some(Numeric::Integer(v)) => Some(v),
                    _ => None,
                })
            })
            .collect()
    }

    #[test]
    fn filter_drops_false_and_errors() -> Result<()> {
        let ctx = ctx();
        let input = Box::new(VecBindingStream::new(vec![
            Binding::from_binding("n", Term::int(1)),
            Binding::new(),
            Binding::from_binding("n", Term::int(7)),
        ]));
        let mut stream = FilterStream::new(input, prepared(Expr::gt(Expr::var("n"), Expr::int(3))));
        assert_eq!(ints(&collect_bindings(&mut stream, &ctx)?, "n"), vec![Some(7)]);
        Ok(())
    }

    #[test]
    fn sort_is_stable_and_descending_aware() -> Result<()> {
        let ctx = ctx();
        let input = rows(&[(2, "a"), (1, "b"), (2, "c"), (3, "d")]);
        let mut stream = SortStream::new(
            input,
            &[SortCondition::desc(Expr::var("n"))],
            ctx.clone(),
        );
        let out = collect_bindings(&mut stream, &ctx)?;
        let labels: Vec<_> = out
            .iter()
            .filter_map(|r| r.get(&Var::new("s")).map(|t| t.lexical().to_owned()))
            .collect();
        assert_eq!(labels, vec!["d", "a", "c", "b"]);
        Ok(())
    }

    #[test]
    fn slice_applies_offset_and_limit() -> Result<()> {
        let ctx = ctx();
        let mut stream = SliceStream::new(rows(&[(1, ""), (2, ""), (3, ""), (4, "")]), Some(1), Some(2));
        assert_eq!(ints(&collect_bindings(&mut stream, &ctx)?, "n"), vec![Some(2), Some(3)]);
        let mut empty = SliceStream::new(rows(&[(1, "")]), None, Some(0));
        assert!(collect_bindings(&mut empty, &ctx)?.is_empty());
        Ok(())
    }

    #[test]
    fn distinct_and_reduced_suppress_repeats() -> Result<()> {
        let ctx = ctx();
        let mut distinct = DistinctStream::new(rows(&[(1, "a"), (1, "a"), (2, "a"), (1, "a")]));
        assert_eq!(collect_bindings(&mut distinct, &ctx)?.len(), 2);
        let mut reduced = ReducedStream::new(rows(&[(1, "a"), (1, "a"), (2, "a"), (1, "a")]), 1);
        assert_eq!(ints(&collect_bindings(&mut reduced, &ctx)?, "n"), vec![Some(1), Some(2), Some(1)]);
        Ok(())
    }

    #[test]
    fn group_counts_and_sums_per_key() -> Result<()> {
        let ctx = ctx();
        let aggs = vec![
            ExprAggregator {
                var: Var::new("c"),
                aggregator: Aggregator::Count {
                    expr: None,
                    distinct: false,
                },
            },
            ExprAggregator {
                var: Var::new("total"),
                aggregator: Aggregator::Sum(Expr::var("n")),
            },
        ];
        let mut stream = GroupStream::new(
            rows(&[(1, "a"), (2, "b"), (3, "a")]),
            vec![Var::new("s")],
            &aggs,
            ctx.clone(),
        );
        let out = collect_bindings(&mut stream, &ctx)?;
        assert_eq!(ints(&out, "c"), vec![Some(2), Some(1)]);
        assert_eq!(ints(&out, "total"), vec![Some(4), Some(2)]);
        Ok(())
    }

    #[test]
    fn ungrouped_empty_input_yields_one_row() -> Result<()> {
        let ctx = ctx();
        let aggs = vec![ExprAggregator {
            var: Var::new("c"),
            aggregator: Aggregator::Count {
                expr: None,
                distinct: false,
            },
        }];
        let mut stream = GroupStream::new(rows(&[]), Vec::new(), &aggs, ctx.clone());
        assert_eq!(ints(&collect_bindings(&mut stream, &ctx)?, "c"), vec![Some(0)]);
        Ok(())
    }

    #[test]
    fn assign_conflict_drops_and_error_leaves_unbound() -> Result<()> {
        let ctx = ctx();
        let input = Box::new(VecBindingStream::new(vec![
            Binding::new().with("n", Term::int(1)),
            Binding::new().with("n", Term::int(2)).with("m", Term::int(99)),
            Binding::new(),
        ]));
        let mut stream = AssignStream::new(
            input,
            vec![(Var::new("m"), prepared(Expr::add(Expr::var("n"), Expr::int(1))))],
        );
        let out = collect_bindings(&mut stream, &ctx)?;
        assert_eq!(out.len(), 2);
        assert_eq!(ints(&out, "m"), vec![Some(2), None]);
        Ok(())
    }
}
