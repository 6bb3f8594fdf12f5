//! Two-input stages: materializing join, left-join, difference, and the
//! streamed optional-index stage.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::query::algebra::Op;
use crate::query::binding::Binding;
use crate::query::compiler::compile_with_input;
use crate::query::context::ExecutionContext;
use crate::query::expr::PreparedExpr;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::stream::{collect_bindings, singleton, BindingStream, BoxBindingStream};
use crate::types::Result;

/// Right side drained into memory on first pull.
struct Materialized {
    stream: BoxBindingStream,
    rows: Option<Vec<Binding>>,
}

impl Materialized {
    fn new(stream: BoxBindingStream) -> Self {
        Self { stream, rows: None }
    }

    fn rows(&mut self, ctx: &ExecutionContext, kind: QueryProfileKind) -> Result<&[Binding]> {
        if self.rows.is_none() {
            let start = profile_timer();
            let rows = collect_bindings(self.stream.as_mut(), ctx)?;
            record_profile_timer(kind, start);
            self.rows = Some(rows);
        }
        Ok(self.rows.as_deref().unwrap_or_default())
    }

    fn close(&mut self) {
        self.rows = None;
        self.stream.close();
    }
}

/// Materializing join: emits every compatible merge of a left row with a
/// buffered right row.
pub struct JoinStream {
    left: BoxBindingStream,
    right: Materialized,
    ctx: Arc<ExecutionContext>,
    pending: VecDeque<Binding>,
    closed: bool,
}

impl JoinStream {
    /// Joins `left` with `right`; `right` is buffered.
    pub fn new(left: BoxBindingStream, right: BoxBindingStream, ctx: Arc<ExecutionContext>) -> Self {
        Self {
            left,
            right: Materialized::new(right),
            ctx,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

impl BindingStream for JoinStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(left) = self.left.try_next()? else {
                return Ok(None);
            };
            let right = self.right.rows(&self.ctx, QueryProfileKind::Join)?;
            self.pending
                .extend(right.iter().filter_map(|r| left.merge(r)));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.left.close();
        self.right.close();
    }
}

/// Materializing left-join.
///
/// Emits every compatible merge that satisfies all expressions; a left row
/// with no such merge is emitted once, unextended.
pub struct LeftJoinStream {
    left: BoxBindingStream,
    right: Materialized,
    exprs: Vec<PreparedExpr>,
    ctx: Arc<ExecutionContext>,
    pending: VecDeque<Binding>,
    closed: bool,
}

impl LeftJoinStream {
    /// Left-joins `left` with buffered `right` under `exprs`.
    pub fn new(
        left: BoxBindingStream,
        right: BoxBindingStream,
        exprs: Vec<PreparedExpr>,
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            left,
            right: Materialized::new(right),
            exprs,
            ctx,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

impl BindingStream for LeftJoinStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(row) = self.pending.pop_front() {
            return Ok(Some(row));
        }
        let Some(left) = self.left.try_next()? else {
            return Ok(None);
        };
        let right = self.right.rows(&self.ctx, QueryProfileKind::LeftJoin)?;
        let exprs = &self.exprs;
        self.pending.extend(
            right
                .iter()
                .filter_map(|r| left.merge(r))
                .filter(|merged| exprs.iter().all(|e| matches!(e.test(merged), Ok(true)))),
        );
        match self.pending.pop_front() {
            Some(row) => Ok(Some(row)),
            None => Ok(Some(left)),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.left.close();
        self.right.close();
    }
}

/// Keeps left rows for which no buffered right row is compatible.
pub struct DiffStream {
    left: BoxBindingStream,
    right: Materialized,
    ctx: Arc<ExecutionContext>,
    closed: bool,
}

impl DiffStream {
    /// `left` minus rows compatible with any row of `right`.
    pub fn new(left: BoxBindingStream, right: BoxBindingStream, ctx: Arc<ExecutionContext>) -> Self {
        Self {
            left,
            right: Materialized::new(right),
            ctx,
            closed: false,
        }
    }
}

impl BindingStream for DiffStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(left) = self.left.try_next()? {
            let right = self.right.rows(&self.ctx, QueryProfileKind::Join)?;
            if !right.iter().any(|r| left.is_compatible(r)) {
                return Ok(Some(left));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.left.close();
        self.right.close();
    }
}

/// Streamed optional match.
///
/// For each left row the right sub-plan is compiled with that row as its
/// only input. If it yields nothing the left row is emitted once.
pub struct OptionalIndexStream {
    left: BoxBindingStream,
    right: Arc<Op>,
    ctx: Arc<ExecutionContext>,
    current: Option<(Binding, BoxBindingStream, bool)>,
    closed: bool,
}

impl OptionalIndexStream {
    /// Optional-index stage over `left`, re-evaluating `right` per row.
    pub fn new(left: BoxBindingStream, right: Arc<Op>, ctx: Arc<ExecutionContext>) -> Self {
        Self {
            left,
            right,
            ctx,
            current: None,
            closed: false,
        }
    }
}

impl BindingStream for OptionalIndexStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some((seed, stream, matched)) = self.current.as_mut() {
                if let Some(row) = stream.try_next()? {
                    *matched = true;
                    return Ok(Some(row));
                }
                stream.close();
                let emit_seed = !*matched;
                let seed = std::mem::take(seed);
                self.current = None;
                if emit_seed {
                    return Ok(Some(seed));
                }
            }
            let Some(left) = self.left.try_next()? else {
                return Ok(None);
            };
            let stream = compile_with_input(&self.right, singleton(left.clone()), &self.ctx)?;
            self.current = Some((left, stream, false));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some((_, mut stream, _)) = self.current.take() {
            stream.close();
        }
        self.left.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::algebra::Table;
    use crate::query::expr::{Expr, FunctionRegistry};
    use crate::query::stream::VecBindingStream;
    use crate::query::term::{Term, Var};

    fn stream(rows: Vec<Binding>) -> BoxBindingStream {
        Box::new(VecBindingStream::new(rows))
    }

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::empty())
    }

    #[test]
    fn join_merges_compatible_pairs_only() -> Result<()> {
        let ctx = ctx();
        let left = stream(vec![
            Binding::new().with("x", Term::int(1)),
            Binding::new().with("x", Term::int(2)),
        ]);
        let right = stream(vec![
            Binding::new().with("x", Term::int(1)).with("y", Term::int(10)),
            Binding::new().with("x", Term::int(1)).with("y", Term::int(11)),
            Binding::new().with("x", Term::int(3)).with("y", Term::int(12)),
        ]);
        let mut join = JoinStream::new(left, right, ctx.clone());
        let rows = collect_bindings(&mut join, &ctx)?;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get(&Var::new("x")) == Some(&Term::int(1))));
        Ok(())
    }

    #[test]
    fn left_join_keeps_unmatched_and_filtered_rows() -> Result<()> {
        let ctx = ctx();
        let left = stream(vec![
            Binding::new().with("x", Term::int(1)),
            Binding::new().with("x", Term::int(2)),
        ]);
        let right = stream(vec![
            Binding::new().with("x", Term::int(1)).with("y", Term::int(3)),
            Binding::new().with("x", Term::int(2)).with("y", Term::int(30)),
        ]);
        let exprs = vec![PreparedExpr::new(
            Expr::gt(Expr::var("y"), Expr::int(5)),
            Arc::new(FunctionRegistry::with_builtins()),
        )];
        let mut lj = LeftJoinStream::new(left, right, exprs, ctx.clone());
        let rows = collect_bindings(&mut lj, &ctx)?;
        assert_eq!(
            rows,
            vec![
                Binding::new().with("x", Term::int(1)),
                Binding::new().with("x", Term::int(2)).with("y", Term::int(30)),
            ]
        );
        Ok(())
    }

    #[test]
    fn diff_removes_compatible_rows() -> Result<()> {
        let ctx = ctx();
        let left = stream(vec![
            Binding::new().with("x", Term::int(1)),
            Binding::new().with("x", Term::int(2)),
        ]);
        let right = stream(vec![Binding::new().with("x", Term::int(2))]);
        let mut diff = DiffStream::new(left, right, ctx.clone());
        assert_eq!(
            collect_bindings(&mut diff, &ctx)?,
            vec![Binding::new().with("x", Term::int(1))]
        );
        Ok(())
    }

    #[test]
    fn optional_index_emits_seed_when_right_is_empty() -> Result<()> {
        let ctx = ctx();
        let right = Arc::new(Op::Table(Table::from_rows(vec![Binding::new()
            .with("x", Term::int(1))
            .with("y", Term::int(9))])));
        let left = stream(vec![
            Binding::new().with("x", Term::int(1)),
            Binding::new().with("x", Term::int(2)),
        ]);
        let mut opt = OptionalIndexStream::new(left, right, ctx.clone());
        let rows = collect_bindings(&mut opt, &ctx)?;
        assert_eq!(
            rows,
            vec![
                Binding::new().with("x", Term::int(1)).with("y", Term::int(9)),
                Binding::new().with("x", Term::int(2)),
            ]
        );
        Ok(())
    }
}
