//! Per-binding re-evaluation stages.
//!
//! A repeat-apply stage pulls one input binding at a time and asks its
//! [`RepeatApply`] implementation for a fresh sub-stream seeded by that
//! binding. The sub-stream is drained, released, and the next input binding
//! is pulled. Union fan-out and graph switching are built on the same loop.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::query::algebra::{Op, TermPattern};
use crate::query::binding::Binding;
use crate::query::compiler::compile_with_input;
use crate::query::context::ExecutionContext;
use crate::query::stream::{singleton, BindingStream, BoxBindingStream, NullStream};
use crate::types::Result;

/// Builds the sub-stream for one input binding.
pub trait RepeatApply {
    /// Sub-stream seeded by `binding`.
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream>;
}

/// Concatenates `apply(b)` over every input binding `b`.
pub struct RepeatApplyStream<A> {
    input: BoxBindingStream,
    current: Option<BoxBindingStream>,
    apply: A,
    closed: bool,
}

impl<A: RepeatApply> RepeatApplyStream<A> {
    /// Wraps `input`.
    pub fn new(input: BoxBindingStream, apply: A) -> Self {
        Self {
            input,
            current: None,
            apply,
            closed: false,
        }
    }
}

impl<A: RepeatApply> BindingStream for RepeatApplyStream<A> {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(row) = current.try_next()? {
                    return Ok(Some(row));
                }
                current.close();
                self.current = None;
            }
            match self.input.try_next()? {
                Some(binding) => self.current = Some(self.apply.apply(&binding)?),
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut current) = self.current.take() {
            current.close();
        }
        self.input.close();
    }
}

/// Sub-plan waiting to be compiled against a seed binding.
#[derive(Clone, Debug)]
pub struct PendingPlan {
    op: Arc<Op>,
    seed: Binding,
    ctx: Arc<ExecutionContext>,
}

impl PendingPlan {
    /// Compiles `op` against `singleton(seed)` in `ctx` when it is reached.
    pub fn new(op: Arc<Op>, seed: Binding, ctx: Arc<ExecutionContext>) -> Self {
        Self { op, seed, ctx }
    }
}

/// Compiles and drains each pending plan in order, one at a time.
pub struct LazyConcatStream {
    pending: VecDeque<PendingPlan>,
    current: Option<BoxBindingStream>,
    closed: bool,
}

impl LazyConcatStream {
    /// Concatenation of `plans` in order.
    pub fn new(plans: impl IntoIterator<Item = PendingPlan>) -> Self {
        Self {
            pending: plans.into_iter().collect(),
            current: None,
            closed: false,
        }
    }
}

impl BindingStream for LazyConcatStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(row) = current.try_next()? {
                    return Ok(Some(row));
                }
                current.close();
                self.current = None;
            }
            let Some(plan) = self.pending.pop_front() else {
                return Ok(None);
            };
            self.current = Some(compile_with_input(&plan.op, singleton(plan.seed), &plan.ctx)?);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        if let Some(mut current) = self.current.take() {
            current.close();
        }
    }
}

/// N-ary union: every branch re-evaluated per input binding, in branch order.
pub struct UnionApply {
    branches: Vec<Arc<Op>>,
    ctx: Arc<ExecutionContext>,
}

impl UnionApply {
    /// Union over already flattened `branches`.
    pub fn new(branches: Vec<Arc<Op>>, ctx: Arc<ExecutionContext>) -> Self {
        Self { branches, ctx }
    }
}

impl RepeatApply for UnionApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        let plans = self
            .branches
            .iter()
            .map(|branch| PendingPlan::new(branch.clone(), binding.clone(), self.ctx.clone()));
        Ok(Box::new(LazyConcatStream::new(plans)))
    }
}

/// Wraps `input` with the n-ary union stage.
pub fn union_stream(
    input: BoxBindingStream,
    branches: Vec<Arc<Op>>,
    ctx: Arc<ExecutionContext>,
) -> BoxBindingStream {
    Box::new(RepeatApplyStream::new(input, UnionApply::new(branches, ctx)))
}

/// GRAPH stage: evaluates the sub-plan inside the graph the name designates.
pub struct GraphApply {
    name: TermPattern,
    sub_op: Arc<Op>,
    ctx: Arc<ExecutionContext>,
}

impl GraphApply {
    /// Graph switch for `name` over `sub_op`.
    pub fn new(name: TermPattern, sub_op: Arc<Op>, ctx: Arc<ExecutionContext>) -> Self {
        Self { name, sub_op, ctx }
    }
}

impl RepeatApply for GraphApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        let dataset = self.ctx.dataset();
        if let Some(name) = self.name.resolve(binding) {
            let Some(graph) = dataset.named_graph(name) else {
                trace!(graph = %name, "graph not in dataset");
                return Ok(Box::new(NullStream::new()));
            };
            let ctx = self.ctx.with_active_graph(graph);
            return compile_with_input(&self.sub_op, singleton(binding.clone()), &ctx);
        }
        let Some(var) = self.name.as_var() else {
            return Ok(Box::new(NullStream::new()));
        };
        let plans = dataset
            .graph_names()
            .into_iter()
            .filter_map(|name| {
                let graph = dataset.named_graph(&name)?;
                let seed = binding.clone().with(var.clone(), name);
                Some(PendingPlan::new(
                    self.sub_op.clone(),
                    seed,
                    self.ctx.with_active_graph(graph),
                ))
            })
            .collect::<Vec<_>>();
        Ok(Box::new(LazyConcatStream::new(plans)))
    }
}

/// Wraps `input` with the graph-switch stage.
pub fn graph_stream(
    input: BoxBindingStream,
    name: TermPattern,
    sub_op: Arc<Op>,
    ctx: Arc<ExecutionContext>,
) -> BoxBindingStream {
    Box::new(RepeatApplyStream::new(input, GraphApply::new(name, sub_op, ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::algebra::{Table, TriplePattern};
    use crate::query::dataset::InMemoryDataset;
    use crate::query::stream::{collect_bindings, VecBindingStream};
    use crate::query::term::{Term, Var};

    struct Doubler;

    impl RepeatApply for Doubler {
        fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
            Ok(Box::new(VecBindingStream::new(vec![
                binding.clone(),
                binding.clone(),
            ])))
        }
    }

    #[test]
    fn repeat_apply_concatenates_per_binding() -> Result<()> {
        let ctx = ExecutionContext::empty();
        let input = Box::new(VecBindingStream::new(vec![
            Binding::from_binding("a", Term::int(1)),
            Binding::from_binding("a", Term::int(2)),
        ]));
        let mut stream = RepeatApplyStream::new(input, Doubler);
        let rows = collect_bindings(&mut stream, &ctx)?;
        let values: Vec<_> = rows.iter().map(|r| r.get(&Var::new("a")).cloned()).collect();
        assert_eq!(
            values,
            vec![
                Some(Term::int(1)),
                Some(Term::int(1)),
                Some(Term::int(2)),
                Some(Term::int(2))
            ]
        );
        Ok(())
    }

    #[test]
    fn union_branches_follow_each_input_row() -> Result<()> {
        let ctx = Arc::new(ExecutionContext::empty());
        let left = Arc::new(Op::Table(Table::from_rows(vec![Binding::from_binding(
            "b",
            Term::string("L"),
        )])));
        let right = Arc::new(Op::Table(Table::from_rows(vec![Binding::from_binding(
            "b",
            Term::string("R"),
        )])));
        let input = Box::new(VecBindingStream::new(vec![
            Binding::from_binding("a", Term::int(1)),
            Binding::from_binding("a", Term::int(2)),
        ]));
        let mut stream = union_stream(input, vec![left, right], ctx.clone());
        let rows = collect_bindings(stream.as_mut(), &ctx)?;
        let labels: Vec<String> = rows
            .iter()
            .map(|r| {
                format!(
                    "{}{}",
                    r.get(&Var::new("a")).map(|t| t.lexical().to_owned()).unwrap_or_default(),
                    r.get(&Var::new("b")).map(|t| t.lexical().to_owned()).unwrap_or_default()
                )
            })
            .collect();
        assert_eq!(labels, vec!["1L", "1R", "2L", "2R"]);
        Ok(())
    }

    #[test]
    fn unbound_graph_var_iterates_named_graphs() -> Result<()> {
        let ex = |l: &str| Term::iri(format!("http://example.org/{l}"));
        let ds = InMemoryDataset::new()
            .with_named_triple(ex("g1"), ex("a"), ex("p"), ex("b"))
            .with_named_triple(ex("g2"), ex("c"), ex("p"), ex("d"));
        let ctx = Arc::new(ExecutionContext::new(Arc::new(ds)));
        let sub = Arc::new(Op::Triple(TriplePattern::new(
            TermPattern::var("s"),
            TermPattern::Term(ex("p")),
            TermPattern::var("o"),
        )));
        let mut stream = graph_stream(
            crate::query::stream::root(),
            TermPattern::var("g"),
            sub,
            ctx.clone(),
        );
        let rows = collect_bindings(stream.as_mut(), &ctx)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(&Var::new("g")), Some(&ex("g1")));
        assert_eq!(rows[1].get(&Var::new("s")), Some(&ex("c")));
        Ok(())
    }
}
