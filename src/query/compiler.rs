//! Lowers an algebra tree into a composed tree of binding streams.
//!
//! Compilation is a single structural pass: every algebra node becomes one
//! physical stage wired onto the stream produced for its input. The only
//! choices made along the way are local: streamed versus materializing joins
//! and left-joins (decided by [`crate::query::classify`] and the compiler
//! configuration) and the identity and empty-input short-circuits for tables
//! and `null`.
//!
//! Per-binding stages (union branches, optional-index left-joins, GRAPH,
//! SERVICE) recompile their sub-plans for every input row through
//! [`compile_with_input`]; nothing is cached between calls.

use std::sync::Arc;

use tracing::debug;

use crate::query::algebra::{BasicPattern, ExtEval, Op, Table};
use crate::query::classify::{JoinClassifier, LeftJoinClassifier};
use crate::query::context::ExecutionContext;
use crate::query::expr::{prepare, Expr};
use crate::query::join::{DiffStream, JoinStream, LeftJoinStream, OptionalIndexStream};
use crate::query::pattern::{match_bgp, match_path};
use crate::query::procedure::{procedure_stream, ProcedureArgs};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::relational::{
    AssignStream, DistinctStream, FilterStream, GroupStream, ProjectStream, ReducedStream,
    SliceStream, SortStream,
};
use crate::query::repeat::{graph_stream, union_stream};
use crate::query::service::service_stream;
use crate::query::stream::{root, BoxBindingStream, NullStream};
use crate::types::{Result, SombraError};

/// Compiles `op` for a top-level query: the input is the root stream.
pub fn compile(op: &Op, ctx: &Arc<ExecutionContext>) -> Result<BoxBindingStream> {
    compile_with_input(op, root(), ctx)
}

/// Compiles `op` over an arbitrary input; used re-entrantly by per-binding stages.
pub fn compile_with_input(
    op: &Op,
    input: BoxBindingStream,
    ctx: &Arc<ExecutionContext>,
) -> Result<BoxBindingStream> {
    OpCompiler::new(Arc::clone(ctx)).compile_op(op, input)
}

/// Flattens nested binary unions into their branch list, left to right.
///
/// A non-union operator is returned as the single branch.
pub fn flatten_union(op: &Arc<Op>) -> Vec<Arc<Op>> {
    let mut branches = Vec::new();
    collect_union_branches(op, &mut branches);
    branches
}

fn collect_union_branches(op: &Arc<Op>, out: &mut Vec<Arc<Op>>) {
    match op.as_ref() {
        Op::Union { left, right } => {
            collect_union_branches(left, out);
            collect_union_branches(right, out);
        }
        _ => out.push(Arc::clone(op)),
    }
}

/// Algebra-to-stream dispatcher bound to one execution context.
#[derive(Clone, Debug)]
pub struct OpCompiler {
    ctx: Arc<ExecutionContext>,
}

impl OpCompiler {
    /// Dispatcher for `ctx`.
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    /// Context stages built by this dispatcher receive.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Lowers `op` onto `input`.
    ///
    /// The returned stream owns `input`; closing it closes `input`. Errors
    /// from collaborators are returned unchanged.
    pub fn compile_op(&self, op: &Op, input: BoxBindingStream) -> Result<BoxBindingStream> {
        let start = profile_timer();
        let result = self.dispatch(op, input);
        record_profile_timer(QueryProfileKind::Compile, start);
        result
    }

    fn dispatch(&self, op: &Op, input: BoxBindingStream) -> Result<BoxBindingStream> {
        let ctx = &self.ctx;
        match op {
            Op::Bgp(pattern) => match_bgp(pattern, input, ctx),
            Op::Triple(triple) => match_bgp(&BasicPattern::new(vec![triple.clone()]), input, ctx),
            Op::Path(path) => match_path(path, input, ctx),
            Op::Quad(quad) => {
                if !quad.is_default_graph() {
                    return Err(SombraError::NotImplemented(
                        "quad pattern over a named graph",
                    ));
                }
                match_bgp(&quad.pattern, input, ctx)
            }
            Op::Join { left, right } => self.compile_join(left, right, input),
            Op::LeftJoin { left, right, exprs } => {
                self.compile_left_join(left, right, exprs.as_deref(), input)
            }
            Op::Union { left, right } => {
                let mut branches = Vec::new();
                collect_union_branches(left, &mut branches);
                collect_union_branches(right, &mut branches);
                debug!(branches = branches.len(), "compiling n-ary union");
                Ok(union_stream(input, branches, Arc::clone(ctx)))
            }
            Op::Diff { left, right } => {
                let left = self.compile_op(left, input)?;
                let right = self.compile_op(right, root())?;
                Ok(Box::new(DiffStream::new(left, right, Arc::clone(ctx))))
            }
            Op::Conditional { .. } => Err(SombraError::NotImplemented("conditional")),
            Op::DatasetNames { .. } => Err(SombraError::NotImplemented("dataset names")),
            Op::Filter { exprs, sub_op } => {
                let prepared = prepare(exprs, ctx);
                let mut stream = self.compile_op(sub_op, input)?;
                for expr in prepared {
                    stream = Box::new(FilterStream::new(stream, expr));
                }
                Ok(stream)
            }
            Op::Graph { name, sub_op } => Ok(graph_stream(
                input,
                name.clone(),
                Arc::clone(sub_op),
                Arc::clone(ctx),
            )),
            Op::Service {
                endpoint,
                sub_op,
                silent,
            } => Ok(service_stream(
                input,
                endpoint.clone(),
                Arc::clone(sub_op),
                *silent,
                Arc::clone(ctx),
            )),
            Op::Procedure { name, args, sub_op } => {
                let procedure = ctx
                    .procedures()
                    .build(name, &ProcedureArgs::Exprs(args.clone()))?;
                let stream = self.compile_op(sub_op, input)?;
                Ok(procedure_stream(stream, procedure, Arc::clone(ctx)))
            }
            Op::PropFunc {
                property,
                subject,
                object,
                sub_op,
            } => {
                let args = ProcedureArgs::PropFunc {
                    subject: subject.clone(),
                    object: object.clone(),
                };
                let procedure = ctx.procedures().build(property, &args)?;
                let stream = self.compile_op(sub_op, input)?;
                Ok(procedure_stream(stream, procedure, Arc::clone(ctx)))
            }
            Op::Table(table) => self.compile_table(table, input),
            Op::Sequence(steps) => {
                let mut stream = input;
                for step in steps {
                    stream = self.compile_op(step, stream)?;
                }
                Ok(stream)
            }
            Op::Label { sub_op, .. } => match sub_op {
                Some(sub_op) => self.compile_op(sub_op, input),
                None => Ok(input),
            },
            Op::List(sub_op) => self.compile_op(sub_op, input),
            Op::Null => {
                let mut input = input;
                input.close();
                Ok(Box::new(NullStream::new()))
            }
            Op::Project { vars, sub_op } => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(ProjectStream::new(stream, vars.clone())))
            }
            Op::Order { conditions, sub_op } => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(SortStream::new(stream, conditions, Arc::clone(ctx))))
            }
            Op::Slice {
                offset,
                length,
                sub_op,
            } => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(SliceStream::new(stream, *offset, *length)))
            }
            Op::Distinct(sub_op) => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(DistinctStream::new(stream)))
            }
            Op::Reduced(sub_op) => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(ReducedStream::new(
                    stream,
                    ctx.config().reduced_window,
                )))
            }
            Op::Group {
                group_vars,
                aggregators,
                sub_op,
            } => {
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(GroupStream::new(
                    stream,
                    group_vars.clone(),
                    aggregators,
                    Arc::clone(ctx),
                )))
            }
            Op::Assign {
                assignments,
                sub_op,
            } => {
                let exprs: Vec<Expr> = assignments.iter().map(|(_, e)| e.clone()).collect();
                let prepared = assignments
                    .iter()
                    .map(|(var, _)| var.clone())
                    .zip(prepare(&exprs, ctx))
                    .collect();
                let stream = self.compile_op(sub_op, input)?;
                Ok(Box::new(AssignStream::new(stream, prepared)))
            }
            Op::Ext(ext) => match ext.eval(input, ctx) {
                Ok(ExtEval::Stream(stream)) => Ok(stream),
                Ok(ExtEval::Declined) | Err(SombraError::NotImplemented(_)) => {
                    Err(SombraError::UnsupportedExtension {
                        name: ext.name().to_owned(),
                    })
                }
                Err(err) => Err(err),
            },
        }
    }

    fn compile_join(
        &self,
        left: &Arc<Op>,
        right: &Arc<Op>,
        input: BoxBindingStream,
    ) -> Result<BoxBindingStream> {
        if self.ctx.config().streamed_joins && JoinClassifier::is_linear(left, right) {
            debug!(strategy = "streamed", "join");
            let left = self.compile_op(left, input)?;
            return self.compile_op(right, left);
        }
        debug!(strategy = "materialized", "join");
        let left = self.compile_op(left, input)?;
        let right = self.compile_op(right, root())?;
        Ok(Box::new(JoinStream::new(left, right, Arc::clone(&self.ctx))))
    }

    fn compile_left_join(
        &self,
        left: &Arc<Op>,
        right: &Arc<Op>,
        exprs: Option<&[Expr]>,
        input: BoxBindingStream,
    ) -> Result<BoxBindingStream> {
        if self.ctx.config().streamed_left_joins && LeftJoinClassifier::is_linear(left, right) {
            debug!(strategy = "streamed", "left join");
            let right = match exprs {
                Some(exprs) if !exprs.is_empty() => {
                    Arc::new(Op::filter(exprs.to_vec(), Arc::clone(right)))
                }
                _ => Arc::clone(right),
            };
            let left = self.compile_op(left, input)?;
            return Ok(Box::new(OptionalIndexStream::new(
                left,
                right,
                Arc::clone(&self.ctx),
            )));
        }
        debug!(strategy = "materialized", "left join");
        let prepared = prepare(exprs.unwrap_or_default(), &self.ctx);
        let left = self.compile_op(left, input)?;
        let right = self.compile_op(right, root())?;
        Ok(Box::new(LeftJoinStream::new(
            left,
            right,
            prepared,
            Arc::clone(&self.ctx),
        )))
    }

    fn compile_table(&self, table: &Table, mut input: BoxBindingStream) -> Result<BoxBindingStream> {
        if table.is_join_identity() {
            return Ok(input);
        }
        if input.is_root() {
            input.close();
            return Ok(table.iter());
        }
        Ok(Box::new(JoinStream::new(
            input,
            table.iter(),
            Arc::clone(&self.ctx),
        )))
    }
}
