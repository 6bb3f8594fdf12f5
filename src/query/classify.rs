//! Linearity classifiers deciding whether a join or left-join may stream.
//!
//! Streaming evaluates the right side once per left row with that row as its
//! input, so every variable the left binds is already fixed while the right
//! runs. That is only equivalent to evaluating the right side independently
//! when nothing inside the right observes the difference: an optional match
//! that might bind a left variable, or an expression whose own scope does not
//! bind a variable the left supplies.

use std::collections::BTreeSet;

use crate::query::algebra::Op;
use crate::query::term::Var;

/// Variable scope summary of an algebra subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VarUsage {
    /// Bound in every solution.
    pub fixed: BTreeSet<Var>,
    /// Bound in some solutions only.
    pub optional: BTreeSet<Var>,
    /// Mentioned by an expression whose own sub-scope does not bind them.
    pub filter_unbound: BTreeSet<Var>,
}

impl VarUsage {
    /// Fixed and optional variables.
    pub fn all(&self) -> BTreeSet<Var> {
        self.fixed.union(&self.optional).cloned().collect()
    }

    fn fixed(vars: impl IntoIterator<Item = Var>) -> Self {
        Self {
            fixed: vars.into_iter().collect(),
            ..Self::default()
        }
    }

    fn with_fixed(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        self.fixed.extend(vars);
        self.optional.retain(|v| !self.fixed.contains(v));
        self
    }

    fn with_unbound_mentions(mut self, mentioned: BTreeSet<Var>) -> Self {
        self.filter_unbound
            .extend(mentioned.into_iter().filter(|v| !self.fixed.contains(v)));
        self
    }

    fn conjunction(mut self, other: VarUsage) -> Self {
        self.fixed.extend(other.fixed);
        self.optional.extend(other.optional);
        self.optional.retain(|v| !self.fixed.contains(v));
        self.filter_unbound.extend(other.filter_unbound);
        self
    }
}

/// Scope summary of `op`.
pub fn var_usage(op: &Op) -> VarUsage {
    match op {
        Op::Bgp(bgp) => VarUsage::fixed(bgp.triples().iter().flat_map(|t| t.vars().cloned())),
        Op::Triple(triple) => VarUsage::fixed(triple.vars().cloned()),
        Op::Quad(quad) => VarUsage::fixed(
            quad.pattern
                .triples()
                .iter()
                .flat_map(|t| t.vars().cloned())
                .chain(quad.graph.as_ref().and_then(|g| g.as_var().cloned())),
        ),
        Op::Path(path) => VarUsage::fixed(
            path.subject
                .as_var()
                .cloned()
                .into_iter()
                .chain(path.object.as_var().cloned()),
        ),
        Op::Join { left, right } => var_usage(left).conjunction(var_usage(right)),
        Op::Sequence(steps) => steps
            .iter()
            .fold(VarUsage::default(), |acc, step| acc.conjunction(var_usage(step))),
        Op::LeftJoin { left, right, exprs } => {
            let l = var_usage(left);
            let r = var_usage(right);
            let mut mentioned = BTreeSet::new();
            for expr in exprs.iter().flatten() {
                expr.collect_vars(&mut mentioned);
            }
            let scope: BTreeSet<Var> = l.all().union(&r.all()).cloned().collect();
            let mut usage = VarUsage {
                optional: l
                    .optional
                    .iter()
                    .chain(r.all().iter())
                    .filter(|v| !l.fixed.contains(*v))
                    .cloned()
                    .collect(),
                fixed: l.fixed,
                filter_unbound: l.filter_unbound,
            };
            usage.filter_unbound.extend(r.filter_unbound);
            usage
                .filter_unbound
                .extend(mentioned.into_iter().filter(|v| !scope.contains(v)));
            usage
        }
        Op::Conditional { left, right } => {
            let l = var_usage(left);
            let r = var_usage(right);
            let optional = l
                .optional
                .iter()
                .chain(r.all().iter())
                .filter(|v| !l.fixed.contains(*v))
                .cloned()
                .collect();
            let mut filter_unbound = l.filter_unbound;
            filter_unbound.extend(r.filter_unbound);
            VarUsage {
                fixed: l.fixed,
                optional,
                filter_unbound,
            }
        }
        Op::Union { left, right } => {
            let l = var_usage(left);
            let r = var_usage(right);
            let fixed: BTreeSet<Var> = l.fixed.intersection(&r.fixed).cloned().collect();
            let optional = l
                .all()
                .union(&r.all())
                .filter(|v| !fixed.contains(*v))
                .cloned()
                .collect();
            VarUsage {
                fixed,
                optional,
                filter_unbound: l.filter_unbound.union(&r.filter_unbound).cloned().collect(),
            }
        }
        Op::Diff { left, right } => {
            let l = var_usage(left);
            let r = var_usage(right);
            let removed: Vec<Var> = r.all().into_iter().filter(|v| !l.fixed.contains(v)).collect();
            let mut usage = l;
            usage.optional.extend(removed);
            usage.filter_unbound.extend(r.filter_unbound);
            usage
        }
        Op::Filter { exprs, sub_op } => {
            let mut mentioned = BTreeSet::new();
            for expr in exprs {
                expr.collect_vars(&mut mentioned);
            }
            var_usage(sub_op).with_unbound_mentions(mentioned)
        }
        Op::Graph { name, sub_op } => var_usage(sub_op).with_fixed(name.as_var().cloned()),
        Op::Service {
            endpoint, sub_op, ..
        } => var_usage(sub_op).with_fixed(endpoint.as_var().cloned()),
        Op::Procedure { args, sub_op, .. } => {
            let mut mentioned = BTreeSet::new();
            for arg in args {
                arg.collect_vars(&mut mentioned);
            }
            var_usage(sub_op).with_unbound_mentions(mentioned)
        }
        Op::PropFunc {
            subject,
            object,
            sub_op,
            ..
        } => var_usage(sub_op)
            .with_fixed(subject.vars().into_iter().chain(object.vars())),
        Op::DatasetNames { graph } => VarUsage::fixed(graph.as_var().cloned()),
        Op::Table(table) => VarUsage::fixed(table.vars.iter().cloned()),
        Op::Label { sub_op, .. } => sub_op.as_deref().map(var_usage).unwrap_or_default(),
        Op::List(sub_op) | Op::Order { sub_op, .. } | Op::Slice { sub_op, .. } => {
            var_usage(sub_op)
        }
        Op::Distinct(sub_op) | Op::Reduced(sub_op) => var_usage(sub_op),
        Op::Project { vars, sub_op } => {
            let inner = var_usage(sub_op);
            VarUsage {
                fixed: inner.fixed.into_iter().filter(|v| vars.contains(v)).collect(),
                optional: inner.optional.into_iter().filter(|v| vars.contains(v)).collect(),
                filter_unbound: BTreeSet::new(),
            }
        }
        Op::Group {
            group_vars,
            aggregators,
            ..
        } => VarUsage::fixed(
            group_vars
                .iter()
                .cloned()
                .chain(aggregators.iter().map(|agg| agg.var.clone())),
        ),
        Op::Assign {
            assignments,
            sub_op,
        } => {
            let mut mentioned = BTreeSet::new();
            for (_, expr) in assignments {
                expr.collect_vars(&mut mentioned);
            }
            var_usage(sub_op)
                .with_unbound_mentions(mentioned)
                .with_fixed(assignments.iter().map(|(var, _)| var.clone()))
        }
        Op::Null | Op::Ext(_) => VarUsage::default(),
    }
}

/// Strips transparent `Label` and `List` wrappers.
pub fn effective_op(mut op: &Op) -> &Op {
    loop {
        match op {
            Op::Label {
                sub_op: Some(inner),
                ..
            } => op = inner.as_ref(),
            Op::List(inner) => op = inner.as_ref(),
            _ => return op,
        }
    }
}

/// Right-hand operators that are never evaluated with a seeded input.
fn blocks_streaming(right: &Op) -> bool {
    right.is_modifier()
        || matches!(
            right,
            Op::Diff { .. }
                | Op::Service { .. }
                | Op::Ext(_)
                | Op::Conditional { .. }
                | Op::DatasetNames { .. }
        )
}

fn linear(left_vars: &BTreeSet<Var>, right: &Op) -> bool {
    if blocks_streaming(right) {
        return false;
    }
    let r = var_usage(right);
    left_vars.is_disjoint(&r.optional) && left_vars.is_disjoint(&r.filter_unbound)
}

/// Streamability of inner joins.
pub struct JoinClassifier;

impl JoinClassifier {
    /// True when `join(left, right)` may evaluate `right` per left row.
    pub fn is_linear(left: &Op, right: &Op) -> bool {
        let left = effective_op(left);
        let right = effective_op(right);
        linear(&var_usage(left).all(), right)
    }
}

/// Streamability of optional matches.
pub struct LeftJoinClassifier;

impl LeftJoinClassifier {
    /// True when `leftjoin(left, right)` may evaluate `right` per left row.
    ///
    /// Attached expressions do not affect the answer: the streamed strategy
    /// wraps the entire right side in them, so they see the merged row.
    pub fn is_linear(left: &Op, right: &Op) -> bool {
        let left = effective_op(left);
        let right = effective_op(right);
        let l = var_usage(left);
        let mut left_vars = l.all();
        left_vars.extend(l.filter_unbound);
        linear(&left_vars, right)
    }
}

/// Node-level form of the classifiers; other operators are never streamed.
pub fn is_streamable(op: &Op) -> bool {
    match op {
        Op::Join { left, right } => JoinClassifier::is_linear(left, right),
        Op::LeftJoin { left, right, .. } => LeftJoinClassifier::is_linear(left, right),
        _ => false,
    }
}
