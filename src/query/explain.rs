//! Plan explanation: the stage tree the dispatcher would build, without
//! running it.

use std::fmt::{self, Write as _};
use std::hash::Hasher;
use std::sync::Arc;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::query::algebra::{Aggregator, BasicPattern, Op, Path, SortDirection, TriplePattern};
use crate::query::classify::is_streamable;
use crate::query::compiler::flatten_union;
use crate::query::config::CompilerConfig;

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

/// Explain node representing a stage with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Stage name
    pub op: String,
    /// Additional properties describing the stage
    pub props: Vec<ExplainProp>,
    /// Input stages
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given stage name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn prop(mut self, prop: ExplainProp) -> Self {
        self.props.push(prop);
        self
    }

    fn input(mut self, input: ExplainNode) -> Self {
        self.inputs.push(input);
        self
    }

    /// First property named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        render(&self.root, 0, &mut out)?;
        writeln!(out, "plan_hash: {:016x}", self.plan_hash)?;
        f.write_str(&out)
    }
}

fn render(node: &ExplainNode, depth: usize, out: &mut String) -> fmt::Result {
    write!(out, "{:indent$}{}", "", node.op, indent = depth * 2)?;
    for prop in &node.props {
        write!(out, " {}={}", prop.key, prop.value)?;
    }
    out.push('\n');
    for input in &node.inputs {
        render(input, depth + 1, out)?;
    }
    Ok(())
}

/// Explains how `op` would be lowered under `config`.
pub fn explain(op: &Op, config: &CompilerConfig) -> PlanExplain {
    let root = build(op, config);
    let mut hasher = Xxh64::new(0);
    hash_node(&root, &mut hasher);
    PlanExplain {
        root,
        plan_hash: hasher.finish(),
    }
}

fn hash_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_node(child, hasher);
    }
}

fn describe_triple(triple: &TriplePattern) -> String {
    format!("{} {} {}", triple.subject, triple.predicate, triple.object)
}

fn describe_bgp(bgp: &BasicPattern) -> String {
    bgp.triples()
        .iter()
        .map(describe_triple)
        .collect::<Vec<_>>()
        .join(" . ")
}

fn describe_path(path: &Path) -> String {
    match path {
        Path::Link(iri) => format!("<{iri}>"),
        Path::Inverse(inner) => format!("^{}", describe_path(inner)),
        Path::Sequence(a, b) => format!("({}/{})", describe_path(a), describe_path(b)),
        Path::Alternative(a, b) => format!("({}|{})", describe_path(a), describe_path(b)),
        Path::ZeroOrOne(inner) => format!("{}?", describe_path(inner)),
        Path::ZeroOrMore(inner) => format!("{}*", describe_path(inner)),
        Path::OneOrMore(inner) => format!("{}+", describe_path(inner)),
    }
}

fn aggregator_name(agg: &Aggregator) -> &'static str {
    match agg {
        Aggregator::Count { distinct: true, .. } => "count_distinct",
        Aggregator::Count { .. } => "count",
        Aggregator::Sum(_) => "sum",
        Aggregator::Min(_) => "min",
        Aggregator::Max(_) => "max",
        Aggregator::Avg(_) => "avg",
        Aggregator::Sample(_) => "sample",
        Aggregator::GroupConcat { .. } => "group_concat",
    }
}

fn strategy(streamed: bool) -> ExplainProp {
    ExplainProp::plain("strategy", if streamed { "streamed" } else { "materialized" })
}

fn unary(name: &str, sub_op: &Arc<Op>, config: &CompilerConfig) -> ExplainNode {
    ExplainNode::new(name).input(build(sub_op, config))
}

fn build(op: &Op, config: &CompilerConfig) -> ExplainNode {
    match op {
        Op::Bgp(bgp) => ExplainNode::new("bgp")
            .prop(ExplainProp::plain("triples", bgp.triples().len().to_string()))
            .prop(ExplainProp::literal("pattern", describe_bgp(bgp))),
        Op::Triple(triple) => ExplainNode::new("bgp")
            .prop(ExplainProp::plain("triples", "1"))
            .prop(ExplainProp::literal("pattern", describe_triple(triple))),
        Op::Quad(quad) => match &quad.graph {
            None => ExplainNode::new("bgp")
                .prop(ExplainProp::plain("triples", quad.pattern.triples().len().to_string()))
                .prop(ExplainProp::literal("pattern", describe_bgp(&quad.pattern))),
            Some(graph) => ExplainNode::new("quadpattern")
                .prop(ExplainProp::plain("graph", graph.to_string()))
                .prop(ExplainProp::plain("unsupported", "true")),
        },
        Op::Path(path) => ExplainNode::new("path").prop(ExplainProp::literal(
            "pattern",
            format!("{} {} {}", path.subject, describe_path(&path.path), path.object),
        )),
        Op::Join { left, right } => {
            let streamed = config.streamed_joins && is_streamable(op);
            ExplainNode::new("join")
                .prop(strategy(streamed))
                .input(build(left, config))
                .input(build(right, config))
        }
        Op::LeftJoin { left, right, exprs } => {
            let streamed = config.streamed_left_joins && is_streamable(op);
            let mut node = ExplainNode::new("leftjoin").prop(strategy(streamed));
            for expr in exprs.iter().flatten() {
                node = node.prop(ExplainProp::literal("expr", expr.to_string()));
            }
            node.input(build(left, config)).input(build(right, config))
        }
        Op::Union { .. } => {
            let branches = flatten_union(&Arc::new(op.clone()));
            let mut node =
                ExplainNode::new("union").prop(ExplainProp::plain("branches", branches.len().to_string()));
            for branch in &branches {
                node = node.input(build(branch, config));
            }
            node
        }
        Op::Diff { left, right } => ExplainNode::new("diff")
            .input(build(left, config))
            .input(build(right, config)),
        Op::Conditional { left, right } => ExplainNode::new("conditional")
            .prop(ExplainProp::plain("unsupported", "true"))
            .input(build(left, config))
            .input(build(right, config)),
        Op::DatasetNames { graph } => ExplainNode::new("datasetnames")
            .prop(ExplainProp::plain("graph", graph.to_string()))
            .prop(ExplainProp::plain("unsupported", "true")),
        Op::Filter { exprs, sub_op } => {
            let mut node = build(sub_op, config);
            for expr in exprs {
                node = ExplainNode::new("filter")
                    .prop(ExplainProp::literal("expr", expr.to_string()))
                    .input(node);
            }
            node
        }
        Op::Graph { name, sub_op } => unary("graph", sub_op, config)
            .prop(ExplainProp::plain("name", name.to_string())),
        Op::Service {
            endpoint,
            sub_op,
            silent,
        } => unary("service", sub_op, config)
            .prop(ExplainProp::plain("endpoint", endpoint.to_string()))
            .prop(ExplainProp::plain("silent", silent.to_string())),
        Op::Procedure { name, args, sub_op } => unary("procedure", sub_op, config)
            .prop(ExplainProp::plain("name", name.clone()))
            .prop(ExplainProp::plain("args", args.len().to_string())),
        Op::PropFunc {
            property, sub_op, ..
        } => unary("propfunc", sub_op, config)
            .prop(ExplainProp::plain("property", property.clone())),
        Op::Table(table) => {
            let node = ExplainNode::new("table")
                .prop(ExplainProp::plain("rows", table.rows.len().to_string()));
            if table.is_join_identity() {
                node.prop(ExplainProp::plain("identity", "true"))
            } else {
                node
            }
        }
        Op::Sequence(steps) => {
            let mut node = ExplainNode::new("sequence")
                .prop(ExplainProp::plain("steps", steps.len().to_string()));
            for step in steps {
                node = node.input(build(step, config));
            }
            node
        }
        Op::Label { label, sub_op } => match sub_op {
            Some(sub_op) => build(sub_op, config),
            None => ExplainNode::new("input").prop(ExplainProp::plain("label", label.clone())),
        },
        Op::List(sub_op) => build(sub_op, config),
        Op::Null => ExplainNode::new("null"),
        Op::Project { vars, sub_op } => unary("project", sub_op, config).prop(ExplainProp::plain(
            "vars",
            vars.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "),
        )),
        Op::Order { conditions, sub_op } => {
            let keys = conditions
                .iter()
                .map(|c| match c.direction {
                    SortDirection::Ascending => format!("asc({})", c.expr),
                    SortDirection::Descending => format!("desc({})", c.expr),
                })
                .collect::<Vec<_>>()
                .join(" ");
            unary("order", sub_op, config).prop(ExplainProp::literal("keys", keys))
        }
        Op::Slice {
            offset,
            length,
            sub_op,
        } => {
            let mut node = unary("slice", sub_op, config);
            if let Some(offset) = offset {
                node = node.prop(ExplainProp::plain("offset", offset.to_string()));
            }
            if let Some(length) = length {
                node = node.prop(ExplainProp::plain("length", length.to_string()));
            }
            node
        }
        Op::Distinct(sub_op) => unary("distinct", sub_op, config),
        Op::Reduced(sub_op) => unary("reduced", sub_op, config)
            .prop(ExplainProp::plain("window", config.reduced_window.to_string())),
        Op::Group {
            group_vars,
            aggregators,
            sub_op,
        } => {
            let mut node = unary("group", sub_op, config).prop(ExplainProp::plain(
                "by",
                group_vars.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "),
            ));
            for agg in aggregators {
                node = node.prop(ExplainProp::plain(
                    "aggregate",
                    format!("{}={}", agg.var, aggregator_name(&agg.aggregator)),
                ));
            }
            node
        }
        Op::Assign {
            assignments,
            sub_op,
        } => {
            let mut node = unary("assign", sub_op, config);
            for (var, expr) in assignments {
                node = node.prop(ExplainProp::literal("bind", format!("{var}={expr}")));
            }
            node
        }
        Op::Ext(ext) => ExplainNode::new("ext").prop(ExplainProp::plain("name", ext.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::algebra::{Table, TermPattern};
    use crate::query::expr::Expr;

    fn bgp(s: &str, o: &str) -> Op {
        Op::bgp(vec![TriplePattern::new(
            TermPattern::var(s),
            TermPattern::iri("http://example.org/p"),
            TermPattern::var(o),
        )])
    }

    #[test]
    fn join_strategy_follows_config() {
        let op = Op::join(bgp("x", "y"), bgp("y", "z"));
        let streamed = explain(&op, &CompilerConfig::default());
        assert_eq!(streamed.root.get("strategy"), Some("streamed"));
        let materialized = explain(&op, &CompilerConfig::materializing());
        assert_eq!(materialized.root.get("strategy"), Some("materialized"));
        assert_ne!(streamed.plan_hash, materialized.plan_hash);
    }

    #[test]
    fn hash_is_deterministic() {
        let op = Op::filter(
            vec![Expr::gt(Expr::var("y"), Expr::int(5))],
            Op::union(bgp("a", "b"), Op::union(bgp("c", "d"), Op::Table(Table::unit()))),
        );
        let a = explain(&op, &CompilerConfig::default());
        let b = explain(&op, &CompilerConfig::default());
        assert_eq!(a.plan_hash, b.plan_hash);
        assert_eq!(a.root.op, "filter");
        assert_eq!(a.root.inputs[0].get("branches"), Some("3"));
        assert!(a.to_string().contains("identity=true"));
    }
}
