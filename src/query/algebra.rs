//! Query algebra: the read-only operator tree the compiler lowers.
//!
//! Children are shared through `Arc<Op>` so per-binding stages can hold on to
//! a sub-tree and recompile it for every input row.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::query::expr::Expr;
use crate::query::stream::{BoxBindingStream, VecBindingStream};
use crate::query::term::{Term, Var};
use crate::types::Result;

/// Subject, predicate, object, or graph slot: a variable or a constant term.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermPattern {
    /// Variable slot.
    Var(Var),
    /// Constant slot.
    Term(Term),
}

impl TermPattern {
    /// Variable slot by bare name.
    pub fn var(name: impl Into<String>) -> Self {
        TermPattern::Var(Var::new(name))
    }

    /// Constant IRI slot.
    pub fn iri(iri: impl Into<String>) -> Self {
        TermPattern::Term(Term::iri(iri))
    }

    /// Returns the variable, if this slot is one.
    pub fn as_var(&self) -> Option<&Var> {
        match self {
            TermPattern::Var(var) => Some(var),
            TermPattern::Term(_) => None,
        }
    }

    /// Constant term, or the value `binding` gives the variable.
    pub fn resolve<'a>(&'a self, binding: &'a Binding) -> Option<&'a Term> {
        match self {
            TermPattern::Var(var) => binding.get(var),
            TermPattern::Term(term) => Some(term),
        }
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermPattern::Var(var) => write!(f, "{var}"),
            TermPattern::Term(term) => write!(f, "{term}"),
        }
    }
}

impl From<Term> for TermPattern {
    fn from(value: Term) -> Self {
        TermPattern::Term(value)
    }
}

impl From<Var> for TermPattern {
    fn from(value: Var) -> Self {
        TermPattern::Var(value)
    }
}

/// Single triple pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriplePattern {
    /// Subject slot.
    pub subject: TermPattern,
    /// Predicate slot.
    pub predicate: TermPattern,
    /// Object slot.
    pub object: TermPattern,
}

impl TriplePattern {
    /// Creates a triple pattern.
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Variables mentioned by the pattern.
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .filter_map(TermPattern::as_var)
    }
}

/// Conjunction of triple patterns matched against the active graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasicPattern(pub Vec<TriplePattern>);

impl BasicPattern {
    /// Wraps a list of triple patterns.
    pub fn new(triples: Vec<TriplePattern>) -> Self {
        BasicPattern(triples)
    }

    /// Triple patterns in declared order.
    pub fn triples(&self) -> &[TriplePattern] {
        &self.0
    }

    /// Returns true for the empty pattern.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Basic pattern scoped to a graph; `graph: None` is the default graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadPattern {
    /// Graph slot; `None` selects the default graph.
    #[serde(default)]
    pub graph: Option<TermPattern>,
    /// Triples matched inside the graph.
    pub pattern: BasicPattern,
}

impl QuadPattern {
    /// True when the pattern targets the default graph.
    pub fn is_default_graph(&self) -> bool {
        self.graph.is_none()
    }
}

/// Property path expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    /// Single predicate IRI.
    Link(String),
    /// `^p`.
    Inverse(Box<Path>),
    /// `p / q`.
    Sequence(Box<Path>, Box<Path>),
    /// `p | q`.
    Alternative(Box<Path>, Box<Path>),
    /// `p?`.
    ZeroOrOne(Box<Path>),
    /// `p*`.
    ZeroOrMore(Box<Path>),
    /// `p+`.
    OneOrMore(Box<Path>),
}

/// Triple whose predicate is a property path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePath {
    /// Path start.
    pub subject: TermPattern,
    /// Path expression.
    pub path: Path,
    /// Path end.
    pub object: TermPattern,
}

/// Static multiset of bindings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Declared variables.
    #[serde(default)]
    pub vars: Vec<Var>,
    /// Rows in declared order.
    #[serde(default)]
    pub rows: Vec<Binding>,
}

impl Table {
    /// One empty row: the join identity.
    pub fn unit() -> Self {
        Self {
            vars: Vec::new(),
            rows: vec![Binding::new()],
        }
    }

    /// No rows at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table over `rows`, declaring every variable any row binds.
    pub fn from_rows(rows: Vec<Binding>) -> Self {
        let vars: BTreeSet<Var> = rows.iter().flat_map(|row| row.vars().cloned()).collect();
        Self {
            vars: vars.into_iter().collect(),
            rows,
        }
    }

    /// Joining with this table leaves the other side unchanged.
    pub fn is_join_identity(&self) -> bool {
        self.rows.len() == 1 && self.rows[0].is_empty()
    }

    /// Returns true when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Streams the table's rows.
    pub fn iter(&self) -> BoxBindingStream {
        Box::new(VecBindingStream::new(self.rows.clone()))
    }
}

/// ORDER BY direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// One ORDER BY key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortCondition {
    /// Key expression.
    pub expr: Expr,
    /// Key direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortCondition {
    /// Ascending key.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Ascending,
        }
    }

    /// Descending key.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Descending,
        }
    }
}

/// Aggregate function applied per group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    /// `COUNT(*)` when `expr` is `None`.
    Count {
        /// Counted expression.
        #[serde(default)]
        expr: Option<Expr>,
        /// Count distinct values only.
        #[serde(default)]
        distinct: bool,
    },
    /// Numeric sum.
    Sum(Expr),
    /// Smallest value under the ORDER BY ordering.
    Min(Expr),
    /// Largest value under the ORDER BY ordering.
    Max(Expr),
    /// Numeric mean.
    Avg(Expr),
    /// Any one value.
    Sample(Expr),
    /// Lexical forms joined by `separator`.
    GroupConcat {
        /// Concatenated expression.
        expr: Expr,
        /// Separator, a single space by default.
        #[serde(default = "default_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    " ".to_owned()
}

/// Aggregator bound to its output variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExprAggregator {
    /// Output variable.
    pub var: Var,
    /// Aggregate function.
    pub aggregator: Aggregator,
}

/// Argument slot of a property function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropFuncArg {
    /// Single node.
    Node(TermPattern),
    /// Argument list.
    List(Vec<TermPattern>),
}

impl PropFuncArg {
    /// Variables mentioned by the argument.
    pub fn vars(&self) -> Vec<Var> {
        match self {
            PropFuncArg::Node(node) => node.as_var().cloned().into_iter().collect(),
            PropFuncArg::List(items) => items.iter().filter_map(|t| t.as_var().cloned()).collect(),
        }
    }
}

/// Result of asking an extension operator to evaluate itself.
pub enum ExtEval {
    /// The extension produced its output stream.
    Stream(BoxBindingStream),
    /// The extension does not support evaluation in this context.
    Declined,
}

/// Open algebra variant supplied by plugins.
pub trait OpExtension: fmt::Debug + Send + Sync {
    /// Identifying name used in error reports and explain output.
    fn name(&self) -> &str;

    /// Evaluates the extension over `input`.
    fn eval(&self, input: BoxBindingStream, ctx: &Arc<ExecutionContext>) -> Result<ExtEval>;
}

/// Algebra operator node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Basic graph pattern.
    Bgp(BasicPattern),
    /// Single triple pattern.
    Triple(TriplePattern),
    /// Graph-scoped basic pattern.
    Quad(QuadPattern),
    /// Property path pattern.
    Path(TriplePath),
    /// Inner join.
    Join {
        /// Left operand.
        left: Arc<Op>,
        /// Right operand.
        right: Arc<Op>,
    },
    /// Optional match with an optional attached filter.
    LeftJoin {
        /// Required side.
        left: Arc<Op>,
        /// Optional side.
        right: Arc<Op>,
        /// Filter evaluated over merged rows.
        #[serde(default)]
        exprs: Option<Vec<Expr>>,
    },
    /// Bag union.
    Union {
        /// First branch.
        left: Arc<Op>,
        /// Second branch.
        right: Arc<Op>,
    },
    /// Left rows with no compatible right row.
    Diff {
        /// Kept side.
        left: Arc<Op>,
        /// Removed side.
        right: Arc<Op>,
    },
    /// Conditional optional; never lowered.
    Conditional {
        /// Required side.
        left: Arc<Op>,
        /// Optional side.
        right: Arc<Op>,
    },
    /// Filter with an ordered expression list.
    Filter {
        /// Expressions applied in order.
        exprs: Vec<Expr>,
        /// Filtered sub-plan.
        sub_op: Arc<Op>,
    },
    /// Evaluate the sub-plan inside a named graph.
    Graph {
        /// Graph IRI or variable.
        name: TermPattern,
        /// Graph-scoped sub-plan.
        sub_op: Arc<Op>,
    },
    /// Remote sub-query.
    Service {
        /// Endpoint IRI or variable.
        endpoint: TermPattern,
        /// Sub-plan sent to the endpoint.
        sub_op: Arc<Op>,
        /// Failures yield the input row instead of aborting.
        #[serde(default)]
        silent: bool,
    },
    /// Named procedure applied per row.
    Procedure {
        /// Procedure IRI.
        name: String,
        /// Call arguments.
        #[serde(default)]
        args: Vec<Expr>,
        /// Sub-plan feeding the procedure.
        sub_op: Arc<Op>,
    },
    /// Property function applied per row.
    PropFunc {
        /// Property IRI.
        property: String,
        /// Subject argument.
        subject: PropFuncArg,
        /// Object argument.
        object: PropFuncArg,
        /// Sub-plan feeding the property function.
        sub_op: Arc<Op>,
    },
    /// Enumeration of dataset graph names; never lowered.
    DatasetNames {
        /// Graph name slot.
        graph: TermPattern,
    },
    /// Static table.
    Table(Table),
    /// Steps evaluated left to right, each seeded by the previous.
    Sequence(Vec<Arc<Op>>),
    /// Marker, optionally wrapping a sub-plan.
    Label {
        /// Label text.
        label: String,
        /// Wrapped sub-plan.
        #[serde(default)]
        sub_op: Option<Arc<Op>>,
    },
    /// Transparent list wrapper.
    List(Arc<Op>),
    /// Unsatisfiable pattern.
    Null,
    /// Column projection.
    Project {
        /// Kept variables.
        vars: Vec<Var>,
        /// Projected sub-plan.
        sub_op: Arc<Op>,
    },
    /// Sort.
    Order {
        /// Sort keys, most significant first.
        conditions: Vec<SortCondition>,
        /// Sorted sub-plan.
        sub_op: Arc<Op>,
    },
    /// Offset and limit.
    Slice {
        /// Rows skipped.
        #[serde(default)]
        offset: Option<usize>,
        /// Maximum rows emitted.
        #[serde(default)]
        length: Option<usize>,
        /// Sliced sub-plan.
        sub_op: Arc<Op>,
    },
    /// Exact duplicate elimination.
    Distinct(Arc<Op>),
    /// Approximate duplicate elimination.
    Reduced(Arc<Op>),
    /// Grouping with aggregates.
    Group {
        /// Grouping key variables.
        #[serde(default)]
        group_vars: Vec<Var>,
        /// Aggregates computed per group.
        #[serde(default)]
        aggregators: Vec<ExprAggregator>,
        /// Grouped sub-plan.
        sub_op: Arc<Op>,
    },
    /// Extend rows with computed variables.
    Assign {
        /// Assignments applied in order.
        assignments: Vec<(Var, Expr)>,
        /// Extended sub-plan.
        sub_op: Arc<Op>,
    },
    /// Plugin operator.
    #[serde(skip)]
    Ext(Arc<dyn OpExtension>),
}

impl Op {
    /// `join(left, right)`.
    pub fn join(left: impl Into<Arc<Op>>, right: impl Into<Arc<Op>>) -> Op {
        Op::Join {
            left: left.into(),
            right: right.into(),
        }
    }

    /// `leftjoin(left, right, exprs)`.
    pub fn left_join(
        left: impl Into<Arc<Op>>,
        right: impl Into<Arc<Op>>,
        exprs: Option<Vec<Expr>>,
    ) -> Op {
        Op::LeftJoin {
            left: left.into(),
            right: right.into(),
            exprs,
        }
    }

    /// `union(left, right)`.
    pub fn union(left: impl Into<Arc<Op>>, right: impl Into<Arc<Op>>) -> Op {
        Op::Union {
            left: left.into(),
            right: right.into(),
        }
    }

    /// `diff(left, right)`.
    pub fn diff(left: impl Into<Arc<Op>>, right: impl Into<Arc<Op>>) -> Op {
        Op::Diff {
            left: left.into(),
            right: right.into(),
        }
    }

    /// `filter(exprs, sub_op)`.
    pub fn filter(exprs: Vec<Expr>, sub_op: impl Into<Arc<Op>>) -> Op {
        Op::Filter {
            exprs,
            sub_op: sub_op.into(),
        }
    }

    /// Basic graph pattern over `triples`.
    pub fn bgp(triples: Vec<TriplePattern>) -> Op {
        Op::Bgp(BasicPattern::new(triples))
    }

    /// Static table op.
    pub fn table(table: Table) -> Op {
        Op::Table(table)
    }

    /// Operator name used by explain output and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Bgp(_) => "bgp",
            Op::Triple(_) => "triple",
            Op::Quad(_) => "quadpattern",
            Op::Path(_) => "path",
            Op::Join { .. } => "join",
            Op::LeftJoin { .. } => "leftjoin",
            Op::Union { .. } => "union",
            Op::Diff { .. } => "diff",
            Op::Conditional { .. } => "conditional",
            Op::Filter { .. } => "filter",
            Op::Graph { .. } => "graph",
            Op::Service { .. } => "service",
            Op::Procedure { .. } => "proc",
            Op::PropFunc { .. } => "propfunc",
            Op::DatasetNames { .. } => "datasetnames",
            Op::Table(_) => "table",
            Op::Sequence(_) => "sequence",
            Op::Label { .. } => "label",
            Op::List(_) => "tolist",
            Op::Null => "null",
            Op::Project { .. } => "project",
            Op::Order { .. } => "order",
            Op::Slice { .. } => "slice",
            Op::Distinct(_) => "distinct",
            Op::Reduced(_) => "reduced",
            Op::Group { .. } => "group",
            Op::Assign { .. } => "assign",
            Op::Ext(_) => "ext",
        }
    }

    /// Solution modifiers hide their sub-plan's scope from substitution.
    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            Op::Project { .. }
                | Op::Order { .. }
                | Op::Slice { .. }
                | Op::Distinct(_)
                | Op::Reduced(_)
                | Op::Group { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_table_is_join_identity() {
        assert!(Table::unit().is_join_identity());
        assert!(!Table::empty().is_join_identity());
        let one = Table::from_rows(vec![Binding::from_binding("x", Term::int(1))]);
        assert!(!one.is_join_identity());
        assert_eq!(one.vars, vec![Var::new("x")]);
    }

    #[test]
    fn op_round_trips_through_json() {
        let op = Op::join(
            Op::bgp(vec![TriplePattern::new(
                TermPattern::var("s"),
                TermPattern::iri("http://example.org/p"),
                TermPattern::var("o"),
            )]),
            Op::Table(Table::unit()),
        );
        let json = serde_json::to_string(&op).expect("serialize");
        let back: Op = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.name(), "join");
    }
}
