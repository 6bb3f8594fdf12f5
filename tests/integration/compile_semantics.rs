#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{context, ex, row, run, run_over, sorted, tracked};
use sombra_algebra::query::{
    algebra::{ExtEval, OpExtension, Table, TermPattern, TriplePattern},
    binding::Binding,
    compiler::{compile_with_input, flatten_union},
    config::CompilerConfig,
    context::ExecutionContext,
    dataset::InMemoryDataset,
    explain,
    expr::{Expr, FunctionRegistry},
    stream::{collect_bindings, BoxBindingStream},
    term::Term,
    Op,
};
use sombra_algebra::types::{Result, SombraError};

fn scan(s: &str, p: &str, o: &str) -> Op {
    Op::bgp(vec![TriplePattern::new(
        TermPattern::var(s),
        ex(p),
        TermPattern::var(o),
    )])
}

fn knows_data() -> InMemoryDataset {
    InMemoryDataset::new()
        .with_triple(ex("alice"), ex("knows"), ex("bob"))
        .with_triple(ex("bob"), ex("knows"), ex("carol"))
        .with_triple(ex("carol"), ex("knows"), ex("alice"))
        .with_triple(ex("alice"), ex("age"), Term::int(31))
        .with_triple(ex("carol"), ex("age"), Term::int(27))
}

fn table(rows: Vec<Binding>) -> Op {
    Op::Table(Table::from_rows(rows))
}

#[test]
fn filter_over_streamed_join_keeps_single_match() -> Result<()> {
    let data = InMemoryDataset::new()
        .with_triple(Term::int(1), ex("p"), Term::int(10))
        .with_triple(Term::int(3), ex("p"), Term::int(30));
    let left = table(vec![
        row(&[("x", Term::int(1))]),
        row(&[("x", Term::int(2))]),
    ]);
    let op = Op::filter(
        vec![Expr::gt(Expr::var("y"), Expr::int(5))],
        Op::join(left, scan("x", "p", "y")),
    );

    let plan = explain(&op, &CompilerConfig::default());
    assert_eq!(plan.root.inputs[0].get("strategy"), Some("streamed"));

    let ctx = context(data, CompilerConfig::default());
    let rows = run(&op, &ctx)?;
    assert_eq!(rows, vec![row(&[("x", Term::int(1)), ("y", Term::int(10))])]);
    Ok(())
}

#[test]
fn join_strategies_agree() -> Result<()> {
    let op = Op::join(scan("a", "knows", "b"), scan("b", "knows", "c"));
    let streamed = run(&op, &context(knows_data(), CompilerConfig::default()))?;
    let materialized = run(&op, &context(knows_data(), CompilerConfig::materializing()))?;
    assert_eq!(streamed.len(), 3);
    assert_eq!(sorted(streamed), sorted(materialized));
    Ok(())
}

#[test]
fn filter_scoped_to_right_side_forces_materialization() -> Result<()> {
    let right = Op::filter(
        vec![Expr::bound("a")],
        scan("b", "age", "n"),
    );
    let op = Op::join(scan("a", "knows", "b"), right);
    let plan = explain(&op, &CompilerConfig::default());
    assert_eq!(plan.root.get("strategy"), Some("materialized"));

    let rows = run(&op, &context(knows_data(), CompilerConfig::default()))?;
    assert!(rows.is_empty(), "?a is unbound inside the right side: {rows:?}");
    Ok(())
}

#[test]
fn left_join_preserves_every_left_row() -> Result<()> {
    let op = Op::left_join(scan("a", "knows", "b"), scan("b", "age", "n"), None);
    for config in [CompilerConfig::default(), CompilerConfig::materializing()] {
        let rows = sorted(run(&op, &context(knows_data(), config))?);
        assert_eq!(rows.len(), 3);
        let unmatched: Vec<_> = rows
            .iter()
            .filter(|r| r.get(&"n".into()).is_none())
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].get(&"b".into()), Some(&ex("bob")));
    }
    Ok(())
}

#[test]
fn left_join_condition_sees_both_sides() -> Result<()> {
    let op = Op::left_join(
        scan("a", "knows", "b"),
        scan("b", "age", "n"),
        Some(vec![Expr::lt(Expr::var("n"), Expr::int(30))]),
    );
    let streamed = sorted(run(&op, &context(knows_data(), CompilerConfig::default()))?);
    let materialized = sorted(run(&op, &context(knows_data(), CompilerConfig::materializing()))?);
    assert_eq!(streamed, materialized);
    let extended: Vec<_> = streamed
        .iter()
        .filter_map(|r| r.get(&"n".into()))
        .collect();
    assert_eq!(extended, vec![&Term::int(27)]);
    Ok(())
}

#[test]
fn nested_unions_flatten_in_order() {
    let branch = |tag: i64| Arc::new(table(vec![row(&[("t", Term::int(tag))])]));
    let (a, b, c, d) = (branch(1), branch(2), branch(3), branch(4));
    let op = Arc::new(Op::union(
        Op::union(Arc::clone(&a), Arc::clone(&b)),
        Op::union(Arc::clone(&c), Arc::clone(&d)),
    ));
    let branches = flatten_union(&op);
    assert_eq!(branches.len(), 4);
    for (got, want) in branches.iter().zip([&a, &b, &c, &d]) {
        assert!(Arc::ptr_eq(got, want));
    }
}

#[test]
fn union_emits_branches_in_order_per_input_row() -> Result<()> {
    let branch = |tag: i64| table(vec![row(&[("t", Term::int(tag))])]);
    let op = Op::union(Op::union(branch(1), branch(2)), Op::union(branch(3), branch(4)));
    let ctx = Arc::new(ExecutionContext::empty());
    let (input, probe) = tracked(vec![
        row(&[("k", Term::int(1))]),
        row(&[("k", Term::int(2))]),
    ]);
    let rows = run_over(&op, input, &ctx)?;
    let order: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| {
            let k = r.get(&"k".into()).and_then(Term::as_numeric).map(|n| n.as_f64() as i64);
            let t = r.get(&"t".into()).and_then(Term::as_numeric).map(|n| n.as_f64() as i64);
            (k.unwrap_or(-1), t.unwrap_or(-1))
        })
        .collect();
    assert_eq!(
        order,
        vec![(1, 1), (1, 2), (1, 3), (1, 4), (2, 1), (2, 2), (2, 3), (2, 4)]
    );
    assert_eq!(probe.closes(), 1);
    Ok(())
}

#[test]
fn identity_table_over_root_yields_one_empty_row() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let rows = run(&Op::Table(Table::unit()), &ctx)?;
    assert_eq!(rows, vec![Binding::new()]);
    Ok(())
}

#[test]
fn identity_table_returns_input_untouched() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let input_rows = vec![row(&[("x", Term::int(1))]), row(&[("x", Term::int(2))])];
    let (input, probe) = tracked(input_rows.clone());
    let rows = run_over(&Op::Table(Table::unit()), input, &ctx)?;
    assert_eq!(rows, input_rows);
    assert_eq!(probe.closes(), 1);
    Ok(())
}

#[test]
fn table_over_non_root_input_is_joined() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let (input, probe) = tracked(vec![
        row(&[("x", Term::int(1))]),
        row(&[("x", Term::int(2))]),
    ]);
    let op = table(vec![row(&[("x", Term::int(1)), ("y", ex("a"))])]);
    let rows = run_over(&op, input, &ctx)?;
    assert_eq!(rows, vec![row(&[("x", Term::int(1)), ("y", ex("a"))])]);
    assert!(probe.pulls() > 0);
    Ok(())
}

#[test]
fn null_releases_input_and_yields_nothing() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let (input, probe) = tracked(vec![row(&[("x", Term::int(1))])]);
    let rows = run_over(&Op::Null, input, &ctx)?;
    assert!(rows.is_empty());
    assert_eq!(probe.closes(), 1);
    assert_eq!(probe.pulls(), 0);
    Ok(())
}

#[test]
fn first_rejecting_filter_wins() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut functions = FunctionRegistry::with_builtins();
    let counter = Arc::clone(&calls);
    functions.register("probe", Some(0), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Term::boolean(true))
    });
    let ctx = Arc::new(ExecutionContext::empty().with_functions(Arc::new(functions)));
    let op = Op::filter(
        vec![
            Expr::lt(Expr::var("v"), Expr::int(5)),
            Expr::call("probe", Vec::new()),
        ],
        table(vec![
            row(&[("v", Term::int(7))]),
            row(&[("v", Term::int(3))]),
        ]),
    );
    let rows = run(&op, &ctx)?;
    assert_eq!(rows, vec![row(&[("v", Term::int(3))])]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn double_close_releases_children_once() -> Result<()> {
    let ctx = context(knows_data(), CompilerConfig::default());
    let plans = [
        Op::filter(
            vec![Expr::bound("b")],
            Op::Distinct(Arc::new(scan("a", "knows", "b"))),
        ),
        Op::join(scan("a", "knows", "b"), scan("b", "knows", "c")),
        Op::left_join(scan("a", "knows", "b"), scan("b", "age", "n"), None),
        Op::union(scan("a", "knows", "b"), scan("a", "age", "n")),
    ];
    for op in &plans {
        let (input, probe) = tracked(vec![Binding::new()]);
        let mut stream = compile_with_input(op, input, &ctx)?;
        stream.try_next()?;
        stream.close();
        stream.close();
        assert_eq!(probe.closes(), 1, "plan {}", op.name());
        assert!(stream.try_next()?.is_none());
    }
    Ok(())
}

#[derive(Debug)]
struct Passthrough {
    decline: bool,
}

impl OpExtension for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn eval(&self, input: BoxBindingStream, _: &Arc<ExecutionContext>) -> Result<ExtEval> {
        if self.decline {
            Ok(ExtEval::Declined)
        } else {
            Ok(ExtEval::Stream(input))
        }
    }
}

#[test]
fn extensions_stream_or_decline() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let accepted = Op::Ext(Arc::new(Passthrough { decline: false }));
    assert_eq!(run(&accepted, &ctx)?, vec![Binding::new()]);

    let declined = Op::Ext(Arc::new(Passthrough { decline: true }));
    let err = run(&declined, &ctx).expect_err("declined");
    assert!(matches!(err, SombraError::UnsupportedExtension { name } if name == "passthrough"));
    Ok(())
}

#[test]
fn unsupported_operators_fail() {
    let ctx = Arc::new(ExecutionContext::empty());
    let conditional = Op::Conditional {
        left: Arc::new(Op::Table(Table::unit())),
        right: Arc::new(Op::Table(Table::unit())),
    };
    let names = Op::DatasetNames {
        graph: TermPattern::var("g"),
    };
    for op in [conditional, names] {
        let err = run(&op, &ctx).expect_err("unsupported");
        assert!(matches!(err, SombraError::NotImplemented(_)), "{err}");
    }
}

#[test]
fn sequence_feeds_each_step_into_the_next() -> Result<()> {
    let op = Op::Sequence(vec![
        Arc::new(scan("a", "knows", "b")),
        Arc::new(scan("b", "age", "n")),
    ]);
    let ctx = context(knows_data(), CompilerConfig::default());
    let mut stream = compile_with_input(&op, common::tracked(vec![Binding::new()]).0, &ctx)?;
    let rows = collect_bindings(stream.as_mut(), &ctx)?;
    assert_eq!(
        sorted(rows),
        vec![
            row(&[("a", ex("bob")), ("b", ex("carol")), ("n", Term::int(27))]),
            row(&[("a", ex("carol")), ("b", ex("alice")), ("n", Term::int(31))]),
        ]
    );
    Ok(())
}

fn ints(pairs: &[(&str, i64)]) -> Binding {
    pairs
        .iter()
        .fold(Binding::new(), |acc, (var, value)| acc.with(*var, Term::int(*value)))
}

fn one_row(pairs: &[(&str, i64)]) -> Op {
    table(vec![ints(pairs)])
}

#[test]
fn scope_sensitive_right_sides_materialize_and_agree() -> Result<()> {
    let cases = [
        (
            "diff",
            Op::diff(one_row(&[("y", 1)]), one_row(&[("x", 2)])),
            vec![],
        ),
        (
            "union with optional branch",
            Op::union(
                one_row(&[("x", 1), ("y", 1)]),
                Op::left_join(one_row(&[("z", 1)]), one_row(&[("z", 1), ("x", 2)]), None),
            ),
            vec![ints(&[("x", 1), ("y", 1)])],
        ),
        (
            "nested left join",
            Op::left_join(one_row(&[("z", 1)]), one_row(&[("z", 1), ("x", 2)]), None),
            vec![],
        ),
        (
            "filter over left variable",
            Op::filter(vec![Expr::bound("x")], one_row(&[("z", 1)])),
            vec![],
        ),
        (
            "filter over diff",
            Op::filter(
                vec![Expr::bound("y")],
                Op::diff(one_row(&[("y", 1)]), one_row(&[("x", 2)])),
            ),
            vec![],
        ),
    ];
    for (name, right, expected) in cases {
        let op = Op::join(one_row(&[("x", 1)]), right);
        let plan = explain(&op, &CompilerConfig::default());
        assert_eq!(plan.root.get("strategy"), Some("materialized"), "{name}");

        let streamed = run(&op, &context(InMemoryDataset::new(), CompilerConfig::default()))?;
        let materialized = run(
            &op,
            &context(InMemoryDataset::new(), CompilerConfig::materializing()),
        )?;
        assert_eq!(sorted(streamed), expected, "{name}");
        assert_eq!(sorted(materialized), expected, "{name}");
    }
    Ok(())
}

#[test]
fn diff_evaluates_removed_side_from_a_fresh_root() -> Result<()> {
    let ctx = Arc::new(ExecutionContext::empty());
    let (input, probe) = tracked(vec![ints(&[("x", 1)])]);
    let op = Op::diff(
        one_row(&[("y", 1)]),
        Op::filter(vec![Expr::bound("x")], one_row(&[("z", 5)])),
    );
    let rows = run_over(&op, input, &ctx)?;
    assert_eq!(rows, vec![ints(&[("x", 1), ("y", 1)])]);
    assert_eq!(probe.closes(), 1);
    Ok(())
}
