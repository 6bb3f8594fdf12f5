//! Triple pattern and property path matching against the active graph.
//!
//! Basic graph patterns are staged: one repeat-apply stage per triple
//! pattern, each probing the graph with the slots the incoming binding fixes.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::query::algebra::{BasicPattern, Path, TermPattern, TriplePath, TriplePattern};
use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::query::dataset::Graph;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::repeat::{RepeatApply, RepeatApplyStream};
use crate::query::stream::{BoxBindingStream, VecBindingStream};
use crate::query::term::Term;
use crate::types::Result;

/// Extends `binding` with `slot = term`; false when the slot disagrees.
fn bind_slot(binding: &mut Binding, slot: &TermPattern, term: &Term) -> bool {
    match slot {
        TermPattern::Term(constant) => constant == term,
        TermPattern::Var(var) => match binding.get(var) {
            Some(existing) => existing == term,
            None => {
                binding.insert(var.clone(), term.clone());
                true
            }
        },
    }
}

struct TripleApply {
    triple: TriplePattern,
    graph: Arc<dyn Graph>,
}

impl RepeatApply for TripleApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        let start = profile_timer();
        let found = self.graph.find(
            self.triple.subject.resolve(binding),
            self.triple.predicate.resolve(binding),
            self.triple.object.resolve(binding),
        );
        let rows = found
            .into_iter()
            .filter_map(|t| {
                let mut row = binding.clone();
                let ok = bind_slot(&mut row, &self.triple.subject, &t.subject)
                    && bind_slot(&mut row, &self.triple.predicate, &t.predicate)
                    && bind_slot(&mut row, &self.triple.object, &t.object);
                ok.then_some(row)
            })
            .collect();
        record_profile_timer(QueryProfileKind::Pattern, start);
        Ok(Box::new(VecBindingStream::new(rows)))
    }
}

/// Matches `pattern` against the active graph, extending every input binding.
pub fn match_bgp(
    pattern: &BasicPattern,
    input: BoxBindingStream,
    ctx: &Arc<ExecutionContext>,
) -> Result<BoxBindingStream> {
    let graph = ctx.active_graph();
    let mut stream = input;
    for triple in pattern.triples() {
        let stage = TripleApply {
            triple: triple.clone(),
            graph: Arc::clone(graph),
        };
        stream = Box::new(RepeatApplyStream::new(stream, stage));
    }
    Ok(stream)
}

fn step(graph: &dyn Graph, predicate: &str, node: &Term, forward: bool) -> Vec<Term> {
    let predicate = Term::iri(predicate);
    if forward {
        graph
            .find(Some(node), Some(&predicate), None)
            .into_iter()
            .map(|t| t.object)
            .collect()
    } else {
        graph
            .find(None, Some(&predicate), Some(node))
            .into_iter()
            .map(|t| t.subject)
            .collect()
    }
}

fn closure(graph: &dyn Graph, path: &Path, seeds: Vec<Term>, forward: bool) -> Vec<Term> {
    let mut seen: BTreeSet<Term> = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<Term> = seeds.into_iter().collect();
    while let Some(node) = queue.pop_front() {
        if !seen.insert(node.clone()) {
            continue;
        }
        order.push(node.clone());
        queue.extend(ends(graph, path, &node, forward));
    }
    order
}

/// Nodes reachable from `start` along `path` (or against it when `!forward`).
fn ends(graph: &dyn Graph, path: &Path, start: &Term, forward: bool) -> Vec<Term> {
    match path {
        Path::Link(predicate) => step(graph, predicate, start, forward),
        Path::Inverse(inner) => ends(graph, inner, start, !forward),
        Path::Sequence(first, second) => {
            let (a, b) = if forward {
                (first, second)
            } else {
                (second, first)
            };
            ends(graph, a, start, forward)
                .iter()
                .flat_map(|mid| ends(graph, b, mid, forward))
                .collect()
        }
        Path::Alternative(left, right) => {
            let mut out = ends(graph, left, start, forward);
            out.extend(ends(graph, right, start, forward));
            out
        }
        Path::ZeroOrOne(inner) => {
            let mut out = vec![start.clone()];
            for node in ends(graph, inner, start, forward) {
                if !out.contains(&node) {
                    out.push(node);
                }
            }
            out
        }
        Path::ZeroOrMore(inner) => closure(graph, inner, vec![start.clone()], forward),
        Path::OneOrMore(inner) => closure(graph, inner, ends(graph, inner, start, forward), forward),
    }
}

struct PathApply {
    path: TriplePath,
    graph: Arc<dyn Graph>,
}

impl PathApply {
    fn extend(&self, binding: &Binding, start: &Term, end: &Term, rows: &mut Vec<Binding>) {
        let mut row = binding.clone();
        if bind_slot(&mut row, &self.path.subject, start)
            && bind_slot(&mut row, &self.path.object, end)
        {
            rows.push(row);
        }
    }
}

impl RepeatApply for PathApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        let started = profile_timer();
        let graph = self.graph.as_ref();
        let path = &self.path.path;
        let mut rows = Vec::new();
        match (
            self.path.subject.resolve(binding).cloned(),
            self.path.object.resolve(binding).cloned(),
        ) {
            (Some(start), _) => {
                for end in ends(graph, path, &start, true) {
                    self.extend(binding, &start, &end, &mut rows);
                }
            }
            (None, Some(end)) => {
                for start in ends(graph, path, &end, false) {
                    self.extend(binding, &start, &end, &mut rows);
                }
            }
            (None, None) => {
                for start in graph.nodes() {
                    for end in ends(graph, path, &start, true) {
                        self.extend(binding, &start, &end, &mut rows);
                    }
                }
            }
        }
        record_profile_timer(QueryProfileKind::Pattern, started);
        Ok(Box::new(VecBindingStream::new(rows)))
    }
}

/// Matches a property path triple against the active graph.
///
/// `*` and `+` closures visit each node once; other operators keep
/// multiplicities.
pub fn match_path(
    path: &TriplePath,
    input: BoxBindingStream,
    ctx: &Arc<ExecutionContext>,
) -> Result<BoxBindingStream> {
    let stage = PathApply {
        path: path.clone(),
        graph: Arc::clone(ctx.active_graph()),
    };
    Ok(Box::new(RepeatApplyStream::new(input, stage)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::dataset::InMemoryDataset;
    use crate::query::stream::{collect_bindings, root};
    use crate::query::term::Var;

    fn ex(local: &str) -> Term {
        Term::iri(format!("http://example.org/{local}"))
    }

    fn chain_ctx() -> Arc<ExecutionContext> {
        let ds = InMemoryDataset::new()
            .with_triple(ex("a"), ex("knows"), ex("b"))
            .with_triple(ex("b"), ex("knows"), ex("c"))
            .with_triple(ex("c"), ex("knows"), ex("a"))
            .with_triple(ex("a"), ex("name"), Term::string("Ann"));
        Arc::new(ExecutionContext::new(Arc::new(ds)))
    }

    #[test]
    fn bgp_joins_through_shared_variables() -> Result<()> {
        let ctx = chain_ctx();
        let bgp = BasicPattern::new(vec![
            TriplePattern::new(TermPattern::var("x"), ex("knows"), TermPattern::var("y")),
            TriplePattern::new(TermPattern::var("y"), ex("knows"), ex("c")),
        ]);
        let mut stream = match_bgp(&bgp, root(), &ctx)?;
        let rows = collect_bindings(stream.as_mut(), &ctx)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&Var::new("x")), Some(&ex("a")));
        Ok(())
    }

    #[test]
    fn repeated_variable_must_match_consistently() -> Result<()> {
        let ds = InMemoryDataset::new()
            .with_triple(ex("a"), ex("p"), ex("a"))
            .with_triple(ex("a"), ex("p"), ex("b"));
        let ctx = Arc::new(ExecutionContext::new(Arc::new(ds)));
        let bgp = BasicPattern::new(vec![TriplePattern::new(
            TermPattern::var("x"),
            ex("p"),
            TermPattern::var("x"),
        )]);
        let mut stream = match_bgp(&bgp, root(), &ctx)?;
        assert_eq!(collect_bindings(stream.as_mut(), &ctx)?.len(), 1);
        Ok(())
    }

    #[test]
    fn zero_or_more_visits_cycle_once() -> Result<()> {
        let ctx = chain_ctx();
        let path = TriplePath {
            subject: TermPattern::Term(ex("a")),
            path: Path::ZeroOrMore(Box::new(Path::Link("http://example.org/knows".into()))),
            object: TermPattern::var("y"),
        };
        let mut stream = match_path(&path, root(), &ctx)?;
        let rows = collect_bindings(stream.as_mut(), &ctx)?;
        let ends: Vec<_> = rows.iter().filter_map(|r| r.get(&Var::new("y")).cloned()).collect();
        assert_eq!(ends, vec![ex("a"), ex("b"), ex("c")]);
        Ok(())
    }

    #[test]
    fn inverse_sequence_walks_backwards() -> Result<()> {
        let ctx = chain_ctx();
        let knows = || Box::new(Path::Link("http://example.org/knows".into()));
        let path = TriplePath {
            subject: TermPattern::Term(ex("c")),
            path: Path::Sequence(Box::new(Path::Inverse(knows())), Box::new(Path::Inverse(knows()))),
            object: TermPattern::var("y"),
        };
        let mut stream = match_path(&path, root(), &ctx)?;
        let rows = collect_bindings(stream.as_mut(), &ctx)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&Var::new("y")), Some(&ex("a")));
        Ok(())
    }

    #[test]
    fn one_or_more_with_bound_object_only() -> Result<()> {
        let ctx = chain_ctx();
        let path = TriplePath {
            subject: TermPattern::var("x"),
            path: Path::OneOrMore(Box::new(Path::Link("http://example.org/knows".into()))),
            object: TermPattern::Term(ex("b")),
        };
        let mut stream = match_path(&path, root(), &ctx)?;
        assert_eq!(collect_bindings(stream.as_mut(), &ctx)?.len(), 3);
        Ok(())
    }
}
