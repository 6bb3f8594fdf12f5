#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sombra_algebra::query::{
    binding::Binding,
    compiler::{compile, compile_with_input},
    config::CompilerConfig,
    context::ExecutionContext,
    dataset::InMemoryDataset,
    stream::{collect_bindings, BindingStream, BoxBindingStream},
    term::Term,
    Op,
};
use sombra_algebra::types::Result;

pub const EX: &str = "http://example.org/";

pub fn ex(local: &str) -> Term {
    Term::iri(format!("{EX}{local}"))
}

pub fn row(pairs: &[(&str, Term)]) -> Binding {
    pairs
        .iter()
        .fold(Binding::new(), |acc, (var, term)| acc.with(*var, term.clone()))
}

pub fn context(data: InMemoryDataset, config: CompilerConfig) -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::new(Arc::new(data)).with_config(config))
}

pub fn run(op: &Op, ctx: &Arc<ExecutionContext>) -> Result<Vec<Binding>> {
    let mut stream = compile(op, ctx)?;
    collect_bindings(stream.as_mut(), ctx)
}

pub fn run_over(op: &Op, input: BoxBindingStream, ctx: &Arc<ExecutionContext>) -> Result<Vec<Binding>> {
    let mut stream = compile_with_input(op, input, ctx)?;
    collect_bindings(stream.as_mut(), ctx)
}

pub fn sorted(mut rows: Vec<Binding>) -> Vec<Binding> {
    rows.sort();
    rows
}

/// Counters shared with a [`TrackedStream`].
#[derive(Clone, Debug, Default)]
pub struct Probe {
    closes: Arc<AtomicUsize>,
    pulls: Arc<AtomicUsize>,
}

impl Probe {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

/// Input stream that records how often it was pulled and released.
pub struct TrackedStream {
    rows: VecDeque<Binding>,
    probe: Probe,
}

impl BindingStream for TrackedStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        self.probe.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.rows.clear();
    }
}

pub fn tracked(rows: Vec<Binding>) -> (BoxBindingStream, Probe) {
    let probe = Probe::default();
    let stream = TrackedStream {
        rows: rows.into(),
        probe: probe.clone(),
    };
    (Box::new(stream), probe)
}
