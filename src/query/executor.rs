//! Query executor: compiles an algebra tree and drains or streams its rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::query::algebra::Op;
use crate::query::binding::Binding;
use crate::query::compiler::compile;
use crate::query::context::ExecutionContext;
use crate::query::explain::{explain, PlanExplain};
use crate::query::stream::BoxBindingStream;
use crate::types::{Result, SombraError};

/// Materialised result returned by `execute`.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// The rows returned by the query.
    pub rows: Vec<Binding>,
}

/// Streaming handle over query rows.
///
/// The underlying stage tree is closed when the stream is exhausted, fails,
/// or is dropped.
pub struct ResultStream {
    bindings: BoxBindingStream,
    cancel_token: Option<Arc<AtomicBool>>,
    done: bool,
}

impl ResultStream {
    fn new(bindings: BoxBindingStream, cancel_token: Option<Arc<AtomicBool>>) -> Self {
        Self {
            bindings,
            cancel_token,
            done: false,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if let Some(flag) = &self.cancel_token {
            if flag.load(Ordering::SeqCst) {
                return Err(SombraError::Cancelled);
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.bindings.close();
        }
    }
}

impl Iterator for ResultStream {
    type Item = Result<Binding>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.check_cancel() {
            self.finish();
            return Some(Err(err));
        }
        match self.bindings.try_next() {
            Ok(Some(binding)) => Some(Ok(binding)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Runs algebra trees against one execution context.
#[derive(Clone, Debug)]
pub struct Executor {
    ctx: Arc<ExecutionContext>,
}

impl Executor {
    /// Creates an executor over `ctx`.
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    /// The context queries run in.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Compiles `op` and materializes all results into memory.
    pub fn execute(&self, op: &Op, cancel: Option<Arc<AtomicBool>>) -> Result<QueryResult> {
        let rows = self.stream(op, cancel)?.collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { rows })
    }

    /// Compiles `op` and returns a streaming iterator over its results.
    pub fn stream(&self, op: &Op, cancel: Option<Arc<AtomicBool>>) -> Result<ResultStream> {
        let ctx = match &cancel {
            Some(flag) => Arc::new((*self.ctx).clone().with_cancel_token(Arc::clone(flag))),
            None => Arc::clone(&self.ctx),
        };
        ctx.check_cancelled()?;
        let bindings = compile(op, &ctx)?;
        Ok(ResultStream::new(bindings, cancel))
    }

    /// Describes the plan `op` would compile to under this executor's config.
    pub fn explain(&self, op: &Op) -> PlanExplain {
        explain(op, self.ctx.config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::algebra::{Table, TermPattern, TriplePattern};
    use crate::query::dataset::InMemoryDataset;
    use crate::query::term::{Term, Var};

    fn ex(local: &str) -> Term {
        Term::iri(format!("http://example.org/{local}"))
    }

    fn executor() -> Executor {
        let data = InMemoryDataset::new()
            .with_triple(ex("a"), ex("p"), ex("b"))
            .with_triple(ex("b"), ex("p"), ex("c"));
        Executor::new(Arc::new(ExecutionContext::new(Arc::new(data))))
    }

    fn scan() -> Op {
        Op::bgp(vec![TriplePattern::new(
            TermPattern::var("s"),
            ex("p"),
            TermPattern::var("o"),
        )])
    }

    #[test]
    fn execute_materializes_rows() -> Result<()> {
        let result = executor().execute(&scan(), None)?;
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].get(&Var::new("s")), Some(&ex("a")));
        Ok(())
    }

    #[test]
    fn cancelled_token_stops_stream() -> Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut stream = executor().stream(&scan(), Some(flag.clone()))?;
        assert!(matches!(stream.next(), Some(Ok(_))));
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(stream.next(), Some(Err(SombraError::Cancelled))));
        assert!(stream.next().is_none());
        Ok(())
    }

    #[test]
    fn pre_cancelled_execution_fails_fast() {
        let flag = Arc::new(AtomicBool::new(true));
        let err = executor()
            .execute(&Op::Table(Table::unit()), Some(flag))
            .expect_err("cancelled");
        assert!(matches!(err, SombraError::Cancelled));
    }
}
