//! Named procedures and property functions applied once per input row.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::query::algebra::PropFuncArg;
use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::query::expr::Expr;
use crate::query::repeat::{RepeatApply, RepeatApplyStream};
use crate::query::stream::BoxBindingStream;
use crate::types::{Result, SombraError};

/// Arguments a procedure is built with.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcedureArgs {
    /// `proc` call arguments.
    Exprs(Vec<Expr>),
    /// Property function subject and object.
    PropFunc {
        /// Subject argument.
        subject: PropFuncArg,
        /// Object argument.
        object: PropFuncArg,
    },
}

/// Built procedure instance, applied to each row of its sub-plan.
pub trait Procedure {
    /// Rows produced for `binding`; each should extend it.
    fn call(&mut self, binding: &Binding, ctx: &Arc<ExecutionContext>) -> Result<BoxBindingStream>;
}

/// Builds procedure instances for one name.
pub trait ProcedureFactory: Send + Sync {
    /// Creates an instance for `name` with `args`.
    fn create(&self, name: &str, args: &ProcedureArgs) -> Result<Box<dyn Procedure>>;
}

impl<F> ProcedureFactory for F
where
    F: Fn(&str, &ProcedureArgs) -> Result<Box<dyn Procedure>> + Send + Sync,
{
    fn create(&self, name: &str, args: &ProcedureArgs) -> Result<Box<dyn Procedure>> {
        self(name, args)
    }
}

/// Name-to-factory table for procedures and property functions.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    factories: FxHashMap<String, Arc<dyn ProcedureFactory>>,
}

impl ProcedureRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the factory for `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ProcedureFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Builder-style [`ProcedureRegistry::register`].
    pub fn with(mut self, name: impl Into<String>, factory: Arc<dyn ProcedureFactory>) -> Self {
        self.register(name, factory);
        self
    }

    /// Returns true when `name` has a factory.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds an instance; unregistered names fail with `UnknownProcedure`.
    pub fn build(&self, name: &str, args: &ProcedureArgs) -> Result<Box<dyn Procedure>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SombraError::UnknownProcedure {
                name: name.to_owned(),
            })?;
        factory.create(name, args)
    }
}

impl fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProcedureRegistry").field("names", &names).finish()
    }
}

struct ProcedureApply {
    procedure: Box<dyn Procedure>,
    ctx: Arc<ExecutionContext>,
}

impl RepeatApply for ProcedureApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        self.procedure.call(binding, &self.ctx)
    }
}

/// Applies `procedure` to each row of `input`.
pub fn procedure_stream(
    input: BoxBindingStream,
    procedure: Box<dyn Procedure>,
    ctx: Arc<ExecutionContext>,
) -> BoxBindingStream {
    Box::new(RepeatApplyStream::new(input, ProcedureApply { procedure, ctx }))
}
