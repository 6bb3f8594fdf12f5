//! Query-scoped state shared by compilation and every stage.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::query::config::CompilerConfig;
use crate::query::dataset::{Dataset, Graph, InMemoryDataset};
use crate::query::expr::FunctionRegistry;
use crate::query::procedure::ProcedureRegistry;
use crate::query::service::ServiceExecutor;
use crate::types::{Result, SombraError};

/// Shared, read-only execution context.
///
/// Compilation never mutates a context; switching graphs derives a new one
/// with [`ExecutionContext::with_active_graph`].
#[derive(Clone)]
pub struct ExecutionContext {
    dataset: Arc<dyn Dataset>,
    active_graph: Arc<dyn Graph>,
    config: CompilerConfig,
    functions: Arc<FunctionRegistry>,
    procedures: Arc<ProcedureRegistry>,
    services: Option<Arc<dyn ServiceExecutor>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ExecutionContext {
    /// Context over `dataset` with its default graph active and default registries.
    pub fn new(dataset: Arc<dyn Dataset>) -> Self {
        let active_graph = dataset.default_graph();
        Self {
            dataset,
            active_graph,
            config: CompilerConfig::default(),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            procedures: Arc::new(ProcedureRegistry::new()),
            services: None,
            cancel: None,
        }
    }

    /// Context over an empty dataset.
    pub fn empty() -> Self {
        Self::new(Arc::new(InMemoryDataset::new()))
    }

    /// Replaces the compiler configuration.
    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the function registry.
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Replaces the procedure registry.
    pub fn with_procedures(mut self, procedures: Arc<ProcedureRegistry>) -> Self {
        self.procedures = procedures;
        self
    }

    /// Installs the executor used for SERVICE.
    pub fn with_service_executor(mut self, services: Arc<dyn ServiceExecutor>) -> Self {
        self.services = Some(services);
        self
    }

    /// Installs a cancellation token.
    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Derived context with `graph` active; everything else is shared.
    pub fn with_active_graph(&self, graph: Arc<dyn Graph>) -> Arc<Self> {
        let mut derived = self.clone();
        derived.active_graph = graph;
        Arc::new(derived)
    }

    /// Dataset being queried.
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Graph patterns are matched against.
    pub fn active_graph(&self) -> &Arc<dyn Graph> {
        &self.active_graph
    }

    /// Compiler configuration.
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Function registry used by expression preparation.
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Procedure and property-function registry.
    pub fn procedures(&self) -> &ProcedureRegistry {
        &self.procedures
    }

    /// SERVICE executor, if one is installed.
    pub fn service_executor(&self) -> Option<&Arc<dyn ServiceExecutor>> {
        self.services.as_ref()
    }

    /// Fails with [`SombraError::Cancelled`] once the token is raised.
    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(SombraError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("dataset", &self.dataset)
            .field("config", &self.config)
            .field("services", &self.services.is_some())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
