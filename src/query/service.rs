//! SERVICE evaluation: per-row sub-queries sent to an endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::query::algebra::{Op, TermPattern};
use crate::query::binding::Binding;
use crate::query::compiler::compile_with_input;
use crate::query::context::ExecutionContext;
use crate::query::dataset::Dataset;
use crate::query::repeat::{RepeatApply, RepeatApplyStream};
use crate::query::stream::{collect_bindings, singleton, BoxBindingStream, VecBindingStream};
use crate::query::term::Term;
use crate::types::{Result, SombraError};

/// Evaluates a sub-plan at an endpoint for one input binding.
pub trait ServiceExecutor: fmt::Debug + Send + Sync {
    /// Rows of `op` at `endpoint`, each compatible with and extending `binding`.
    fn execute(
        &self,
        endpoint: &Term,
        op: &Arc<Op>,
        binding: &Binding,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<BoxBindingStream>;
}

/// Endpoints served from in-process datasets.
#[derive(Debug, Default, Clone)]
pub struct LocalServiceExecutor {
    endpoints: BTreeMap<String, Arc<dyn Dataset>>,
}

impl LocalServiceExecutor {
    /// No endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `dataset` at the IRI `endpoint`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, dataset: Arc<dyn Dataset>) -> Self {
        self.endpoints.insert(endpoint.into(), dataset);
        self
    }
}

impl ServiceExecutor for LocalServiceExecutor {
    fn execute(
        &self,
        endpoint: &Term,
        op: &Arc<Op>,
        binding: &Binding,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<BoxBindingStream> {
        let Term::Iri(iri) = endpoint else {
            return Err(SombraError::Service {
                endpoint: endpoint.to_string(),
                message: "endpoint is not an IRI".into(),
            });
        };
        let dataset = self.endpoints.get(iri).ok_or_else(|| SombraError::Service {
            endpoint: iri.clone(),
            message: "unknown endpoint".into(),
        })?;
        let remote = ExecutionContext::new(Arc::clone(dataset))
            .with_config(ctx.config().clone())
            .with_functions(Arc::clone(ctx.functions()));
        let remote = Arc::new(remote);
        compile_with_input(op, singleton(binding.clone()), &remote)
    }
}

struct ServiceApply {
    endpoint: TermPattern,
    sub_op: Arc<Op>,
    silent: bool,
    ctx: Arc<ExecutionContext>,
}

impl ServiceApply {
    fn evaluate(&self, binding: &Binding) -> Result<BoxBindingStream> {
        let endpoint = self.endpoint.resolve(binding).ok_or_else(|| SombraError::Service {
            endpoint: self.endpoint.to_string(),
            message: "endpoint variable is unbound".into(),
        })?;
        if !self.ctx.config().service_enabled {
            return Err(SombraError::Service {
                endpoint: endpoint.to_string(),
                message: "service evaluation is disabled".into(),
            });
        }
        let executor = self.ctx.service_executor().ok_or_else(|| SombraError::Service {
            endpoint: endpoint.to_string(),
            message: "no service executor configured".into(),
        })?;
        let mut stream = executor.execute(endpoint, &self.sub_op, binding, &self.ctx)?;
        if !self.silent {
            return Ok(stream);
        }
        let rows = collect_bindings(stream.as_mut(), &self.ctx)?;
        Ok(Box::new(VecBindingStream::new(rows)))
    }
}

impl RepeatApply for ServiceApply {
    fn apply(&mut self, binding: &Binding) -> Result<BoxBindingStream> {
        match self.evaluate(binding) {
            Ok(stream) => Ok(stream),
            Err(SombraError::Cancelled) => Err(SombraError::Cancelled),
            Err(err) if self.silent => {
                warn!(error = %err, "SERVICE SILENT failure; passing input row through");
                Ok(singleton(binding.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

/// Wraps `input` with the SERVICE stage.
///
/// With `silent`, any failure for a row yields that row once, unextended;
/// remote rows are buffered per input row so late failures are also caught.
pub fn service_stream(
    input: BoxBindingStream,
    endpoint: TermPattern,
    sub_op: Arc<Op>,
    silent: bool,
    ctx: Arc<ExecutionContext>,
) -> BoxBindingStream {
    Box::new(RepeatApplyStream::new(
        input,
        ServiceApply {
            endpoint,
            sub_op,
            silent,
            ctx,
        },
    ))
}
