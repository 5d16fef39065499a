//! Function call dispatch.
//!
//! Takes a model-selected function call, resolves it against the registry,
//! validates and defaults the arguments against the declared parameter
//! schema, then invokes the plugin. Synchronous invocations return their
//! value directly; deferred ones are handed to the executor under a
//! pre-allocated job id and the caller gets the id back immediately.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::instrument;
use uuid::Uuid;

use crate::error::ToolError;
use crate::executor::JobExecutor;
use crate::registry::{FunctionSpec, InvokeContext, Invocation, Registry};
use crate::session::SessionManager;

/// A function call as selected by the conversation engine.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub call_id: Uuid,
    pub session_id: Uuid,
    pub function_name: String,
    pub arguments: Map<String, Value>,
}

impl FunctionCall {
    pub fn new(session_id: Uuid, function_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            session_id,
            function_name: function_name.into(),
            arguments,
        }
    }
}

#[derive(Debug)]
pub enum DispatchResult {
    /// The function completed synchronously.
    Immediate(Value),
    /// A background job was started; results arrive as gateway events.
    Deferred { job_id: Uuid },
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    executor: Arc<JobExecutor>,
    sessions: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        executor: Arc<JobExecutor>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            registry,
            executor,
            sessions,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve, validate and invoke. Never waits for a deferred job to make
    /// progress; the conversation stays responsive while jobs run.
    #[instrument(skip(self, call), fields(function = %call.function_name, call_id = %call.call_id))]
    pub async fn dispatch(&self, call: FunctionCall) -> Result<DispatchResult, ToolError> {
        self.sessions.get(call.session_id)?;

        let (plugin, spec) = self
            .registry
            .resolve(&call.function_name)
            .ok_or_else(|| ToolError::UnknownFunction(call.function_name.clone()))?;

        let arguments = validate_arguments(spec, call.arguments)?;

        let job_id = Uuid::new_v4();
        let ctx = InvokeContext {
            session_id: call.session_id,
            call_id: call.call_id,
            job_id,
            sessions: self.sessions.clone(),
        };

        match plugin.invoke(&ctx, &call.function_name, arguments).await? {
            Invocation::Immediate(value) => Ok(DispatchResult::Immediate(value)),
            Invocation::Deferred(job) => {
                self.executor
                    .submit(job_id, call.session_id, call.call_id, job);
                Ok(DispatchResult::Deferred { job_id })
            }
        }
    }
}

/// Check provided arguments against the parameter schema and fill in
/// defaults. Every rejection names the offending parameter.
fn validate_arguments(
    spec: &FunctionSpec,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, ToolError> {
    for key in provided.keys() {
        if !spec.params.iter().any(|p| p.name == key) {
            return Err(ToolError::invalid_argument(
                key.clone(),
                format!("not a parameter of '{}'", spec.name),
            ));
        }
    }

    let mut validated = Map::new();
    for param in &spec.params {
        match provided.remove(param.name) {
            Some(value) => {
                if !param.param_type.matches(&value) {
                    return Err(ToolError::invalid_argument(
                        param.name,
                        format!("expected {}", param.param_type.as_str()),
                    ));
                }
                if let Some(ref one_of) = param.one_of {
                    let s = value.as_str().unwrap_or_default();
                    if !one_of.iter().any(|v| *v == s) {
                        return Err(ToolError::invalid_argument(
                            param.name,
                            format!("must be one of {}", one_of.join(", ")),
                        ));
                    }
                }
                validated.insert(param.name.to_string(), value);
            }
            None if param.required => {
                return Err(ToolError::invalid_argument(param.name, "missing required parameter"));
            }
            None => {
                if let Some(ref default) = param.default {
                    validated.insert(param.name.to_string(), default.clone());
                }
            }
        }
    }
    Ok(validated)
}
