//! Bounded tool-execution loop over marker-tagged model output
//!
//! What this module provides
//! - Marker parsing (`:::TOOL_CALL:::` … `:::END_TOOL_CALL:::`)
//! - `ToolLoopLayer`: lifts a model service into a loop service that
//!   alternates model calls and tool executions until the model answers in
//!   plain text or the iteration budget runs out
//!
//! Implementation strategy
//! - One tool call per iteration: only the FIRST marker in a response is
//!   honored, which bounds per-turn work
//! - Malformed marker JSON and tool failures abort the loop; the partial text
//!   survives in the outcome, tagged with what went wrong, and is never
//!   silently dropped
//! - Budget exhaustion is a normal terminal status, not an error
//!
//! Testing strategy
//! - Scripted model services with atomic call counters, asserting exact call
//!   counts for the happy path and the always-tool-calling worst case

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::items::{ChatMessage, Usage};
use crate::provider::{ModelRequest, ModelResponse};
use crate::tools::{ToolInvocation, ToolSvc};

pub const TOOL_CALL_OPEN: &str = ":::TOOL_CALL:::";
pub const TOOL_CALL_CLOSE: &str = ":::END_TOOL_CALL:::";

/// Iteration cap applied when none is configured.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// The first delimited tool-call block in `text`, if any. Later markers in
/// the same response are ignored.
pub fn extract_tool_call(text: &str) -> Option<&str> {
    let start = text.find(TOOL_CALL_OPEN)? + TOOL_CALL_OPEN.len();
    let rest = &text[start..];
    let end = rest.find(TOOL_CALL_CLOSE)?;
    Some(&rest[..end])
}

/// Payload inside a marker block.
#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    name: String,
    #[serde(default)]
    args: Value,
}

/// How a loop run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    /// The model answered in plain text.
    Complete,
    /// A marker block did not parse; retrying would not fix it.
    MalformedToolCall(String),
    /// The tool runner reported a failure.
    ToolFailed { name: String, message: String },
    /// The iteration budget ran out while the model kept requesting tools.
    BudgetExhausted,
}

impl LoopStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, LoopStatus::Complete)
    }
}

/// Final summary of a loop run. `text` always carries the best answer seen,
/// partial or not.
#[derive(Debug, Clone)]
pub struct LoopRun {
    pub text: String,
    pub status: LoopStatus,
    /// Completed tool cycles.
    pub iterations: usize,
    /// Successful tool executions.
    pub tool_invocations: usize,
    pub usage: Usage,
}

/// Layer that wraps a model service with the tool loop.
pub struct ToolLoopLayer {
    tools: ToolSvc,
    max_iterations: usize,
}

impl ToolLoopLayer {
    pub fn new(tools: ToolSvc) -> Self {
        Self {
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

pub struct ToolLoop<M> {
    inner: Arc<tokio::sync::Mutex<M>>,
    tools: ToolSvc,
    max_iterations: usize,
}

impl<M> Layer<M> for ToolLoopLayer {
    type Service = ToolLoop<M>;
    fn layer(&self, inner: M) -> Self::Service {
        ToolLoop {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            tools: self.tools.clone(),
            max_iterations: self.max_iterations,
        }
    }
}

async fn invoke_model<M>(
    model: &Arc<tokio::sync::Mutex<M>>,
    req: ModelRequest,
) -> Result<ModelResponse, BoxError>
where
    M: Service<ModelRequest, Response = ModelResponse, Error = BoxError> + Send + 'static,
    M::Future: Send + 'static,
{
    let mut guard = model.lock().await;
    ServiceExt::ready(&mut *guard).await?.call(req).await
}

impl<M> Service<ModelRequest> for ToolLoop<M>
where
    M: Service<ModelRequest, Response = ModelResponse, Error = BoxError> + Send + 'static,
    M::Future: Send + 'static,
{
    type Response = LoopRun;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let model = self.inner.clone();
        let tools = self.tools.clone();
        let max_iterations = self.max_iterations;

        Box::pin(async move {
            let mut usage = Usage::default();
            let mut messages = req.messages.clone();

            let first = invoke_model(&model, req.with_messages(messages.clone())).await?;
            usage.add(first.usage);
            let mut text = first.text;

            let mut iterations = 0usize;
            let mut tool_invocations = 0usize;

            loop {
                let Some(raw) = extract_tool_call(&text) else {
                    return Ok(LoopRun {
                        text,
                        status: LoopStatus::Complete,
                        iterations,
                        tool_invocations,
                        usage,
                    });
                };

                if iterations == max_iterations {
                    warn!(max_iterations, "tool loop budget exhausted");
                    return Ok(LoopRun {
                        text,
                        status: LoopStatus::BudgetExhausted,
                        iterations,
                        tool_invocations,
                        usage,
                    });
                }
                iterations += 1;

                let call: ToolCallPayload = match serde_json::from_str(raw.trim()) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "malformed tool call in model output");
                        return Ok(LoopRun {
                            text,
                            status: LoopStatus::MalformedToolCall(e.to_string()),
                            iterations,
                            tool_invocations,
                            usage,
                        });
                    }
                };

                info!(tool = %call.name, iteration = iterations, "executing tool");
                let invocation = ToolInvocation {
                    id: Uuid::new_v4().to_string(),
                    name: call.name.clone(),
                    arguments: call.args,
                };
                let output = {
                    let mut svc = tools.clone();
                    ServiceExt::ready(&mut svc).await?.call(invocation).await
                };
                let output = match output {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool execution failed");
                        return Ok(LoopRun {
                            text,
                            status: LoopStatus::ToolFailed {
                                name: call.name,
                                message: e.to_string(),
                            },
                            iterations,
                            tool_invocations,
                            usage,
                        });
                    }
                };
                tool_invocations += 1;

                // Extend the context: the assistant turn that asked for the
                // tool, then the tool's raw result, in that order.
                messages.push(ChatMessage::assistant(text.clone()));
                messages.push(ChatMessage::tool_output(
                    call.name,
                    output.result.to_string(),
                ));

                let next = invoke_model(&model, req.with_messages(messages.clone())).await?;
                usage.add(next.usage);
                text = next.text;
            }
        })
    }
}
