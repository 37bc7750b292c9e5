//! Tool definitions and name-based routing
//!
//! Tools are Tower services taking a `ToolInvocation` and returning a
//! `ToolOutput`. The runner that actually executes side effects (web search,
//! code sandboxes, …) lives outside this crate; here a tool is whatever
//! service the caller injects.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String, // same as invocation.id
    pub result: Value,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneSyncService<ToolInvocation, ToolOutput, BoxError>;

/// Definition of a tool: name, description, parameter schema, and the
/// service implementing it.
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters_schema: Value,
    pub service: ToolSvc,
}

impl ToolDef {
    /// Create a tool definition from a handler that takes JSON args and
    /// returns JSON.
    pub fn from_handler(
        name: &'static str,
        description: &'static str,
        parameters_schema: Value,
        handler: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>,
    ) -> Self {
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            async move {
                if inv.name != name {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", name, inv.name)
                            .into(),
                    );
                }
                let out = (handler)(inv.arguments).await?;
                Ok(ToolOutput {
                    id: inv.id,
                    result: out,
                })
            }
        });
        Self {
            name,
            description,
            parameters_schema,
            service: BoxCloneSyncService::new(svc),
        }
    }
}

/// DX sugar: create a tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn tool_typed<A, H, Fut, R>(
    name: &'static str,
    description: &'static str,
    handler: H,
) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: serde::Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let params_value = serde_json::to_value(schema.schema).expect("schema to value");
    let handler = Arc::new(handler);
    let erased: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync> =
        Arc::new(move |raw: Value| {
            let h = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(raw)?;
                let out: R = (h.as_ref())(args).await?;
                Ok(serde_json::to_value(out)?)
            })
        });
    ToolDef::from_handler(name, description, params_value, erased)
}

/// Router service over tools using a name → index table. Index 0 is the
/// unknown-tool fallback, which errors.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: HashMap<&'static str, usize>,
    services: Vec<ToolSvc>,
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> Self {
        let unknown = BoxCloneSyncService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>(format!("unknown tool: {}", inv.name).into())
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut name_to_index: HashMap<&'static str, usize> = HashMap::new();
        for (i, td) in tools.into_iter().enumerate() {
            name_to_index.insert(td.name, i + 1);
            services.push(td.service);
        }
        Self {
            name_to_index,
            services,
        }
    }

    /// Erase the router into the common tool-service shape.
    pub fn into_service(self) -> ToolSvc {
        BoxCloneSyncService::new(self)
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness is checked per selected service inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);
        // Safe: index 0 is always present (unknown fallback)
        let svc: &mut ToolSvc = &mut self.services[idx];
        let fut = svc.call(req);
        Box::pin(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    fn echo_tool() -> ToolDef {
        tool_typed("echo", "Echo the input back", |args: EchoArgs| async move {
            Ok::<_, BoxError>(json!({ "echoed": args.text }))
        })
    }

    #[tokio::test]
    async fn router_dispatches_by_name() {
        let mut router = ToolRouter::new(vec![echo_tool()]);
        let out = ServiceExt::ready(&mut router)
            .await
            .unwrap()
            .call(ToolInvocation {
                id: "call_1".into(),
                name: "echo".into(),
                arguments: json!({"text": "hi"}),
            })
            .await
            .unwrap();
        assert_eq!(out.id, "call_1");
        assert_eq!(out.result, json!({"echoed": "hi"}));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let mut router = ToolRouter::new(vec![echo_tool()]);
        let err = ServiceExt::ready(&mut router)
            .await
            .unwrap()
            .call(ToolInvocation {
                id: "call_2".into(),
                name: "missing".into(),
                arguments: json!({}),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn typed_tool_rejects_malformed_args() {
        let mut router = ToolRouter::new(vec![echo_tool()]);
        let err = ServiceExt::ready(&mut router)
            .await
            .unwrap()
            .call(ToolInvocation {
                id: "call_3".into(),
                name: "echo".into(),
                arguments: json!({"wrong_field": 1}),
            })
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
