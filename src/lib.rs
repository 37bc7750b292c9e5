//! # tower-inference
//!
//! A Tower-based routing and resilience core for LLM backends: model
//! selection under capacity hints, retry with backoff, streaming-response
//! caching, performance monitoring, and a bounded tool-execution loop,
//! composed behind one façade.
//!
//! ## Core Concepts
//!
//! - **Providers**: Tower services that turn a role-tagged conversation into
//!   a model reply; vendor APIs stay behind this seam
//! - **Layers**: retry, timeout, and the tool loop are Tower middleware
//!   wrapped around a provider at call time
//! - **Static DI**: the façade is built once from config and passed to
//!   callers: no global singletons, no runtime lookups
//!
//! ## Getting Started
//!
//! Set the API key for your provider (e.g. `GEMINI_API_KEY`) in the
//! environment.
//!
//! ```rust,no_run
//! use tower_inference::{
//!     ChatMessage, GenerateOptions, InferenceConfig, InferenceService, tool_typed,
//! };
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct SearchArgs {
//!     query: String,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let search = tool_typed("search_web", "Search the web", |args: SearchArgs| async move {
//!     Ok(serde_json::json!({ "results": [args.query] }))
//! });
//!
//! let service = InferenceService::builder(InferenceConfig::from_env())
//!     .tool(search)
//!     .build();
//!
//! let conversation = vec![
//!     ChatMessage::system("You are a helpful assistant"),
//!     ChatMessage::user("What's new in Rust?"),
//! ];
//! let outcome = service
//!     .generate_response(&conversation, GenerateOptions::default())
//!     .await?;
//! println!("{}", outcome.annotated_text());
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod items;
pub mod monitor;
pub mod provider;
pub mod resilience;
pub mod service;
pub mod tool_loop;
pub mod tools;

pub use balancer::{ModelDescriptor, ModelLease, ModelLoadBalancer, Priority};
pub use cache::{cache_key, CacheConfig, ChunkStream, StreamingCache};
pub use config::{InferenceConfig, ProviderKeys, RetryConfig};
pub use error::{ErrorClass, InferenceError, Result};
pub use items::{transcript, ChatMessage, Role, StreamChunk, Usage};
pub use monitor::{
    MetricEvent, MetricSample, PerformanceMonitor, Recommendation, RecommendedAction, SwitchRule,
};
pub use provider::{
    GeminiProvider, ModelRequest, ModelResponse, ModelService, ModelSvc, OpenAiCompatProvider,
    Provider, StreamingModel,
};
pub use resilience::{execute, Backoff, RetryLayer, RetryPolicy, TimeoutLayer};
pub use service::{GenerateOptions, GenerateOutcome, InferenceService, InferenceServiceBuilder};
pub use tool_loop::{
    extract_tool_call, LoopRun, LoopStatus, ToolLoop, ToolLoopLayer, DEFAULT_MAX_ITERATIONS,
    TOOL_CALL_CLOSE, TOOL_CALL_OPEN,
};
pub use tools::{tool_typed, ToolDef, ToolInvocation, ToolOutput, ToolRouter, ToolSvc};

// Re-export the Tower traits callers need to drive services directly.
pub use tower::{Layer, Service, ServiceExt};
