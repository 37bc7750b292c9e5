//! The inference façade
//!
//! What this module provides
//! - `InferenceService`: one object composing the balancer, monitor, cache,
//!   retry/timeout layers, providers, and the tool loop
//!
//! Exports
//! - Models
//!   - `GenerateOptions`, `GenerateOutcome`
//! - Utils
//!   - `InferenceServiceBuilder`
//!
//! Implementation strategy
//! - Built once at process start and passed to callers explicitly; the only
//!   state it holds across calls is references to its components
//! - Provider dispatch is an exhaustive match over the `Provider` enum;
//!   unintegrated vendors fail fast instead of silently falling back
//! - Every completed call feeds the monitor, whose recommendations inform
//!   later balancer pools
//!
//! Testing strategy
//! - Scripted providers injected through the builder; no network in tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tower::{Layer, Service, ServiceBuilder, ServiceExt};
use tracing::{info, info_span, Instrument};

use crate::balancer::{ModelLoadBalancer, Priority};
use crate::cache::{ChunkStream, StreamingCache};
use crate::config::InferenceConfig;
use crate::error::{InferenceError, Result};
use crate::items::{transcript, ChatMessage, Usage};
use crate::monitor::{MetricEvent, PerformanceMonitor, Recommendation};
use crate::provider::{
    GeminiProvider, ModelRequest, ModelSvc, OpenAiCompatProvider, Provider, StreamingModel,
};
use crate::resilience::{RetryLayer, RetryPolicy, TimeoutLayer};
use crate::tool_loop::{LoopStatus, ToolLoopLayer};
use crate::tools::{ToolDef, ToolRouter, ToolSvc};

/// Per-call knobs. `Default` targets the default provider with tool support
/// enabled.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub provider: Provider,
    pub priority: Priority,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Whether marker-tagged tool calls in the reply should drive the loop.
    pub use_tools: bool,
    /// Per-attempt deadline override.
    pub timeout: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            provider: Provider::Gemini,
            priority: Priority::Balanced,
            temperature: None,
            max_tokens: None,
            use_tools: true,
            timeout: None,
        }
    }
}

impl GenerateOptions {
    pub fn provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn without_tools(mut self) -> Self {
        self.use_tools = false;
        self
    }
}

/// What a generation produced. `status` distinguishes a full answer from a
/// partial one; `annotated_text` renders the user-visible form.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub status: LoopStatus,
    pub model_id: String,
    pub iterations: usize,
    pub tool_invocations: usize,
    pub usage: Usage,
}

impl GenerateOutcome {
    /// The response text with the incompleteness note appended when the loop
    /// did not finish cleanly.
    pub fn annotated_text(&self) -> String {
        match &self.status {
            LoopStatus::Complete => self.text.clone(),
            LoopStatus::MalformedToolCall(_) | LoopStatus::ToolFailed { .. } => {
                format!("{}\n\n[Error: Tool execution failed]", self.text)
            }
            LoopStatus::BudgetExhausted => {
                format!("{}\n\n[System: Max tool iterations reached]", self.text)
            }
        }
    }
}

/// Composes routing, resilience, caching, monitoring, and the tool loop
/// behind one `generate_response` call.
///
/// Construct exactly one per process via [`InferenceServiceBuilder`] and pass
/// it to callers; it is `Send + Sync` and cheap to share behind an `Arc`.
pub struct InferenceService {
    balancer: Arc<ModelLoadBalancer>,
    monitor: Arc<PerformanceMonitor>,
    cache: Arc<StreamingCache>,
    providers: HashMap<Provider, ModelSvc>,
    streamers: HashMap<Provider, Arc<dyn StreamingModel>>,
    tools: ToolSvc,
    retry: RetryPolicy,
    api_timeout: Duration,
    max_tool_iterations: usize,
}

impl InferenceService {
    pub fn builder(config: InferenceConfig) -> InferenceServiceBuilder {
        InferenceServiceBuilder {
            config,
            providers: HashMap::new(),
            streamers: HashMap::new(),
            tools: Vec::new(),
        }
    }

    pub fn balancer(&self) -> &ModelLoadBalancer {
        &self.balancer
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn cache(&self) -> &StreamingCache {
        &self.cache
    }

    /// Routing recommendations derived from the samples recorded so far.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.monitor.recommendations()
    }

    fn model_service(&self, provider: Provider) -> Result<ModelSvc> {
        match provider {
            Provider::Anthropic => Err(InferenceError::ProviderNotIntegrated { provider }),
            Provider::Gemini | Provider::OpenAi | Provider::Groq | Provider::DeepSeek => self
                .providers
                .get(&provider)
                .cloned()
                .ok_or_else(|| InferenceError::Auth {
                    message: format!("{provider} API key not configured"),
                }),
        }
    }

    fn streaming_model(&self, provider: Provider) -> Result<Arc<dyn StreamingModel>> {
        match provider {
            Provider::Anthropic => Err(InferenceError::ProviderNotIntegrated { provider }),
            Provider::Gemini | Provider::OpenAi | Provider::Groq | Provider::DeepSeek => self
                .streamers
                .get(&provider)
                .cloned()
                .ok_or_else(|| InferenceError::Auth {
                    message: format!("{provider} API key not configured"),
                }),
        }
    }

    /// Generate a reply for `conversation`.
    ///
    /// Leases a model slot for the duration of the call, runs the provider
    /// under timeout + retry, drives the tool loop when the reply asks for
    /// one, and records a metric sample once the call completes.
    pub async fn generate_response(
        &self,
        conversation: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<GenerateOutcome> {
        let lease = self.balancer.select(options.priority);
        let model_id = lease.model_id().to_string();
        let span = info_span!("generate", provider = %options.provider, model = %model_id);

        async {
            let base = self.model_service(options.provider)?;
            let timeout = options.timeout.unwrap_or(self.api_timeout);
            let stack = ServiceBuilder::new()
                .layer(RetryLayer::new(self.retry))
                .layer(TimeoutLayer::new(timeout))
                .service(base);

            let req = ModelRequest {
                messages: conversation.to_vec(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            };
            let started = Instant::now();

            let outcome = if options.use_tools {
                let mut svc = ToolLoopLayer::new(self.tools.clone())
                    .max_iterations(self.max_tool_iterations)
                    .layer(stack);
                let run = ServiceExt::ready(&mut svc)
                    .await
                    .map_err(InferenceError::from_boxed)?
                    .call(req)
                    .await
                    .map_err(InferenceError::from_boxed)?;
                GenerateOutcome {
                    text: run.text,
                    status: run.status,
                    model_id: model_id.clone(),
                    iterations: run.iterations,
                    tool_invocations: run.tool_invocations,
                    usage: run.usage,
                }
            } else {
                let mut svc = stack;
                let resp = ServiceExt::ready(&mut svc)
                    .await
                    .map_err(InferenceError::from_boxed)?
                    .call(req)
                    .await
                    .map_err(InferenceError::from_boxed)?;
                GenerateOutcome {
                    text: resp.text,
                    status: LoopStatus::Complete,
                    model_id: model_id.clone(),
                    iterations: 0,
                    tool_invocations: 0,
                    usage: resp.usage,
                }
            };

            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.monitor.record(MetricEvent {
                model: Some(model_id.clone()),
                latency_ms,
                token_count: outcome.usage.completion_tokens as u64,
            });
            info!(
                latency_ms,
                iterations = outcome.iterations,
                tools = outcome.tool_invocations,
                "generation complete"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
        // `lease` drops here on every path, returning the slot.
    }

    /// Streaming variant routed through the cache: an identical prompt that
    /// already streamed to completion replays without touching the provider.
    pub async fn stream_response(
        &self,
        conversation: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<ChunkStream> {
        let streamer = self.streaming_model(options.provider)?;
        let prompt = transcript(conversation);
        let req = ModelRequest {
            messages: conversation.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        let balancer = self.balancer.clone();
        let priority = options.priority;

        self.cache
            .get_or_stream(&prompt, move || async move {
                let lease = balancer.select(priority);
                let stream = streamer.stream(req).await?;
                // The slot stays leased until the stream is dropped.
                Ok(Box::pin(stream.inspect(move |_| {
                    let _ = &lease;
                })) as ChunkStream)
            })
            .await
    }
}

/// Assembles an [`InferenceService`] from config plus injected overrides.
pub struct InferenceServiceBuilder {
    config: InferenceConfig,
    providers: HashMap<Provider, ModelSvc>,
    streamers: HashMap<Provider, Arc<dyn StreamingModel>>,
    tools: Vec<ToolDef>,
}

impl InferenceServiceBuilder {
    /// Inject (or override) the non-streaming service for a provider. Used
    /// in tests to swap in scripted models.
    pub fn provider(mut self, provider: Provider, svc: ModelSvc) -> Self {
        self.providers.insert(provider, svc);
        self
    }

    /// Inject (or override) the streaming source for a provider.
    pub fn streamer(mut self, provider: Provider, streamer: Arc<dyn StreamingModel>) -> Self {
        self.streamers.insert(provider, streamer);
        self
    }

    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn build(self) -> InferenceService {
        let cfg = self.config;
        let mut providers = self.providers;
        let mut streamers = self.streamers;

        if let Some(key) = &cfg.keys.gemini_api_key {
            let gemini = GeminiProvider::new(key.clone());
            providers
                .entry(Provider::Gemini)
                .or_insert_with(|| tower::util::BoxCloneSyncService::new(gemini.clone()));
            streamers
                .entry(Provider::Gemini)
                .or_insert_with(|| Arc::new(gemini));
        }
        if let Some(key) = &cfg.keys.openai_api_key {
            let openai = OpenAiCompatProvider::openai(key.clone());
            providers
                .entry(Provider::OpenAi)
                .or_insert_with(|| tower::util::BoxCloneSyncService::new(openai.clone()));
            streamers
                .entry(Provider::OpenAi)
                .or_insert_with(|| Arc::new(openai));
        }
        if let Some(key) = &cfg.keys.groq_api_key {
            let groq = OpenAiCompatProvider::groq(key.clone());
            providers
                .entry(Provider::Groq)
                .or_insert_with(|| tower::util::BoxCloneSyncService::new(groq.clone()));
            streamers
                .entry(Provider::Groq)
                .or_insert_with(|| Arc::new(groq));
        }
        if let Some(key) = &cfg.keys.deepseek_api_key {
            let deepseek = OpenAiCompatProvider::deepseek(key.clone());
            providers
                .entry(Provider::DeepSeek)
                .or_insert_with(|| tower::util::BoxCloneSyncService::new(deepseek.clone()));
            streamers
                .entry(Provider::DeepSeek)
                .or_insert_with(|| Arc::new(deepseek));
        }

        InferenceService {
            balancer: Arc::new(ModelLoadBalancer::new(cfg.pool)),
            monitor: Arc::new(PerformanceMonitor::new(cfg.switch_rules)),
            cache: Arc::new(StreamingCache::new(cfg.cache)),
            providers,
            streamers,
            tools: ToolRouter::new(self.tools).into_service(),
            retry: cfg.retry.policy(),
            api_timeout: cfg.api_timeout,
            max_tool_iterations: cfg.max_tool_iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted_model;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service_with_script(script: Vec<String>) -> (InferenceService, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = InferenceService::builder(InferenceConfig::default())
            .provider(Provider::Gemini, scripted_model(script, calls.clone()))
            .build();
        (svc, calls)
    }

    fn conversation() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hello there")]
    }

    #[tokio::test]
    async fn anthropic_fails_fast_as_not_integrated() {
        let (svc, calls) = service_with_script(vec!["unused".into()]);
        let err = svc
            .generate_response(
                &conversation(),
                GenerateOptions::default().provider(Provider::Anthropic),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ProviderNotIntegrated {
                provider: Provider::Anthropic
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unconfigured_provider_is_a_permanent_error() {
        let (svc, _) = service_with_script(vec!["unused".into()]);
        let err = svc
            .generate_response(
                &conversation(),
                GenerateOptions::default().provider(Provider::Groq),
            )
            .await
            .unwrap_err();
        match err {
            InferenceError::Auth { message } => assert!(message.contains("not configured")),
            other => panic!("expected Auth, got {other}"),
        }
    }

    #[tokio::test]
    async fn plain_reply_records_a_metric_sample() {
        let (svc, calls) = service_with_script(vec!["plain answer".into()]);
        let out = svc
            .generate_response(&conversation(), GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out.text, "plain answer");
        assert_eq!(out.status, LoopStatus::Complete);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = svc.monitor().snapshot();
        let samples: usize = snap.values().map(|v| v.len()).sum();
        assert_eq!(samples, 1);
    }

    #[tokio::test]
    async fn capacity_returns_after_each_call() {
        let (svc, _) = service_with_script(vec!["a".into(), "b".into(), "c".into()]);
        let free_before: Vec<u32> = ["llama3.2:3b", "llama3.2:1b", "deepseek-r1:8b"]
            .iter()
            .map(|m| svc.balancer().free_capacity(m).unwrap())
            .collect();
        for _ in 0..3 {
            svc.generate_response(&conversation(), GenerateOptions::default())
                .await
                .unwrap();
        }
        let free_after: Vec<u32> = ["llama3.2:3b", "llama3.2:1b", "deepseek-r1:8b"]
            .iter()
            .map(|m| svc.balancer().free_capacity(m).unwrap())
            .collect();
        assert_eq!(free_before, free_after);
    }

    #[test]
    fn annotated_text_marks_partial_results() {
        let base = GenerateOutcome {
            text: "partial".into(),
            status: LoopStatus::BudgetExhausted,
            model_id: "m".into(),
            iterations: 5,
            tool_invocations: 5,
            usage: Usage::default(),
        };
        assert_eq!(
            base.annotated_text(),
            "partial\n\n[System: Max tool iterations reached]"
        );

        let failed = GenerateOutcome {
            status: LoopStatus::ToolFailed {
                name: "search".into(),
                message: "down".into(),
            },
            ..base.clone()
        };
        assert_eq!(
            failed.annotated_text(),
            "partial\n\n[Error: Tool execution failed]"
        );

        let complete = GenerateOutcome {
            status: LoopStatus::Complete,
            ..base
        };
        assert_eq!(complete.annotated_text(), "partial");
    }
}
