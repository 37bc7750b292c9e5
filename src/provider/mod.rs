//! Model provider abstraction
//!
//! What this module provides
//! - An interface for language-model endpoints decoupled from routing and
//!   loop logic, plus scripted doubles for tests
//!
//! Exports
//! - Models
//!   - `ModelRequest { messages, temperature, max_tokens }`
//!   - `ModelResponse { text, usage }`
//!   - `Provider`: the closed set of dispatchable vendors
//! - Services
//!   - `ModelService: Service<ModelRequest, Response=ModelResponse, Error=BoxError>`
//!   - Implementations: `GeminiProvider`, `OpenAiCompatProvider`, scripted doubles
//! - Traits
//!   - `StreamingModel` for chunked responses with a distinct completion marker
//!
//! Composition
//! - The façade wraps a provider in timeout + retry layers and, when tools
//!   are enabled, hands the stack to the tool loop
//!
//! Testing strategy
//! - `scripted_model`/`ScriptedStreamer` return canned responses and count
//!   invocations, so loop and cache behavior is testable without a network

mod gemini;
mod openai;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};

use crate::cache::ChunkStream;
use crate::error::InferenceError;
use crate::items::{ChatMessage, StreamChunk, Usage};

pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatProvider;

/// One outbound model call: ordered context plus sampling parameters.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Same sampling parameters, different context.
    pub fn with_messages(&self, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// A completed (non-streaming) model reply.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Usage,
}

/// Service contract every provider implements.
pub trait ModelService:
    Service<ModelRequest, Response = ModelResponse, Error = BoxError>
{
}
impl<T> ModelService for T where
    T: Service<ModelRequest, Response = ModelResponse, Error = BoxError>
{
}

/// Boxed provider service.
pub type ModelSvc = BoxCloneSyncService<ModelRequest, ModelResponse, BoxError>;

/// Chunked responses; the stream ends with `StreamChunk::Done` so completion
/// is distinguishable from content.
#[async_trait]
pub trait StreamingModel: Send + Sync {
    async fn stream(&self, req: ModelRequest) -> Result<ChunkStream, InferenceError>;
}

/// The vendors this crate knows about. Dispatch is an exhaustive match, so
/// adding a variant is a compile-time-checked extension; there is no string
/// branch to fall through silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Groq,
    DeepSeek,
    Anthropic,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::DeepSeek => "deepseek",
            Provider::Anthropic => "anthropic",
        };
        f.write_str(name)
    }
}

/// A provider double that pops scripted replies in order and counts calls.
pub fn scripted_model(script: Vec<String>, calls: Arc<AtomicUsize>) -> ModelSvc {
    let script = Arc::new(Mutex::new(script.into_iter().collect::<VecDeque<_>>()));
    BoxCloneSyncService::new(tower::service_fn(move |_req: ModelRequest| {
        let script = script.clone();
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let next = script.lock().expect("script lock").pop_front();
            match next {
                Some(text) => Ok(ModelResponse {
                    text,
                    usage: Usage {
                        prompt_tokens: 8,
                        completion_tokens: 4,
                    },
                }),
                None => Err::<ModelResponse, BoxError>(Box::new(InferenceError::Protocol(
                    "scripted provider exhausted".into(),
                ))),
            }
        }
    }))
}

/// Streaming double: every call yields the same chunk sequence.
pub struct ScriptedStreamer {
    chunks: Vec<StreamChunk>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedStreamer {
    pub fn new(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl StreamingModel for ScriptedStreamer {
    async fn stream(&self, _req: ModelRequest) -> Result<ChunkStream, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures::stream::iter(self.chunks.clone())))
    }
}
