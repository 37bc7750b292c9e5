//! OpenAI-compatible chat-completions adapter
//!
//! One adapter covers OpenAI itself and the vendors that speak its wire
//! format (Groq, DeepSeek) through an API-base override. Tool outputs travel
//! as tagged user turns, same as the Gemini flow, so the marker-based tool
//! protocol stays provider-neutral.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tower::{BoxError, Service};
use tracing::debug;

use crate::cache::ChunkStream;
use crate::error::InferenceError;
use crate::items::{ChatMessage, Role, StreamChunk, Usage};
use crate::provider::{ModelRequest, ModelResponse, StreamingModel};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiCompatProvider {
    fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::with_config(config)),
            model: model.into(),
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::with_config(
            OpenAIConfig::new().with_api_key(api_key),
            "gpt-4o",
        )
    }

    pub fn groq(api_key: impl Into<String>) -> Self {
        Self::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(GROQ_BASE_URL),
            "llama-3.1-8b-instant",
        )
    }

    pub fn deepseek(api_key: impl Into<String>) -> Self {
        Self::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(DEEPSEEK_BASE_URL),
            "deepseek-chat",
        )
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, InferenceError> {
        let messages = to_openai_messages(&req.messages)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if let Some(t) = req.temperature {
            builder.temperature(t);
        }
        if let Some(mt) = req.max_tokens {
            builder.max_tokens(mt);
        }
        let request = builder
            .build()
            .map_err(|e| InferenceError::Protocol(format!("request build error: {e}")))?;

        debug!(model = %self.model, turns = req.messages.len(), "calling chat completions");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| InferenceError::Protocol("no choices in response".into()))?;

        let usage = response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ModelResponse { text, usage })
    }
}

fn to_openai_messages(
    messages: &[ChatMessage],
) -> Result<Vec<ChatCompletionRequestMessage>, InferenceError> {
    let build_err = |e: OpenAIError| InferenceError::Protocol(format!("message build error: {e}"));
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let msg: ChatCompletionRequestMessage = match m.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.as_str())
                .build()
                .map_err(build_err)?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.as_str())
                .build()
                .map_err(build_err)?
                .into(),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(m.content.as_str())
                .build()
                .map_err(build_err)?
                .into(),
            Role::Tool => {
                let tool = m.tool_name.as_deref().unwrap_or("tool");
                ChatCompletionRequestUserMessageArgs::default()
                    .content(format!("TOOL_OUTPUT ({}): {}", tool, m.content))
                    .build()
                    .map_err(build_err)?
                    .into()
            }
        };
        out.push(msg);
    }
    Ok(out)
}

fn map_openai_error(err: OpenAIError) -> InferenceError {
    match err {
        OpenAIError::ApiError(api) => {
            let message = api.message.clone();
            let lowered = message.to_lowercase();
            if lowered.contains("api key") || lowered.contains("401") || lowered.contains("403") {
                return InferenceError::Auth { message };
            }
            if lowered.contains("rate limit") || lowered.contains("too many requests") {
                return InferenceError::RateLimited { message };
            }
            match api.r#type.as_deref() {
                Some("invalid_request_error") => InferenceError::Protocol(message),
                Some("insufficient_quota") => InferenceError::RateLimited { message },
                _ => InferenceError::Internal(message),
            }
        }
        OpenAIError::Reqwest(e) => InferenceError::Transport {
            message: e.to_string(),
        },
        OpenAIError::JSONDeserialize(e) => InferenceError::Protocol(e.to_string()),
        other => InferenceError::Internal(other.to_string()),
    }
}

impl Service<ModelRequest> for OpenAiCompatProvider {
    type Response = ModelResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.generate(req).await.map_err(|e| Box::new(e) as BoxError) })
    }
}

#[async_trait]
impl StreamingModel for OpenAiCompatProvider {
    async fn stream(&self, req: ModelRequest) -> Result<ChunkStream, InferenceError> {
        let resp = self.generate(req).await?;
        Ok(Box::pin(futures::stream::iter(vec![
            StreamChunk::Token(resp.text),
            StreamChunk::Done,
        ])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_map_onto_chat_variants() {
        let msgs = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let out = to_openai_messages(&msgs).unwrap();
        assert!(matches!(out[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(out[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(out[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn tool_output_is_a_tagged_user_turn() {
        let out = to_openai_messages(&[ChatMessage::tool_output("echo", "{}")]).unwrap();
        assert!(matches!(out[0], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn api_key_errors_classify_as_auth() {
        let err = map_openai_error(OpenAIError::ApiError(async_openai::error::ApiError {
            message: "Incorrect API key provided".into(),
            r#type: Some("invalid_request_error".into()),
            param: None,
            code: None,
        }));
        assert!(matches!(err, InferenceError::Auth { .. }));
    }
}
