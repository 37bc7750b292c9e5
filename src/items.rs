//! Messages, roles, usage accounting, and stream chunks
//!
//! This module defines the core data structures exchanged between the
//! façade, providers, and the tool loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation.
///
/// Conversations are ordered `Vec<ChatMessage>`; insertion order is the
/// conversation order and is used verbatim as model context. Messages are
/// never mutated after being appended; each turn produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on tool-output messages only; identifies which tool produced it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_name: None,
            timestamp: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_name: None,
            timestamp: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_name: None,
            timestamp: None,
        }
    }

    /// Synthetic message carrying a tool's raw result back into the context.
    pub fn tool_output(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_name: Some(tool_name.into()),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

/// Render a conversation as a stable transcript, one `role: content` line per
/// message. Used as the normalized text behind streaming-cache keys.
pub fn transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(role);
        if let Some(name) = &m.tool_name {
            out.push('(');
            out.push_str(name);
            out.push(')');
        }
        out.push_str(": ");
        out.push_str(m.content.trim());
        out.push('\n');
    }
    out
}

/// Token accounting for a single model call or an aggregated run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Streaming response items.
///
/// Completion is signalled by a distinct terminal marker rather than a flag
/// on the last content chunk, so consumers can tell a finished stream from a
/// truncated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamChunk {
    Token(String),
    Done,
}

impl StreamChunk {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamChunk::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_order_preserving() {
        let msgs = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::tool_output("search_web", "{\"hits\":0}"),
        ];
        let t = transcript(&msgs);
        assert_eq!(
            t,
            "system: be brief\nuser: hi\nassistant: hello\ntool(search_web): {\"hits\":0}\n"
        );
    }

    #[test]
    fn transcript_trims_message_content() {
        let a = transcript(&[ChatMessage::user("  hi  ")]);
        let b = transcript(&[ChatMessage::user("hi")]);
        assert_eq!(a, b);
    }

    #[test]
    fn usage_accumulates() {
        let mut u = Usage::default();
        u.add(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        u.add(Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
        });
        assert_eq!(u.prompt_tokens, 13);
        assert_eq!(u.completion_tokens, 7);
        assert_eq!(u.total(), 20);
    }
}
