//! LLM 后端抽象
//!
//! 每个后端实现 LlmClient：chat（非流式）与 chat_stream（Token 流）。
//! 凭证由 Router 经 KeyLookup 在每次调用时注入；Credential 的 Debug 输出不含原始 Key。

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;

use crate::llm::Message;

/// 回退链中某个后端的尝试结果（用于聚合错误）
#[derive(Clone, Debug, Serialize)]
pub struct BackendAttempt {
    pub backend: String,
    pub outcome: String,
}

fn summarize(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no backend configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.backend, a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 回退链全部失败（或全部被跳过）
    #[error("All backends in fallback chain failed: {}", summarize(.attempts))]
    ChainExhausted { attempts: Vec<BackendAttempt> },

    /// 流式输出中途断开；已交付的部分不会重发
    #[error("Stream from {backend} interrupted after {delivered} tokens: {message}")]
    StreamInterrupted {
        backend: String,
        delivered: usize,
        message: String,
    },
}

impl LlmError {
    /// 认证失败与请求本身不合法时重试无意义
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Auth(_) | LlmError::InvalidResponse(_))
    }

    /// 按错误文本归类（后端 SDK 的错误多为字符串）
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            LlmError::RateLimited {
                retry_after_ms: None,
            }
        } else if lower.contains("401") || lower.contains("invalid api key") || lower.contains("unauthorized") {
            LlmError::Auth(msg)
        } else if lower.contains("connection") || lower.contains("timed out") || lower.contains("network") {
            LlmError::Network(msg)
        } else {
            LlmError::Api(msg)
        }
    }
}

/// API Key 包装：Debug / 日志中永远是 `Credential(***)`
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// 注入式凭证查找；返回 None 表示该后端不可用（不是错误）
pub trait KeyLookup: Send + Sync {
    fn lookup(&self, backend_id: &str) -> Option<Credential>;
}

/// 从环境变量读取：backend id -> 环境变量名
#[derive(Debug, Default, Clone)]
pub struct EnvKeyLookup {
    vars: HashMap<String, String>,
}

impl EnvKeyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, backend_id: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.vars.insert(backend_id.into(), env_var.into());
        self
    }
}

impl KeyLookup for EnvKeyLookup {
    fn lookup(&self, backend_id: &str) -> Option<Credential> {
        let var = self.vars.get(backend_id)?;
        std::env::var(var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Credential::new)
    }
}

/// 固定表（测试 / 本地后端）
#[derive(Debug, Default, Clone)]
pub struct StaticKeyLookup {
    keys: HashMap<String, Credential>,
}

impl StaticKeyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, backend_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys.insert(backend_id.into(), Credential::new(key));
        self
    }
}

impl KeyLookup for StaticKeyLookup {
    fn lookup(&self, backend_id: &str) -> Option<Credential> {
        self.keys.get(backend_id).cloned()
    }
}

/// Token 使用量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// 后端未返回用量时按 4 字符 ≈ 1 token 估算
    pub fn estimate(messages: &[Message], completion: &str) -> Self {
        let prompt_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        Self {
            prompt_tokens: prompt_chars.div_ceil(4) as u64,
            completion_tokens: completion.chars().count().div_ceil(4) as u64,
        }
    }
}

/// 发给单个后端的请求
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// 后端回复；backend 由 Router 填写
#[derive(Clone, Debug, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub backend: String,
    pub usage: TokenUsage,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 后端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn chat(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, LlmError>;

    /// 流式完成，返回 Token 流
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<TokenStream, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("sk-secret-123");
        let printed = format!("{cred:?}");
        assert!(!printed.contains("sk-secret"));
        assert_eq!(cred.expose(), "sk-secret-123");
    }

    #[test]
    fn test_classify_error_messages() {
        assert!(matches!(
            LlmError::from_message("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(LlmError::from_message("401 Unauthorized"), LlmError::Auth(_)));
        assert!(!LlmError::from_message("401 Unauthorized").is_retryable());
        assert!(matches!(
            LlmError::from_message("connection reset by peer"),
            LlmError::Network(_)
        ));
    }

    #[test]
    fn test_chain_exhausted_lists_attempts() {
        let err = LlmError::ChainExhausted {
            attempts: vec![
                BackendAttempt {
                    backend: "a".into(),
                    outcome: "skipped: no credential".into(),
                },
                BackendAttempt {
                    backend: "b".into(),
                    outcome: "Network error: down".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("a: skipped"));
        assert!(text.contains("b: Network error"));
    }

    #[test]
    fn test_static_key_lookup() {
        let keys = StaticKeyLookup::new().with_key("openai", "k");
        assert!(keys.lookup("openai").is_some());
        assert!(keys.lookup("deepseek").is_none());
    }

    #[test]
    fn test_usage_estimate() {
        let usage = TokenUsage::estimate(&[Message::user("12345678")], "1234");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total(), 3);
    }
}
