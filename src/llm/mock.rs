//! Mock LLM 后端（用于测试与无 API Key 的本地运行）
//!
//! 按脚本顺序返回回复 / 失败 / 流；脚本耗尽后返回 fallback 回复（未设置则报错）。
//! 记录调用次数与最后一次请求，便于断言路由行为。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChatRequest, ChatResponse, Credential, LlmClient, LlmError, TokenStream, TokenUsage};

/// 脚本中的一条
#[derive(Debug)]
pub enum MockReply {
    Text(String),
    Fail(LlmError),
    /// 逐个下发 tokens；fail_after 为 Some(n) 时在第 n 个 token 之后断流
    Stream {
        tokens: Vec<String>,
        fail_after: Option<usize>,
    },
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽后始终返回该文本
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()))
    }

    pub fn with_failure(self, error: LlmError) -> Self {
        self.push(MockReply::Fail(error))
    }

    pub fn with_stream(self, tokens: &[&str], fail_after: Option<usize>) -> Self {
        self.push(MockReply::Stream {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            fail_after,
        })
    }

    fn push(self, reply: MockReply) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
        self
    }

    /// 被调用次数（chat + chat_stream）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next(&self, request: &ChatRequest) -> Option<MockReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request.clone());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| self.fallback.clone().map(MockReply::Text))
    }
}

fn respond(request: &ChatRequest, content: String) -> ChatResponse {
    ChatResponse {
        usage: TokenUsage::estimate(&request.messages, &content),
        content,
        model: request.model.clone(),
        backend: String::new(),
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        _credential: &Credential,
    ) -> Result<ChatResponse, LlmError> {
        match self.next(request) {
            Some(MockReply::Text(text)) => Ok(respond(request, text)),
            Some(MockReply::Stream { tokens, .. }) => Ok(respond(request, tokens.concat())),
            Some(MockReply::Fail(e)) => Err(e),
            None => Err(LlmError::Api("mock script exhausted".to_string())),
        }
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        _credential: &Credential,
    ) -> Result<TokenStream, LlmError> {
        let (tokens, fail_after) = match self.next(request) {
            Some(MockReply::Text(text)) => (
                text.split_inclusive(' ').map(String::from).collect::<Vec<_>>(),
                None,
            ),
            Some(MockReply::Stream { tokens, fail_after }) => (tokens, fail_after),
            Some(MockReply::Fail(e)) => return Err(e),
            None => return Err(LlmError::Api("mock script exhausted".to_string())),
        };
        let mut items: Vec<Result<String, LlmError>> = match fail_after {
            Some(n) => tokens.into_iter().take(n).map(Ok).collect(),
            None => tokens.into_iter().map(Ok).collect(),
        };
        if fail_after.is_some() {
            items.push(Err(LlmError::Network("connection reset".to_string())));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}
