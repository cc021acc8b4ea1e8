//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；凭证在每次调用时由 Router 注入，
//! 因此客户端本身不持有 Key。支持非流式与真正的增量流式输出。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{
    ChatRequest, ChatResponse, Credential, LlmClient, LlmError, Message, Role, TokenStream,
    TokenUsage,
};

pub const OPENAI_GPT_4O: &str = "gpt-4o";
pub const OPENAI_GPT_4O_MINI: &str = "gpt-4o-mini";

/// OpenAI 兼容客户端：持有 base_url，按调用构造带 Key 的 Client
#[derive(Debug, Clone, Default)]
pub struct OpenAiClient {
    base_url: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url.map(String::from),
        }
    }

    fn client(&self, credential: &Credential) -> Client<OpenAIConfig> {
        let config = OpenAIConfig::new().with_api_key(credential.expose());
        let config = match &self.base_url {
            Some(url) => config.with_api_base(url),
            None => config,
        };
        Client::with_config(config)
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidResponse(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }

    fn build_request(
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model)
            .messages(Self::to_openai_messages(&request.messages)?);
        if let Some(t) = request.temperature {
            args.temperature(t);
        }
        if let Some(max) = request.max_tokens {
            args.max_completion_tokens(max);
        }
        if stream {
            args.stream(true);
        }
        args.build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, LlmError> {
        let body = Self::build_request(request, false)?;
        let response = self
            .client(credential)
            .chat()
            .create(body)
            .await
            .map_err(|e| LlmError::from_message(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

        Ok(ChatResponse {
            content,
            model: response.model,
            backend: String::new(),
            usage,
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<TokenStream, LlmError> {
        let body = Self::build_request(request, true)?;
        let stream = self
            .client(credential)
            .chat()
            .create_stream(body)
            .await
            .map_err(|e| LlmError::from_message(e.to_string()))?;

        let tokens = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|t| !t.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(LlmError::from_message(e.to_string()))),
            }
        });
        Ok(Box::pin(tokens))
    }
}
