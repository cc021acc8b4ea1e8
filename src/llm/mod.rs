//! LLM 层：后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、健康度与预算、多后端请求路由

pub mod deepseek;
pub mod health;
pub mod message;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_MODELS, DEEPSEEK_REASONER};
pub use health::{BackendHealth, HealthStatus, RateBudget};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, MockReply};
pub use openai::{OpenAiClient, OPENAI_GPT_4O, OPENAI_GPT_4O_MINI};
pub use router::{Backend, ChatOptions, RequestRouter, RetryPolicy, COMPATIBLE_MODELS};
pub use traits::{
    BackendAttempt, ChatRequest, ChatResponse, Credential, EnvKeyLookup, KeyLookup, LlmClient,
    LlmError, StaticKeyLookup, TokenStream, TokenUsage,
};
