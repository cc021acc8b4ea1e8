//! DeepSeek 后端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// DeepSeek 支持的模型，注册后端时声明
pub const DEEPSEEK_MODELS: &[&str] = &[DEEPSEEK_CHAT, DEEPSEEK_REASONER];

/// 创建 DeepSeek 客户端；base_url 为空时使用官方端点
pub fn create_deepseek_client(base_url: Option<&str>) -> OpenAiClient {
    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)))
}
