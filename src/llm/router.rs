//! 多后端请求路由
//!
//! 每次调用构造一条回退链：当前默认后端 -> 声明支持该模型的其它后端 -> 提供兼容替代模型的后端
//! （静态兼容表，不做推断）；Unhealthy 的后端排到链尾而不是被剔除。
//! 对链上每个后端：无凭证则跳过，本窗口预算耗尽则跳过（均在调用前判断），否则按
//! RetryPolicy 指数退避 + 随机抖动重试。成功刷新健康度并记账 token；失败更新连续失败数。
//! 整条链失败返回聚合错误，不会对整条链无限重试。
//!
//! 流式：Token 到达即交给调用方；首个 Token 之后断流视为本次调用的终止错误，不会从头重试。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;

use crate::llm::{
    BackendAttempt, BackendHealth, ChatRequest, ChatResponse, Credential, KeyLookup, LlmClient,
    LlmError, Message, RateBudget, TokenUsage,
};

/// 静态模型兼容表：请求的模型 -> 可接受的替代模型（按优先级）
pub const COMPATIBLE_MODELS: &[(&str, &[&str])] = &[
    ("gpt-4o", &["gpt-4o-mini", "deepseek-chat"]),
    ("gpt-4o-mini", &["gpt-4o", "deepseek-chat"]),
    ("deepseek-chat", &["gpt-4o-mini"]),
    ("deepseek-reasoner", &["deepseek-chat", "o3-mini"]),
];

/// 单个后端的重试策略；max_retries 为每个后端的总尝试次数（至少 1 次）
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// delay = min(base * 2^attempt + jitter, max)，jitter ∈ [0, base]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(self.max_delay)
    }

    /// 限流错误带 retry_after 时优先使用（同样受 max_delay 约束）
    fn delay_after(&self, error: &LlmError, attempt: u32) -> Duration {
        match error {
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => Duration::from_millis(*ms).min(self.max_delay),
            _ => self.delay_for(attempt),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// 调用选项；model 为空时使用默认后端的默认模型
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// 一个已注册的后端
pub struct Backend {
    pub id: String,
    pub models: Vec<String>,
    pub default_model: String,
    pub token_limit: Option<u64>,
    client: Arc<dyn LlmClient>,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        default_model: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        let default_model = default_model.into();
        Self {
            id: id.into(),
            models: vec![default_model.clone()],
            default_model,
            token_limit: None,
            client,
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        for model in models {
            if !self.supports(model) {
                self.models.push(model.to_string());
            }
        }
        self
    }

    pub fn with_token_limit(mut self, limit: Option<u64>) -> Self {
        self.token_limit = limit;
        self
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// 回退链中的一项：后端下标与实际使用的模型
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChainEntry {
    backend: usize,
    model: String,
}

struct Ledger {
    health: BackendHealth,
    budget: RateBudget,
}

/// 流式尝试失败的位置
enum StreamFailure {
    /// 尚未交付任何 token，可重试 / 回退
    BeforeFirstToken(LlmError),
    /// 已交付部分内容，本次调用终止
    MidStream { delivered: usize, error: LlmError },
}

pub struct RequestRouter {
    backends: Vec<Backend>,
    default_backend: RwLock<Option<String>>,
    compatibility: HashMap<String, Vec<String>>,
    keys: Arc<dyn KeyLookup>,
    retry: RetryPolicy,
    rate_window: Duration,
    /// 每个后端的健康度 + 预算，按后端 id 在同一把锁内读改写
    ledgers: Mutex<HashMap<String, Ledger>>,
}

impl RequestRouter {
    pub fn new(keys: Arc<dyn KeyLookup>) -> Self {
        Self {
            backends: Vec::new(),
            default_backend: RwLock::new(None),
            compatibility: COMPATIBLE_MODELS
                .iter()
                .map(|(model, subs)| {
                    (
                        model.to_string(),
                        subs.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
            keys,
            retry: RetryPolicy::default(),
            rate_window: Duration::from_secs(60),
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 必须在 add_backend 之前设置，已注册后端的窗口不受影响
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    /// 覆盖某个模型的替代列表
    pub fn with_compatibility(mut self, model: &str, substitutes: &[&str]) -> Self {
        self.compatibility.insert(
            model.to_string(),
            substitutes.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// 注册后端；第一个注册的后端成为默认后端
    pub fn add_backend(&mut self, backend: Backend) {
        self.ledgers().insert(
            backend.id.clone(),
            Ledger {
                health: BackendHealth::new(&backend.id),
                budget: RateBudget::new(backend.token_limit, self.rate_window),
            },
        );
        {
            let mut default = self.default_backend.write().unwrap_or_else(|e| e.into_inner());
            if default.is_none() {
                *default = Some(backend.id.clone());
            }
        }
        tracing::info!(backend = %backend.id, models = ?backend.models, "backend registered");
        self.backends.push(backend);
    }

    pub fn set_default_backend(&self, id: &str) -> bool {
        if !self.backends.iter().any(|b| b.id == id) {
            return false;
        }
        *self.default_backend.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        true
    }

    pub fn default_backend(&self) -> Option<String> {
        self.default_backend
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id.clone()).collect()
    }

    pub fn health(&self, id: &str) -> Option<BackendHealth> {
        self.ledgers().get(id).map(|l| l.health.clone())
    }

    pub fn budget(&self, id: &str) -> Option<RateBudget> {
        self.ledgers().get(id).map(|l| l.budget.clone())
    }

    fn ledgers(&self) -> MutexGuard<'_, HashMap<String, Ledger>> {
        self.ledgers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 回退链（后端 id, 模型），供检查与日志使用
    pub fn fallback_chain(&self, model: Option<&str>) -> Vec<(String, String)> {
        self.build_chain(model)
            .into_iter()
            .map(|e| (self.backends[e.backend].id.clone(), e.model))
            .collect()
    }

    fn build_chain(&self, model: Option<&str>) -> Vec<ChainEntry> {
        let default_idx = self
            .default_backend()
            .and_then(|id| self.backends.iter().position(|b| b.id == id));
        let requested = match (model, default_idx) {
            (Some(m), _) => m.to_string(),
            (None, Some(idx)) => self.backends[idx].default_model.clone(),
            (None, None) => match self.backends.first() {
                Some(b) => b.default_model.clone(),
                None => return Vec::new(),
            },
        };
        let substitutes = self
            .compatibility
            .get(&requested)
            .cloned()
            .unwrap_or_default();

        let mut chain: Vec<ChainEntry> = Vec::new();
        let push = |chain: &mut Vec<ChainEntry>, backend: usize, model: String| {
            if !chain.iter().any(|e| e.backend == backend) {
                chain.push(ChainEntry { backend, model });
            }
        };

        if let Some(idx) = default_idx {
            let backend = &self.backends[idx];
            let model = if backend.supports(&requested) {
                requested.clone()
            } else {
                substitutes
                    .iter()
                    .find(|s| backend.supports(s))
                    .cloned()
                    .unwrap_or_else(|| backend.default_model.clone())
            };
            push(&mut chain, idx, model);
        }
        for (idx, backend) in self.backends.iter().enumerate() {
            if backend.supports(&requested) {
                push(&mut chain, idx, requested.clone());
            }
        }
        for (idx, backend) in self.backends.iter().enumerate() {
            if let Some(sub) = substitutes.iter().find(|s| backend.supports(s)) {
                push(&mut chain, idx, sub.clone());
            }
        }

        // 降低 Unhealthy 后端的优先级（稳定排序，保持其余顺序）
        let ledgers = self.ledgers();
        chain.sort_by_key(|e| {
            ledgers
                .get(&self.backends[e.backend].id)
                .is_some_and(|l| l.health.is_unhealthy())
        });
        chain
    }

    /// 调用前的可用性检查：无凭证 / 预算耗尽都直接跳过
    fn admit(&self, backend: &Backend) -> Result<Credential, String> {
        let Some(credential) = self.keys.lookup(&backend.id) else {
            return Err("skipped: no credential".to_string());
        };
        let exhausted = self
            .ledgers()
            .get_mut(&backend.id)
            .is_some_and(|l| l.budget.is_exhausted());
        if exhausted {
            return Err("skipped: rate budget exhausted".to_string());
        }
        Ok(credential)
    }

    fn record_success(&self, id: &str, tokens: u64) {
        if let Some(ledger) = self.ledgers().get_mut(id) {
            ledger.health.record_success();
            ledger.budget.record(tokens);
        }
    }

    fn record_failure(&self, id: &str, error: &LlmError) {
        if let Some(ledger) = self.ledgers().get_mut(id) {
            ledger.health.record_failure(error.to_string());
            tracing::warn!(
                backend = %id,
                status = ?ledger.health.status,
                consecutive_failures = ledger.health.consecutive_failures,
                error = %error,
                "backend call failed"
            );
        }
    }

    fn request(&self, entry: &ChainEntry, messages: &[Message], options: &ChatOptions) -> ChatRequest {
        ChatRequest {
            model: entry.model.clone(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }

    async fn call_with_retry(
        &self,
        backend: &Backend,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, LlmError> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            match backend.client.chat(request, credential).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.retry.delay_after(&e, attempt);
                    tracing::debug!(backend = %backend.id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// 非流式对话
    pub async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let chain = self.build_chain(options.model.as_deref());
        let mut attempts = Vec::new();
        for entry in &chain {
            let backend = &self.backends[entry.backend];
            let credential = match self.admit(backend) {
                Ok(c) => c,
                Err(reason) => {
                    tracing::debug!(backend = %backend.id, reason = %reason, "backend skipped");
                    attempts.push(BackendAttempt {
                        backend: backend.id.clone(),
                        outcome: reason,
                    });
                    continue;
                }
            };
            let request = self.request(entry, messages, options);
            match self.call_with_retry(backend, &request, &credential).await {
                Ok(mut response) => {
                    if response.usage.total() == 0 {
                        response.usage = TokenUsage::estimate(messages, &response.content);
                    }
                    response.backend = backend.id.clone();
                    self.record_success(&backend.id, response.usage.total());
                    tracing::info!(backend = %backend.id, model = %request.model, tokens = response.usage.total(), "chat ok");
                    return Ok(response);
                }
                Err(e) => {
                    self.record_failure(&backend.id, &e);
                    attempts.push(BackendAttempt {
                        backend: backend.id.clone(),
                        outcome: e.to_string(),
                    });
                }
            }
        }
        Err(LlmError::ChainExhausted { attempts })
    }

    /// 单条 prompt 的便捷调用
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.chat(&[Message::user(prompt)], &ChatOptions::default())
            .await
            .map(|r| r.content)
    }

    async fn stream_once<F>(
        &self,
        backend: &Backend,
        request: &ChatRequest,
        credential: &Credential,
        on_token: &mut F,
    ) -> Result<String, StreamFailure>
    where
        F: FnMut(&str) + Send,
    {
        let mut stream = backend
            .client
            .chat_stream(request, credential)
            .await
            .map_err(StreamFailure::BeforeFirstToken)?;
        let mut content = String::new();
        let mut delivered = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => {
                    delivered += 1;
                    on_token(&token);
                    content.push_str(&token);
                }
                Err(error) if delivered == 0 => return Err(StreamFailure::BeforeFirstToken(error)),
                Err(error) => return Err(StreamFailure::MidStream { delivered, error }),
            }
        }
        Ok(content)
    }

    /// 流式对话：Token 逐个交给 on_token；首个 Token 之前的失败可回退，之后的失败是终止错误
    pub async fn stream_chat<F>(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        mut on_token: F,
    ) -> Result<ChatResponse, LlmError>
    where
        F: FnMut(&str) + Send,
    {
        let chain = self.build_chain(options.model.as_deref());
        let mut attempts = Vec::new();
        'chain: for entry in &chain {
            let backend = &self.backends[entry.backend];
            let credential = match self.admit(backend) {
                Ok(c) => c,
                Err(reason) => {
                    attempts.push(BackendAttempt {
                        backend: backend.id.clone(),
                        outcome: reason,
                    });
                    continue;
                }
            };
            let request = self.request(entry, messages, options);
            let max_attempts = self.retry.attempts();
            let mut attempt = 0;
            loop {
                match self
                    .stream_once(backend, &request, &credential, &mut on_token)
                    .await
                {
                    Ok(content) => {
                        let usage = TokenUsage::estimate(messages, &content);
                        self.record_success(&backend.id, usage.total());
                        return Ok(ChatResponse {
                            content,
                            model: request.model.clone(),
                            backend: backend.id.clone(),
                            usage,
                        });
                    }
                    Err(StreamFailure::MidStream { delivered, error }) => {
                        self.record_failure(&backend.id, &error);
                        return Err(LlmError::StreamInterrupted {
                            backend: backend.id.clone(),
                            delivered,
                            message: error.to_string(),
                        });
                    }
                    Err(StreamFailure::BeforeFirstToken(error)) => {
                        if !error.is_retryable() || attempt + 1 >= max_attempts {
                            self.record_failure(&backend.id, &error);
                            attempts.push(BackendAttempt {
                                backend: backend.id.clone(),
                                outcome: error.to_string(),
                            });
                            continue 'chain;
                        }
                        tokio::time::sleep(self.retry.delay_after(&error, attempt)).await;
                        attempt += 1;
                    }
                }
            }
        }
        Err(LlmError::ChainExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HealthStatus, MockLlmClient, StaticKeyLookup};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn keys(ids: &[&str]) -> Arc<dyn KeyLookup> {
        Arc::new(
            ids.iter()
                .fold(StaticKeyLookup::new(), |k, id| k.with_key(*id, "test-key")),
        )
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(200));
        assert_eq!(policy.delay_for(8), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(63), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_skips_unhealthy_and_exhausted_backends_before_invocation() {
        let a = Arc::new(MockLlmClient::always("from a"));
        let b = Arc::new(MockLlmClient::always("from b"));
        let c = Arc::new(MockLlmClient::always("from c"));
        let mut router = RequestRouter::new(keys(&["a", "b", "c"])).with_retry(fast_retry());
        router.add_backend(Backend::new("a", "gpt-4o", a.clone()));
        router.add_backend(Backend::new("b", "gpt-4o", b.clone()).with_token_limit(Some(10)));
        router.add_backend(Backend::new("c", "gpt-4o", c.clone()));

        for _ in 0..3 {
            router.record_failure("a", &LlmError::Network("down".into()));
        }
        router.record_success("b", 10);
        assert_eq!(router.health("a").unwrap().status, HealthStatus::Unhealthy);

        let response = router
            .chat(&[Message::user("hi")], &ChatOptions::model("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(response.backend, "c");
        assert_eq!(response.content, "from c");
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 0);
        assert_eq!(c.calls(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_still_in_chain_but_last() {
        let mut router = RequestRouter::new(keys(&["a", "b"]));
        router.add_backend(Backend::new("a", "gpt-4o", Arc::new(MockLlmClient::new())));
        router.add_backend(Backend::new("b", "gpt-4o", Arc::new(MockLlmClient::new())));
        for _ in 0..3 {
            router.record_failure("a", &LlmError::Network("down".into()));
        }
        let chain: Vec<String> = router
            .fallback_chain(Some("gpt-4o"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(chain, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_backend_without_credential_is_skipped() {
        let a = Arc::new(MockLlmClient::always("a"));
        let b = Arc::new(MockLlmClient::always("b"));
        let mut router = RequestRouter::new(keys(&["b"]));
        router.add_backend(Backend::new("a", "m", a.clone()));
        router.add_backend(Backend::new("b", "m", b.clone()));
        let response = router.chat(&[Message::user("x")], &ChatOptions::default()).await.unwrap();
        assert_eq!(response.backend, "b");
        assert_eq!(a.calls(), 0);
        // 缺少凭证不算失败
        assert_eq!(router.health("a").unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_retry_then_success_resets_health() {
        let a = Arc::new(
            MockLlmClient::new()
                .with_failure(LlmError::Network("blip".into()))
                .with_reply("ok"),
        );
        let mut router = RequestRouter::new(keys(&["a"])).with_retry(fast_retry());
        router.add_backend(Backend::new("a", "m", a.clone()));
        let response = router.complete("hello").await.unwrap();
        assert_eq!(response, "ok");
        assert_eq!(a.calls(), 2);
        let health = router.health("a").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(router.budget("a").unwrap().used > 0);
    }

    #[tokio::test]
    async fn test_chain_exhausted_after_bounded_attempts() {
        let a = Arc::new(MockLlmClient::new());
        let b = Arc::new(MockLlmClient::new());
        let mut router = RequestRouter::new(keys(&["a", "b"])).with_retry(fast_retry());
        router.add_backend(Backend::new("a", "m", a.clone()));
        router.add_backend(Backend::new("b", "m", b.clone()));

        let err = router.complete("x").await.unwrap_err();
        assert!(matches!(err, LlmError::ChainExhausted { ref attempts } if attempts.len() == 2));
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 2);
        assert_eq!(router.health("a").unwrap().status, HealthStatus::Degraded);

        router.complete("x").await.unwrap_err();
        router.complete("x").await.unwrap_err();
        assert_eq!(router.health("a").unwrap().status, HealthStatus::Unhealthy);
        assert_eq!(router.health("a").unwrap().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_moves_to_next_backend_immediately() {
        let a = Arc::new(MockLlmClient::new().with_failure(LlmError::Auth("bad key".into())));
        let b = Arc::new(MockLlmClient::always("b"));
        let mut router = RequestRouter::new(keys(&["a", "b"])).with_retry(fast_retry());
        router.add_backend(Backend::new("a", "m", a.clone()));
        router.add_backend(Backend::new("b", "m", b.clone()));
        assert_eq!(router.complete("x").await.unwrap(), "b");
        assert_eq!(a.calls(), 1);
    }

    #[test]
    fn test_chain_order_default_then_supporting_then_substitutes() {
        let mut router = RequestRouter::new(keys(&[]));
        router.add_backend(Backend::new("openai", "gpt-4o", Arc::new(MockLlmClient::new())));
        router.add_backend(
            Backend::new("deepseek", "deepseek-chat", Arc::new(MockLlmClient::new())),
        );
        router.add_backend(
            Backend::new("proxy", "gpt-4o-mini", Arc::new(MockLlmClient::new()))
                .with_models(&["gpt-4o"]),
        );
        assert!(router.set_default_backend("deepseek"));
        assert!(!router.set_default_backend("nope"));

        let chain = router.fallback_chain(Some("gpt-4o"));
        assert_eq!(
            chain,
            vec![
                ("deepseek".to_string(), "deepseek-chat".to_string()),
                ("openai".to_string(), "gpt-4o".to_string()),
                ("proxy".to_string(), "gpt-4o".to_string()),
            ]
        );
    }

    #[test]
    fn test_backend_without_model_or_substitute_is_not_in_chain() {
        let mut router = RequestRouter::new(keys(&[]));
        router.add_backend(Backend::new("openai", "gpt-4o", Arc::new(MockLlmClient::new())));
        router.add_backend(Backend::new("local", "llama3", Arc::new(MockLlmClient::new())));
        let ids: Vec<String> = router
            .fallback_chain(Some("gpt-4o"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["openai".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_delivers_tokens_incrementally() {
        let a = Arc::new(MockLlmClient::new().with_stream(&["Hel", "lo", "!"], None));
        let mut router = RequestRouter::new(keys(&["a"]));
        router.add_backend(Backend::new("a", "m", a));
        let mut seen = Vec::new();
        let response = router
            .stream_chat(&[Message::user("x")], &ChatOptions::default(), |t| {
                seen.push(t.to_string())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["Hel", "lo", "!"]);
        assert_eq!(response.content, "Hello!");
    }

    #[tokio::test]
    async fn test_stream_interruption_is_terminal() {
        let a = Arc::new(MockLlmClient::new().with_stream(&["part", "ial", "never"], Some(2)));
        let b = Arc::new(MockLlmClient::always("fallback"));
        let mut router = RequestRouter::new(keys(&["a", "b"])).with_retry(fast_retry());
        router.add_backend(Backend::new("a", "m", a.clone()));
        router.add_backend(Backend::new("b", "m", b.clone()));
        let mut seen = String::new();
        let err = router
            .stream_chat(&[Message::user("x")], &ChatOptions::default(), |t| {
                seen.push_str(t)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::StreamInterrupted { delivered: 2, .. }));
        assert_eq!(seen, "partial");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_before_first_token_falls_back() {
        let a = Arc::new(MockLlmClient::new().with_stream(&[], Some(0)));
        let b = Arc::new(MockLlmClient::new().with_stream(&["ok"], None));
        let mut router = RequestRouter::new(keys(&["a", "b"])).with_retry(RetryPolicy {
            max_retries: 1,
            ..fast_retry()
        });
        router.add_backend(Backend::new("a", "m", a.clone()));
        router.add_backend(Backend::new("b", "m", b.clone()));
        let response = router
            .stream_chat(&[Message::user("x")], &ChatOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(response.backend, "b");
        assert_eq!(response.content, "ok");
        assert_eq!(router.health("a").unwrap().status, HealthStatus::Degraded);
    }
}
