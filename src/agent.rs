//! Agent 运行时（组合根）
//!
//! 由 AppConfig 构建状态机、工具注册表、请求路由与编排器，对宿主（CLI 等）暴露：
//! 任务执行（start_agent / 审批 / resume / cancel）、独立工具调用、流式问答、模式切换与撤销。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{AppConfig, BackendKind, LlmSection, ToolsSection};
use crate::core::{
    CapabilityMode, FileModeStore, ModeStore, OrchestratorConfig, Planner, RuntimeError,
    RuntimeState, StateMachine, Task, TaskFailure, TaskOrchestrator,
};
use crate::llm::{
    create_deepseek_client, Backend, ChatOptions, EnvKeyLookup, LlmClient, Message,
    MockLlmClient, OpenAiClient, RequestRouter, RetryPolicy, StaticKeyLookup, DEEPSEEK_CHAT,
    DEEPSEEK_MODELS, OPENAI_GPT_4O, OPENAI_GPT_4O_MINI,
};
use crate::tools::{
    CommandPolicy, CreateFileTool, DeleteFileTool, EditFileTool, ListFilesTool, ReadFileTool,
    RunCommandTool, RunInTerminalTool, SafeFs, SearchFilesTool, ToolContext, ToolExecutor,
    ToolOutcome, ToolRegistry,
};

const ASK_SYSTEM_PROMPT: &str = "You are a coding assistant answering questions about the user's project. \
Answer concisely. You cannot modify files or run commands in this conversation.";

const OPENAI_MODELS: &[&str] = &[OPENAI_GPT_4O, OPENAI_GPT_4O_MINI];

const MOCK_REPLY: &str = "No language model backend is configured. \
Set DEEPSEEK_API_KEY or OPENAI_API_KEY, or add [[llm.backends]] to config/default.toml.";

/// 注册全部内置工具
pub fn build_registry(workspace: &Path, tools: &ToolsSection) -> Result<ToolRegistry, RuntimeError> {
    let fs = SafeFs::new(workspace);
    let policy = CommandPolicy::new(&tools.shell.allowed_commands);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(fs.clone()))?;
    registry.register(ListFilesTool::new(fs.clone()))?;
    registry.register(SearchFilesTool::new(fs.clone(), tools.search.max_results))?;
    registry.register(CreateFileTool::new(fs.clone()))?;
    registry.register(EditFileTool::new(fs.clone()))?;
    registry.register(DeleteFileTool::new(fs))?;
    registry.register(RunCommandTool::new(
        policy.clone(),
        tools.shell.timeout_secs,
        workspace,
    ))?;
    registry.register(RunInTerminalTool::new(policy, workspace))?;
    Ok(registry)
}

/// 按配置注册后端；未配置后端时按环境变量中的 Key 自动选择，都没有则使用 Mock
pub fn build_router(llm: &LlmSection) -> RequestRouter {
    let retry = RetryPolicy {
        max_retries: llm.retry.max_retries,
        base_delay: Duration::from_millis(llm.retry.base_delay_ms),
        max_delay: Duration::from_millis(llm.retry.max_delay_ms),
    };
    let rate_window = Duration::from_secs(llm.rate_window_secs.max(1));

    if llm.backends.is_empty() {
        return autodetect_router(retry, rate_window);
    }

    let mut keys = EnvKeyLookup::new();
    for backend in &llm.backends {
        keys = keys.with_var(&backend.id, &backend.api_key_env);
    }
    let mut router = RequestRouter::new(Arc::new(keys))
        .with_retry(retry)
        .with_rate_window(rate_window);
    for backend in &llm.backends {
        let (client, fallback_model, known_models): (Arc<dyn LlmClient>, &str, &[&str]) =
            match backend.kind {
                BackendKind::DeepSeek => (
                    Arc::new(create_deepseek_client(backend.base_url.as_deref())) as Arc<dyn LlmClient>,
                    DEEPSEEK_CHAT,
                    DEEPSEEK_MODELS,
                ),
                BackendKind::OpenAi => (
                    Arc::new(OpenAiClient::new(backend.base_url.as_deref())) as Arc<dyn LlmClient>,
                    OPENAI_GPT_4O_MINI,
                    OPENAI_MODELS,
                ),
            };
        let default_model = backend
            .default_model
            .clone()
            .or_else(|| backend.models.first().cloned())
            .unwrap_or_else(|| fallback_model.to_string());
        let models: Vec<&str> = if backend.models.is_empty() {
            known_models.to_vec()
        } else {
            backend.models.iter().map(String::as_str).collect()
        };
        router.add_backend(
            Backend::new(&backend.id, default_model, client)
                .with_models(&models)
                .with_token_limit(backend.token_limit),
        );
    }
    if let Some(id) = &llm.default_backend {
        if !router.set_default_backend(id) {
            tracing::warn!(backend = %id, "configured default backend is not registered");
        }
    }
    router
}

fn autodetect_router(retry: RetryPolicy, rate_window: Duration) -> RequestRouter {
    let has_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai = std::env::var("OPENAI_API_KEY").is_ok();
    if !has_deepseek && !has_openai {
        tracing::warn!("No API key set, using Mock LLM");
        let keys = StaticKeyLookup::new().with_key("mock", "mock");
        let mut router = RequestRouter::new(Arc::new(keys)).with_retry(retry);
        router.add_backend(Backend::new(
            "mock",
            "mock",
            Arc::new(MockLlmClient::always(MOCK_REPLY)),
        ));
        return router;
    }

    let keys = EnvKeyLookup::new()
        .with_var("deepseek", "DEEPSEEK_API_KEY")
        .with_var("openai", "OPENAI_API_KEY");
    let mut router = RequestRouter::new(Arc::new(keys))
        .with_retry(retry)
        .with_rate_window(rate_window);
    if has_deepseek {
        tracing::info!("Using DeepSeek backend");
        router.add_backend(
            Backend::new("deepseek", DEEPSEEK_CHAT, Arc::new(create_deepseek_client(None)))
                .with_models(DEEPSEEK_MODELS),
        );
    }
    if has_openai {
        tracing::info!("Using OpenAI backend");
        router.add_backend(
            Backend::new("openai", OPENAI_GPT_4O_MINI, Arc::new(OpenAiClient::new(None)))
                .with_models(OPENAI_MODELS),
        );
    }
    router
}

/// 组装 Agent 的可选项
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub mode: CapabilityMode,
    pub orchestrator: OrchestratorConfig,
    pub tool_timeout: Option<Duration>,
    pub mode_store: Option<Arc<dyn ModeStore>>,
}

pub struct Agent {
    state: Arc<StateMachine>,
    router: Arc<RequestRouter>,
    executor: Arc<ToolExecutor>,
    orchestrator: TaskOrchestrator,
}

impl Agent {
    pub fn new(registry: ToolRegistry, router: RequestRouter, options: AgentOptions) -> Self {
        let state = Arc::new(StateMachine::new(options.mode));
        state.transition(RuntimeState::Ready, "runtime initialized");
        let router = Arc::new(router);
        let executor = Arc::new(
            ToolExecutor::new(Arc::new(registry), state.clone()).with_timeout(options.tool_timeout),
        );
        let mut orchestrator =
            TaskOrchestrator::new(state.clone(), executor.clone(), Planner::new(router.clone()))
                .with_config(options.orchestrator);
        if let Some(store) = options.mode_store {
            orchestrator = orchestrator.with_mode_store(store);
        }
        Self {
            state,
            router,
            executor,
            orchestrator,
        }
    }

    /// 从配置构建；持久化的模式优先于配置中的初始模式
    pub fn from_config(cfg: &AppConfig) -> Result<Self, RuntimeError> {
        let workspace: PathBuf = cfg.app.workspace();
        let store: Arc<dyn ModeStore> = Arc::new(FileModeStore::new(cfg.app.mode_file()));
        let mode = match store.load() {
            Ok(Some(mode)) => mode,
            Ok(None) => cfg.app.mode,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted mode, using config");
                cfg.app.mode
            }
        };
        let registry = build_registry(&workspace, &cfg.tools)?;
        let router = build_router(&cfg.llm);
        tracing::info!(workspace = %workspace.display(), mode = %mode, "agent ready");
        Ok(Self::new(
            registry,
            router,
            AgentOptions {
                mode,
                orchestrator: OrchestratorConfig {
                    inter_step_delay: Duration::from_millis(cfg.agent.inter_step_delay_ms),
                    approval_timeout: cfg.agent.approval_timeout_secs.map(Duration::from_secs),
                },
                tool_timeout: cfg.tools.tool_timeout_secs.map(Duration::from_secs),
                mode_store: Some(store),
            },
        ))
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    pub async fn start_agent(
        &self,
        description: &str,
        mode: CapabilityMode,
    ) -> Result<Task, TaskFailure> {
        self.orchestrator.start_agent(description, mode).await
    }

    pub fn set_mode(&self, mode: CapabilityMode) -> Result<(), RuntimeError> {
        self.orchestrator.set_mode(mode)
    }

    /// 从终态回到 Ready
    pub fn reset(&self) -> bool {
        self.orchestrator.reset()
    }

    /// 独立工具调用：Ready → RunningTool → Completed | Error → Ready
    pub async fn execute_tool(
        &self,
        name: &str,
        params: &Value,
        approved: bool,
    ) -> Result<ToolOutcome, RuntimeError> {
        let ctx = ToolContext::new().approved(approved);
        self.executor.execute(name, params, &ctx).await
    }

    /// 流式问答：Ready → Analyzing → Streaming → Completed → Ready；失败经 Error 回到 Ready
    pub async fn ask<F>(&self, question: &str, on_token: F) -> Result<String, RuntimeError>
    where
        F: FnMut(&str) + Send,
    {
        let current = self.state.state();
        if current != RuntimeState::Ready {
            return Err(RuntimeError::state_guard("ask", current));
        }
        // 检查与迁移之间状态可能被其他调用方改动
        if !self.state.transition(RuntimeState::Analyzing, "question received")
            || !self.state.transition(RuntimeState::Streaming, "streaming answer")
        {
            return Err(RuntimeError::state_guard("ask", self.state.state()));
        }
        let messages = [Message::system(ASK_SYSTEM_PROMPT), Message::user(question)];
        let result = self
            .router
            .stream_chat(&messages, &ChatOptions::default(), on_token)
            .await;
        match result {
            Ok(response) => {
                self.state.transition(RuntimeState::Completed, "answer delivered");
                self.state.transition(RuntimeState::Ready, "ask settled");
                Ok(response.content)
            }
            Err(e) => {
                self.state.transition(RuntimeState::Error, e.to_string());
                self.state.transition(RuntimeState::Ready, "ask settled");
                Err(RuntimeError::Backend(e))
            }
        }
    }

    /// 撤销最近一个可回滚步骤；任务进行中拒绝
    pub async fn undo(&self) -> Result<bool, RuntimeError> {
        let current = self.state.state();
        if self.orchestrator.has_active_task()
            || !(current == RuntimeState::Ready || current.is_terminal())
        {
            return Err(RuntimeError::state_guard("undo", current));
        }
        Ok(self.executor.rollback_last_step().await)
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsSection;
    use crate::core::ErrorKind;
    use crate::llm::LlmError;
    use serde_json::json;
    use std::sync::Mutex;

    fn agent_with(dir: &Path, client: MockLlmClient, mode: CapabilityMode) -> Agent {
        let registry = build_registry(dir, &ToolsSection::default()).unwrap();
        let mut router = RequestRouter::new(Arc::new(StaticKeyLookup::new().with_key("mock", "k")))
            .with_retry(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            });
        router.add_backend(Backend::new("mock", "mock", Arc::new(client)));
        Agent::new(
            registry,
            router,
            AgentOptions {
                mode,
                ..AgentOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_builtin_registry_has_all_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = build_registry(dir.path(), &ToolsSection::default()).unwrap();
        assert_eq!(
            registry.tool_names(),
            vec![
                "createFile", "deleteFile", "editFile", "listFiles", "readFile", "runCommand",
                "runInTerminal", "searchFiles"
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_tool_standalone_and_undo() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(dir.path(), MockLlmClient::new(), CapabilityMode::Edit);
        let outcome = agent
            .execute_tool("createFile", &json!({"path": "n.txt", "content": "x"}), false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(agent.state().state(), RuntimeState::Ready);
        assert!(dir.path().join("n.txt").exists());

        assert!(agent.undo().await.unwrap());
        assert!(!dir.path().join("n.txt").exists());
        assert!(!agent.undo().await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_tool_respects_mode() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(dir.path(), MockLlmClient::new(), CapabilityMode::Ask);
        let err = agent
            .execute_tool("createFile", &json!({"path": "n.txt", "content": "x"}), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert_eq!(agent.state().state(), RuntimeState::Ready);
        assert!(agent.state().last_error().is_some());
    }

    #[tokio::test]
    async fn test_ask_streams_and_walks_states() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            MockLlmClient::new().with_stream(&["Hel", "lo"], None),
            CapabilityMode::Ask,
        );
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        agent.state().subscribe(move |e| {
            let mut s = sink.lock().unwrap();
            if s.last() != Some(&e.state) {
                s.push(e.state);
            }
            Ok(())
        });
        let mut tokens = Vec::new();
        let answer = agent.ask("hi?", |t| tokens.push(t.to_string())).await.unwrap();
        assert_eq!(answer, "Hello");
        assert_eq!(tokens, vec!["Hel", "lo"]);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                RuntimeState::Analyzing,
                RuntimeState::Streaming,
                RuntimeState::Completed,
                RuntimeState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_ask_failure_passes_through_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            MockLlmClient::new().with_failure(LlmError::Auth("denied".into())),
            CapabilityMode::Ask,
        );
        let err = agent.ask("hi?", |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(agent.state().state(), RuntimeState::Ready);
        let history = agent.state().history();
        assert!(history.iter().any(|r| r.to == RuntimeState::Error));
    }

    #[tokio::test]
    async fn test_ask_rejected_outside_ready() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(dir.path(), MockLlmClient::always("hi"), CapabilityMode::Ask);
        agent.state().transition(RuntimeState::RunningTool, "tool");
        let err = agent.ask("hi?", |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateGuard);
        assert_eq!(agent.state().state(), RuntimeState::RunningTool);
    }

    #[tokio::test]
    async fn test_ask_stops_when_state_moves_underneath() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            MockLlmClient::new().with_stream(&["never"], None),
            CapabilityMode::Ask,
        );
        let state = agent.state().clone();
        agent.state().subscribe(move |e| {
            if e.state == RuntimeState::Analyzing {
                state.transition(RuntimeState::Cancelled, "interrupted");
            }
            Ok(())
        });
        let mut tokens = Vec::new();
        let err = agent
            .ask("hi?", |t| tokens.push(t.to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateGuard);
        assert!(tokens.is_empty());
        assert_eq!(agent.state().state(), RuntimeState::Cancelled);
        assert!(!agent
            .state()
            .history()
            .iter()
            .any(|r| r.to == RuntimeState::Streaming));
    }

    #[tokio::test]
    async fn test_from_config_uses_persisted_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.workspace_root = Some(dir.path().to_path_buf());
        FileModeStore::new(cfg.app.mode_file())
            .save(CapabilityMode::Debug)
            .unwrap();
        let agent = Agent::from_config(&cfg).unwrap();
        assert_eq!(agent.state().mode(), CapabilityMode::Debug);

        agent.set_mode(CapabilityMode::Agent).unwrap();
        let reloaded = FileModeStore::new(cfg.app.mode_file()).load().unwrap();
        assert_eq!(reloaded, Some(CapabilityMode::Agent));
    }
}
