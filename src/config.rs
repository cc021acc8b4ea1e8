//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__APP__MODE=agent`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::CapabilityMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [app] 段：工作目录、初始模式、模式持久化文件
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    /// 初始能力模式（持久化文件中的值优先）
    pub mode: CapabilityMode,
    /// 模式持久化路径，默认 <workspace>/.hive/mode.json
    pub mode_file: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn mode_file(&self) -> PathBuf {
        self.mode_file
            .clone()
            .unwrap_or_else(|| self.workspace().join(".hive").join("mode.json"))
    }
}

/// [agent] 段：编排节奏与审批等待
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub inter_step_delay_ms: u64,
    /// 未设置时无限等待审批
    pub approval_timeout_secs: Option<u64>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            inter_step_delay_ms: 50,
            approval_timeout_secs: None,
        }
    }
}

/// [llm] 段：后端列表、默认后端、限流窗口、重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 默认后端 id；未设置时取第一个后端
    pub default_backend: Option<String>,
    pub rate_window_secs: u64,
    pub retry: RetrySection,
    pub backends: Vec<BackendSection>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_backend: None,
            rate_window_secs: 60,
            retry: RetrySection::default(),
            backends: Vec::new(),
        }
    }
}

/// [llm.retry] 段：每个后端的尝试次数与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    OpenAi,
    DeepSeek,
}

/// [[llm.backends]]：一个后端
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub id: String,
    #[serde(default)]
    pub kind: BackendKind,
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    pub default_model: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 每个限流窗口的 token 上限；未设置为不限
    pub token_limit: Option<u64>,
}

/// [tools] 段：工具超时、Shell 白名单、搜索上限
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）；未设置不限
    pub tool_timeout_secs: Option<u64>,
    pub shell: ShellSection,
    pub search: SearchSection,
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            timeout_secs: 60,
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "grep", "cat", "head", "tail", "wc", "find", "cargo", "rustc", "git", "mkdir", "mv",
        "echo", "npm", "node", "python3",
    ]
    .map(String::from)
    .to_vec()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub max_results: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self { max_results: 50 }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.mode, CapabilityMode::Ask);
        assert_eq!(cfg.agent.inter_step_delay_ms, 50);
        assert_eq!(cfg.llm.retry.max_retries, 3);
        assert_eq!(cfg.llm.rate_window_secs, 60);
        assert!(cfg.tools.shell.allowed_commands.contains(&"git".to_string()));
        assert_eq!(cfg.app.mode_file(), PathBuf::from("./.hive/mode.json"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[app]
mode = "agent"
workspace_root = "/tmp/ws"

[agent]
approval_timeout_secs = 120

[llm]
default_backend = "ds"

[[llm.backends]]
id = "ds"
kind = "deepseek"
api_key_env = "DEEPSEEK_API_KEY"
token_limit = 100000

[[llm.backends]]
id = "oa"
models = ["gpt-4o", "gpt-4o-mini"]
default_model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.mode, CapabilityMode::Agent);
        assert_eq!(cfg.agent.approval_timeout_secs, Some(120));
        assert_eq!(cfg.agent.inter_step_delay_ms, 50);
        assert_eq!(cfg.llm.backends.len(), 2);
        assert_eq!(cfg.llm.backends[0].kind, BackendKind::DeepSeek);
        assert_eq!(cfg.llm.backends[1].kind, BackendKind::OpenAi);
        assert_eq!(cfg.llm.backends[0].token_limit, Some(100000));
    }
}
