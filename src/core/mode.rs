//! 能力模式：限制任务可调用的工具与副作用
//!
//! 六个固定模式（ask / edit / debug / design / agent / terminal），每个模式投影为一个
//! 不可变的 ModePolicy（允许的工具名集合 + 允许的副作用集合，或 All）。
//! 模式由调用方在任务开始前选定，任务进行中不可切换；当前模式可经 ModeStore 持久化。

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::tools::names;

/// 工具的副作用标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectTag {
    /// 只读（读文件、列目录、搜索）
    Read,
    /// 修改工作区文件
    Write,
    /// 执行外部命令
    Execute,
}

impl EffectTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectTag::Read => "read",
            EffectTag::Write => "write",
            EffectTag::Execute => "execute",
        }
    }
}

impl fmt::Display for EffectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 允许集合：全部，或显式列举
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowance<T: Ord> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> Allowance<T> {
    pub fn permits<Q>(&self, item: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self {
            Allowance::All => true,
            Allowance::Only(set) => set.contains(item),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Allowance::All)
    }
}

impl<T: Ord + fmt::Display> Allowance<T> {
    /// 用于 prompt / 日志的可读列表；All 输出 "all"
    pub fn describe(&self) -> Vec<String> {
        match self {
            Allowance::All => vec!["all".to_string()],
            Allowance::Only(set) => set.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// 某个模式对应的不可变策略描述
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModePolicy {
    pub tools: Allowance<String>,
    pub effects: Allowance<EffectTag>,
}

impl ModePolicy {
    fn only(tools: &[&str], effects: &[EffectTag]) -> Self {
        Self {
            tools: Allowance::Only(tools.iter().map(|t| t.to_string()).collect()),
            effects: Allowance::Only(effects.iter().copied().collect()),
        }
    }

    /// 工具名与副作用都被允许时才放行
    pub fn permits(&self, tool: &str, effect: EffectTag) -> bool {
        self.tools.permits(tool) && self.effects.permits(&effect)
    }
}

/// 六个固定能力模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMode {
    /// 只读问答
    #[default]
    Ask,
    /// 完整编辑
    Edit,
    /// 调试：读 + 运行命令
    Debug,
    /// 仅设计：读 + 新建文档
    Design,
    /// 自主智能体：唯一允许自动执行多步计划的模式
    Agent,
    /// 仅终端
    Terminal,
}

impl CapabilityMode {
    pub const ALL: [CapabilityMode; 6] = [
        CapabilityMode::Ask,
        CapabilityMode::Edit,
        CapabilityMode::Debug,
        CapabilityMode::Design,
        CapabilityMode::Agent,
        CapabilityMode::Terminal,
    ];

    pub fn policy(&self) -> ModePolicy {
        const READ_TOOLS: [&str; 3] = [names::READ_FILE, names::LIST_FILES, names::SEARCH_FILES];
        match self {
            CapabilityMode::Ask => ModePolicy::only(&READ_TOOLS, &[EffectTag::Read]),
            CapabilityMode::Edit => ModePolicy::only(
                &[
                    names::READ_FILE,
                    names::LIST_FILES,
                    names::SEARCH_FILES,
                    names::CREATE_FILE,
                    names::EDIT_FILE,
                    names::DELETE_FILE,
                ],
                &[EffectTag::Read, EffectTag::Write],
            ),
            CapabilityMode::Debug => ModePolicy::only(
                &[
                    names::READ_FILE,
                    names::LIST_FILES,
                    names::SEARCH_FILES,
                    names::RUN_COMMAND,
                ],
                &[EffectTag::Read, EffectTag::Execute],
            ),
            CapabilityMode::Design => ModePolicy::only(
                &[
                    names::READ_FILE,
                    names::LIST_FILES,
                    names::SEARCH_FILES,
                    names::CREATE_FILE,
                ],
                &[EffectTag::Read, EffectTag::Write],
            ),
            CapabilityMode::Agent => ModePolicy {
                tools: Allowance::All,
                effects: Allowance::All,
            },
            CapabilityMode::Terminal => ModePolicy::only(
                &[names::RUN_COMMAND, names::RUN_IN_TERMINAL],
                &[EffectTag::Execute],
            ),
        }
    }

    /// 是否允许自动执行由规划生成的多步计划
    pub fn can_auto_execute(&self) -> bool {
        matches!(self, CapabilityMode::Agent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityMode::Ask => "ask",
            CapabilityMode::Edit => "edit",
            CapabilityMode::Debug => "debug",
            CapabilityMode::Design => "design",
            CapabilityMode::Agent => "agent",
            CapabilityMode::Terminal => "terminal",
        }
    }
}

impl fmt::Display for CapabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ask" | "read-only" | "readonly" => Ok(CapabilityMode::Ask),
            "edit" | "full-edit" => Ok(CapabilityMode::Edit),
            "debug" => Ok(CapabilityMode::Debug),
            "design" | "design-only" => Ok(CapabilityMode::Design),
            "agent" | "autonomous" => Ok(CapabilityMode::Agent),
            "terminal" | "terminal-only" => Ok(CapabilityMode::Terminal),
            other => Err(format!("Unknown capability mode: {other}")),
        }
    }
}

/// 当前模式的持久化（由外部协作者持有；核心只在启动时读、在显式切换时写）
pub trait ModeStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<CapabilityMode>>;
    fn save(&self, mode: CapabilityMode) -> anyhow::Result<()>;
}

/// 单文件 JSON 持久化
#[derive(Debug)]
pub struct FileModeStore {
    path: PathBuf,
}

impl FileModeStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedMode {
    mode: CapabilityMode,
}

impl ModeStore for FileModeStore {
    /// 文件不存在时返回 None
    fn load(&self) -> anyhow::Result<Option<CapabilityMode>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let persisted: PersistedMode = serde_json::from_str(&data)?;
        Ok(Some(persisted.mode))
    }

    fn save(&self, mode: CapabilityMode) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&PersistedMode { mode })?,
        )?;
        Ok(())
    }
}

/// 内存实现（测试 / 不需要跨进程保存时）
#[derive(Debug, Default)]
pub struct InMemoryModeStore {
    mode: Mutex<Option<CapabilityMode>>,
}

impl ModeStore for InMemoryModeStore {
    fn load(&self) -> anyhow::Result<Option<CapabilityMode>> {
        Ok(*self
            .mode
            .lock()
            .map_err(|_| anyhow::anyhow!("mode store poisoned"))?)
    }

    fn save(&self, mode: CapabilityMode) -> anyhow::Result<()> {
        *self
            .mode
            .lock()
            .map_err(|_| anyhow::anyhow!("mode store poisoned"))? = Some(mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_mode_is_read_only() {
        let policy = CapabilityMode::Ask.policy();
        assert!(policy.permits(names::READ_FILE, EffectTag::Read));
        assert!(!policy.permits(names::CREATE_FILE, EffectTag::Write));
        assert!(!policy.permits(names::RUN_COMMAND, EffectTag::Execute));
    }

    #[test]
    fn test_effect_gate_applies_even_when_tool_listed() {
        // 工具名在列表中但副作用不被允许时同样拒绝
        let policy = CapabilityMode::Ask.policy();
        assert!(!policy.permits(names::READ_FILE, EffectTag::Write));
    }

    #[test]
    fn test_agent_mode_allows_everything() {
        let policy = CapabilityMode::Agent.policy();
        assert!(policy.tools.is_all());
        assert!(policy.permits("anything", EffectTag::Execute));
        assert!(CapabilityMode::Agent.can_auto_execute());
        assert!(CapabilityMode::ALL
            .iter()
            .filter(|m| m.can_auto_execute())
            .eq([CapabilityMode::Agent].iter()));
    }

    #[test]
    fn test_terminal_mode() {
        let policy = CapabilityMode::Terminal.policy();
        assert!(policy.permits(names::RUN_IN_TERMINAL, EffectTag::Execute));
        assert!(!policy.permits(names::READ_FILE, EffectTag::Read));
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("read-only".parse::<CapabilityMode>().unwrap(), CapabilityMode::Ask);
        assert_eq!("Full-Edit".parse::<CapabilityMode>().unwrap(), CapabilityMode::Edit);
        assert_eq!("agent".parse::<CapabilityMode>().unwrap(), CapabilityMode::Agent);
        assert!("root".parse::<CapabilityMode>().is_err());
    }

    #[test]
    fn test_file_mode_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModeStore::new(dir.path().join("nested/mode.json"));
        assert_eq!(store.load().unwrap(), None);
        store.save(CapabilityMode::Debug).unwrap();
        assert_eq!(store.load().unwrap(), Some(CapabilityMode::Debug));
    }
}
