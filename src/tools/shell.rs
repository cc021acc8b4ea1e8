//! Shell 工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串，
//! 也不接受管道、串接、重定向与命令替换，整条命令只能是一个白名单程序调用。
//! runCommand 阻塞执行（带超时、可取消），对少数命令推导逆命令用于回滚；
//! runInTerminal 只负责派发，立即返回 pid。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::EffectTag;
use crate::tools::names;
use crate::tools::{Tool, ToolContext, ToolDefinition};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// sh -c 下能串接或替换出其他命令的字符
const SHELL_METACHARS: &[char] = &['&', '|', ';', '>', '<', '`', '$', '\n', '\r'];

/// 命令白名单与危险子串检查，两个 shell 工具共用
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed_commands: HashSet<String>,
}

impl CommandPolicy {
    pub fn new(allowed_commands: &[String]) -> Self {
        Self {
            allowed_commands: allowed_commands.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn check(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {forbidden}"));
            }
        }
        if let Some(c) = raw.chars().find(|c| SHELL_METACHARS.contains(c)) {
            return Err(format!("Shell operator {c:?} not allowed"));
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{name}' not in allowlist"))
        }
    }

    fn allowed_list(&self) -> String {
        let mut names: Vec<&str> = self.allowed_commands.iter().map(String::as_str).collect();
        names.sort();
        names.join(", ")
    }
}

fn shell(command: &str, workdir: &Path) -> Command {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(workdir);
    cmd
}

fn command_param(params: &Value) -> Result<&str, String> {
    params
        .get("command")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "Missing string parameter 'command'".to_string())
}

fn command_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": description}
        },
        "required": ["command"]
    })
}

fn sh_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// 尽力推导逆命令；无法安全逆转时返回 None。
/// 逆命令对已不存在的目标是无操作，保证重复回滚安全。
pub fn inverse_command(command: &str) -> Option<String> {
    if command.contains(SHELL_METACHARS) {
        return None;
    }
    let tokens: Vec<&str> = command.split_whitespace().collect();
    match tokens.as_slice() {
        ["mkdir", rest @ ..] => {
            let targets: Vec<&&str> = rest.iter().filter(|t| !t.starts_with('-')).collect();
            // mkdir -p 可能创建多级目录，无法可靠逆转
            if rest.iter().any(|t| t.starts_with('-')) || targets.len() != 1 {
                return None;
            }
            let dir = sh_quote(targets[0]);
            Some(format!("[ ! -d {dir} ] || rmdir {dir}"))
        }
        ["mv", from, to] if !from.starts_with('-') && !to.starts_with('-') => {
            let (from, to) = (sh_quote(from), sh_quote(to));
            Some(format!("[ ! -e {to} ] || [ -e {from} ] || mv {to} {from}"))
        }
        ["git", "add", paths @ ..] if !paths.is_empty() && !paths.iter().any(|p| p.starts_with('-')) => {
            let paths: Vec<String> = paths.iter().map(|p| sh_quote(p)).collect();
            Some(format!("git reset -q -- {}", paths.join(" ")))
        }
        _ => None,
    }
}

/// runCommand：阻塞执行白名单命令
pub struct RunCommandTool {
    policy: CommandPolicy,
    timeout: Duration,
    workdir: PathBuf,
}

impl RunCommandTool {
    pub fn new(policy: CommandPolicy, timeout_secs: u64, workdir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            workdir: workdir.into(),
        }
    }

    async fn run(&self, command: &str, ctx: &ToolContext) -> Result<Value, String> {
        let mut cmd = shell(command, &self.workdir);
        cmd.kill_on_drop(true);
        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(format!("Command cancelled: {command}")),
            res = tokio::time::timeout(self.timeout, cmd.output()) => res
                .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
                .map_err(|e| format!("Execution failed: {e}"))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()));
        }
        Ok(json!({
            "command": command,
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::RUN_COMMAND,
            format!(
                "Run a whitelisted shell command and wait for it. Allowed commands: {}",
                self.policy.allowed_list()
            ),
            EffectTag::Execute,
        )
        .with_parameters(command_schema("The shell command to execute (must be in allowlist)"))
        .requires_approval()
        .rollbackable()
    }

    async fn execute(&self, params: &Value, ctx: &ToolContext) -> Result<Value, String> {
        let command = command_param(params)?;
        self.policy.check(command)?;
        tracing::info!(command = %command, "runCommand");
        self.run(command, ctx).await
    }

    fn rollback_data(
        &self,
        params: &Value,
        _snapshot: Option<&Value>,
        result: Option<&Value>,
    ) -> Option<Value> {
        // 失败的命令没有可逆转的效果
        result?;
        let command = command_param(params).ok()?;
        inverse_command(command).map(|inverse| json!({"command": inverse}))
    }

    async fn rollback(&self, data: &Value) -> Result<(), String> {
        let command = command_param(data)?;
        tracing::info!(command = %command, "runCommand rollback");
        self.run(command, &ToolContext::new()).await.map(|_| ())
    }
}

/// runInTerminal：派发长时间运行的命令，不等待结果
pub struct RunInTerminalTool {
    policy: CommandPolicy,
    workdir: PathBuf,
}

impl RunInTerminalTool {
    pub fn new(policy: CommandPolicy, workdir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for RunInTerminalTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::RUN_IN_TERMINAL,
            "Start a long-running whitelisted command in the background (dev servers, watchers). Returns immediately.",
            EffectTag::Execute,
        )
        .with_parameters(command_schema("The shell command to start (must be in allowlist)"))
        .requires_approval()
        .non_blocking()
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let command = command_param(params)?;
        self.policy.check(command)?;
        let child = shell(command, &self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Spawn failed: {e}"))?;
        let pid = child.id();
        tracing::info!(command = %command, pid = ?pid, "runInTerminal dispatched");
        Ok(json!({"status": "dispatched", "command": command, "pid": pid}))
    }
}
