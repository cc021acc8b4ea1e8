//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作区根目录，所有路径必须落在根下（禁止 ../、绝对路径与符号链接逃逸）；
//! 在其上提供 readFile / listFiles / createFile / editFile / deleteFile。
//! 写类工具执行前采集现场，回滚时恢复；回滚操作幂等，重复回滚为无操作。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::EffectTag;
use crate::tools::names;
use crate::tools::{Tool, ToolContext, ToolDefinition};

/// 沙箱文件系统：绑定根目录，校验路径不逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析已存在的路径（跟随符号链接后仍须在根下）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let full = self.resolve_new(path)?;
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {path}"))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {path}"))
        }
    }

    /// 解析可能尚不存在的路径：按词法规整 . 与 ..，结果须在根下；
    /// 最深的已存在祖先按真实路径再校验一次，挡住指向根外的符号链接
    pub fn resolve_new(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim();
        if path.is_empty() {
            return Err("Empty path".to_string());
        }
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root_dir.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("Path escapes workspace: {path}"));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        if !normalized.starts_with(&self.root_dir) {
            return Err(format!("Path escapes workspace: {path}"));
        }
        let existing = normalized
            .ancestors()
            .find(|p| std::fs::symlink_metadata(p).is_ok());
        if let Some(existing) = existing {
            // 悬空链接也算逃逸
            let real = existing
                .canonicalize()
                .map_err(|_| format!("Path escapes workspace: {path}"))?;
            if !real.starts_with(&self.root_dir) {
                return Err(format!("Path escapes workspace: {path}"));
            }
        }
        Ok(normalized)
    }

    /// 相对根目录的显示路径
    pub fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root_dir)
            .unwrap_or(full)
            .to_string_lossy()
            .to_string()
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {e}"))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {e}"))? {
            let e = e.map_err(|e| e.to_string())?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{name}{ty}"));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// 写入文件（自动创建父目录）
    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, String> {
        self.write_bytes(path, content.as_bytes())
    }

    pub fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<PathBuf, String> {
        let full = self.resolve_new(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Create dir failed: {e}"))?;
        }
        std::fs::write(&full, bytes).map_err(|e| format!("Write failed: {e}"))?;
        Ok(full)
    }

    /// 尚不存在的祖先目录，由深到浅（写入前调用，用于回滚时清理）
    fn missing_ancestors(&self, full: &Path) -> Vec<String> {
        let mut missing = Vec::new();
        let mut current = full.parent();
        while let Some(dir) = current {
            if dir == self.root_dir.as_path() || dir.exists() {
                break;
            }
            missing.push(self.relative(dir));
            current = dir.parent();
        }
        missing
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing string parameter '{key}'"))
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": description}
        },
        "required": ["path"]
    })
}

/// 采集文件现场：UTF-8 文本存 content，其余按字节数组存 bytes
fn file_snapshot(fs: &SafeFs, path: &str) -> Option<Value> {
    let full = fs.resolve(path).ok()?;
    let bytes = std::fs::read(full).ok()?;
    Some(match String::from_utf8(bytes) {
        Ok(content) => json!({"content": content}),
        Err(e) => json!({"bytes": e.into_bytes()}),
    })
}

/// 由现场生成回滚数据 {"path", "content" | "bytes"}
fn restore_data(params: &Value, snapshot: Option<&Value>) -> Option<Value> {
    let snapshot = snapshot?;
    let (key, value) = ["content", "bytes"]
        .into_iter()
        .find_map(|key| snapshot.get(key).map(|v| (key, v.clone())))?;
    let mut data = json!({"path": params.get("path")?});
    data[key] = value;
    Some(data)
}

fn snapshot_bytes(data: &Value) -> Result<Vec<u8>, String> {
    if let Some(content) = data.get("content").and_then(Value::as_str) {
        return Ok(content.as_bytes().to_vec());
    }
    let bytes = data
        .get("bytes")
        .and_then(Value::as_array)
        .ok_or_else(|| "Missing snapshot content".to_string())?;
    bytes
        .iter()
        .map(|b| {
            b.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or_else(|| format!("Invalid snapshot byte: {b}"))
        })
        .collect()
}

/// 恢复文件内容；内容已一致时不写
fn restore(fs: &SafeFs, data: &Value) -> Result<(), String> {
    let path = str_param(data, "path")?;
    let bytes = snapshot_bytes(data)?;
    let full = fs.resolve_new(path)?;
    if std::fs::read(&full).ok().as_deref() == Some(bytes.as_slice()) {
        return Ok(());
    }
    fs.write_bytes(path, &bytes)?;
    tracing::info!(path = %path, bytes = bytes.len(), "file restored");
    Ok(())
}

/// readFile：读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::READ_FILE,
            "Read a file in the workspace. Args: {\"path\": \"relative path\"}",
            EffectTag::Read,
        )
        .with_parameters(path_schema("File path relative to workspace"))
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_param(params, "path")?;
        tracing::info!(path = %path, "readFile");
        let content = self.fs.read_file(path)?;
        Ok(json!({"path": path, "content": content}))
    }
}

/// listFiles：列出目录
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::LIST_FILES,
            "List a directory. Args: {\"path\": \"directory, default '.'\"}",
            EffectTag::Read,
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to workspace"}
            },
            "required": []
        }))
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "listFiles");
        let entries = self.fs.list_dir(path)?;
        Ok(json!({"path": path, "entries": entries}))
    }
}

/// createFile：新建文件，拒绝覆盖；回滚删除文件及新建的父目录
pub struct CreateFileTool {
    fs: SafeFs,
}

impl CreateFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for CreateFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::CREATE_FILE,
            "Create a new file. Fails if it exists. Args: {\"path\", \"content\"}",
            EffectTag::Write,
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "New file path relative to workspace"},
                "content": {"type": "string", "description": "File content"}
            },
            "required": ["path", "content"]
        }))
        .rollbackable()
    }

    async fn snapshot(&self, params: &Value) -> Option<Value> {
        let path = params.get("path")?.as_str()?;
        let full = self.fs.resolve_new(path).ok()?;
        Some(json!({
            "existed": full.exists(),
            "new_dirs": self.fs.missing_ancestors(&full),
        }))
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_param(params, "path")?;
        let content = str_param(params, "content")?;
        let full = self.fs.resolve_new(path)?;
        if full.exists() {
            return Err(format!("File already exists: {path}"));
        }
        tracing::info!(path = %path, bytes = content.len(), "createFile");
        self.fs.write_file(path, content)?;
        Ok(json!({"path": path, "bytes": content.len()}))
    }

    fn rollback_data(
        &self,
        params: &Value,
        snapshot: Option<&Value>,
        _result: Option<&Value>,
    ) -> Option<Value> {
        let snapshot = snapshot?;
        if snapshot.get("existed")?.as_bool()? {
            return None;
        }
        Some(json!({
            "path": params.get("path")?,
            "new_dirs": snapshot.get("new_dirs").cloned().unwrap_or_else(|| json!([])),
        }))
    }

    async fn rollback(&self, data: &Value) -> Result<(), String> {
        let path = str_param(data, "path")?;
        let full = self.fs.resolve_new(path)?;
        if full.is_file() {
            std::fs::remove_file(&full).map_err(|e| format!("Remove failed: {e}"))?;
            tracing::info!(path = %path, "created file removed");
        }
        let dirs = data.get("new_dirs").and_then(|d| d.as_array());
        for dir in dirs.into_iter().flatten().filter_map(|d| d.as_str()) {
            if let Ok(full) = self.fs.resolve_new(dir) {
                // 只删空目录
                let _ = std::fs::remove_dir(full);
            }
        }
        Ok(())
    }
}

/// editFile：唯一匹配替换；回滚恢复原内容
pub struct EditFileTool {
    fs: SafeFs,
}

impl EditFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::EDIT_FILE,
            "Replace one exact occurrence of old_string with new_string in a file. Args: {\"path\", \"old_string\", \"new_string\"}",
            EffectTag::Write,
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to workspace"},
                "old_string": {"type": "string", "description": "Exact text to replace; must occur once"},
                "new_string": {"type": "string", "description": "Replacement text"}
            },
            "required": ["path", "old_string", "new_string"]
        }))
        .requires_approval()
        .rollbackable()
    }

    async fn snapshot(&self, params: &Value) -> Option<Value> {
        file_snapshot(&self.fs, params.get("path")?.as_str()?)
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_param(params, "path")?;
        let old = str_param(params, "old_string")?;
        let new = str_param(params, "new_string")?;
        if old.is_empty() {
            return Err("old_string must not be empty".to_string());
        }
        let content = self.fs.read_file(path)?;
        match content.matches(old).count() {
            0 => return Err(format!("old_string not found in {path}")),
            1 => {}
            n => return Err(format!("old_string matches {n} times in {path}; make it unique")),
        }
        tracing::info!(path = %path, "editFile");
        self.fs.write_file(path, &content.replacen(old, new, 1))?;
        Ok(json!({"path": path, "replacements": 1}))
    }

    fn rollback_data(
        &self,
        params: &Value,
        snapshot: Option<&Value>,
        _result: Option<&Value>,
    ) -> Option<Value> {
        restore_data(params, snapshot)
    }

    async fn rollback(&self, data: &Value) -> Result<(), String> {
        restore(&self.fs, data)
    }
}

/// deleteFile：删除文件；回滚按原内容（含二进制）重建
pub struct DeleteFileTool {
    fs: SafeFs,
}

impl DeleteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::DELETE_FILE,
            "Delete a file. Args: {\"path\": \"relative path\"}",
            EffectTag::Write,
        )
        .with_parameters(path_schema("File path relative to workspace"))
        .requires_approval()
        .rollbackable()
    }

    async fn snapshot(&self, params: &Value) -> Option<Value> {
        file_snapshot(&self.fs, params.get("path")?.as_str()?)
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_param(params, "path")?;
        let full = self.fs.resolve(path)?;
        if !full.is_file() {
            return Err(format!("Not a file: {path}"));
        }
        tracing::info!(path = %path, "deleteFile");
        std::fs::remove_file(&full).map_err(|e| format!("Delete failed: {e}"))?;
        Ok(json!({"path": path, "deleted": true}))
    }

    fn rollback_data(
        &self,
        params: &Value,
        snapshot: Option<&Value>,
        _result: Option<&Value>,
    ) -> Option<Value> {
        restore_data(params, snapshot)
    }

    async fn rollback(&self, data: &Value) -> Result<(), String> {
        restore(&self.fs, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, SafeFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let (_dir, fs) = workspace();
        assert!(fs.resolve_new("../etc/passwd").is_err());
        assert!(fs.resolve_new("a/../../b").is_err());
        assert!(fs.resolve_new("/etc/passwd").is_err());
        assert!(fs.resolve_new("a/./b/../c.txt").unwrap().ends_with("a/c.txt"));
        assert!(fs.resolve_new("").is_err());
    }

    #[tokio::test]
    async fn test_read_and_list() {
        let (dir, fs) = workspace();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let read = ReadFileTool::new(fs.clone());
        let out = read.execute(&json!({"path": "a.txt"}), &ToolContext::new()).await.unwrap();
        assert_eq!(out["content"], "hello");
        assert!(read
            .execute(&json!({"path": "missing.txt"}), &ToolContext::new())
            .await
            .is_err());

        let list = ListFilesTool::new(fs);
        let out = list.execute(&json!({}), &ToolContext::new()).await.unwrap();
        assert_eq!(out["entries"], json!(["a.txt", "sub/"]));
    }

    #[tokio::test]
    async fn test_create_then_rollback_removes_file_and_new_dirs() {
        let (dir, fs) = workspace();
        let tool = CreateFileTool::new(fs);
        let params = json!({"path": "x/y/new.txt", "content": "data"});
        let snapshot = tool.snapshot(&params).await;
        let result = tool.execute(&params, &ToolContext::new()).await.unwrap();
        assert!(dir.path().join("x/y/new.txt").is_file());

        let data = tool.rollback_data(&params, snapshot.as_ref(), Some(&result)).unwrap();
        tool.rollback(&data).await.unwrap();
        assert!(!dir.path().join("x").exists());
        // 幂等
        tool.rollback(&data).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let (dir, fs) = workspace();
        std::fs::write(dir.path().join("a.txt"), "keep").unwrap();
        let tool = CreateFileTool::new(fs);
        let params = json!({"path": "a.txt", "content": "new"});
        let snapshot = tool.snapshot(&params).await;
        assert!(tool.execute(&params, &ToolContext::new()).await.is_err());
        assert!(tool.rollback_data(&params, snapshot.as_ref(), None).is_none());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match_and_rolls_back() {
        let (dir, fs) = workspace();
        std::fs::write(dir.path().join("m.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let tool = EditFileTool::new(fs);

        let ambiguous = json!({"path": "m.rs", "old_string": "fn", "new_string": "pub fn"});
        assert!(tool.execute(&ambiguous, &ToolContext::new()).await.is_err());

        let params = json!({"path": "m.rs", "old_string": "fn a", "new_string": "fn alpha"});
        let snapshot = tool.snapshot(&params).await;
        let result = tool.execute(&params, &ToolContext::new()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("m.rs")).unwrap(),
            "fn alpha() {}\nfn b() {}\n"
        );
        let data = tool.rollback_data(&params, snapshot.as_ref(), Some(&result)).unwrap();
        tool.rollback(&data).await.unwrap();
        tool.rollback(&data).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("m.rs")).unwrap(),
            "fn a() {}\nfn b() {}\n"
        );
    }

    #[tokio::test]
    async fn test_delete_rollback_recreates_file() {
        let (dir, fs) = workspace();
        std::fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        let tool = DeleteFileTool::new(fs);
        let params = json!({"path": "gone.txt"});
        let snapshot = tool.snapshot(&params).await;
        let result = tool.execute(&params, &ToolContext::new()).await.unwrap();
        assert!(!dir.path().join("gone.txt").exists());

        let data = tool.rollback_data(&params, snapshot.as_ref(), Some(&result)).unwrap();
        tool.rollback(&data).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("gone.txt")).unwrap(), "bye");
    }

    #[tokio::test]
    async fn test_delete_binary_file_rolls_back_exact_bytes() {
        let (dir, fs) = workspace();
        let original = [0xff_u8, 0xfe, 0x00, 0x80];
        std::fs::write(dir.path().join("img.bin"), original).unwrap();
        let tool = DeleteFileTool::new(fs);
        let params = json!({"path": "img.bin"});
        let snapshot = tool.snapshot(&params).await;
        assert!(snapshot.is_some());
        let result = tool.execute(&params, &ToolContext::new()).await.unwrap();
        assert!(!dir.path().join("img.bin").exists());

        let data = tool.rollback_data(&params, snapshot.as_ref(), Some(&result)).unwrap();
        tool.rollback(&data).await.unwrap();
        tool.rollback(&data).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("img.bin")).unwrap(), original);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dir_cannot_escape_workspace() {
        let (dir, fs) = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("nowhere"),
            dir.path().join("dangling"),
        )
        .unwrap();

        assert!(fs.resolve_new("link/escaped.txt").is_err());
        assert!(fs.resolve_new("link").is_err());
        assert!(fs.resolve_new("dangling").is_err());
        assert!(fs.write_file("link/escaped.txt", "x").is_err());

        let tool = CreateFileTool::new(fs.clone());
        let params = json!({"path": "link/escaped.txt", "content": "x"});
        assert!(tool.snapshot(&params).await.is_none());
        assert!(tool.execute(&params, &ToolContext::new()).await.is_err());
        assert!(!outside.path().join("escaped.txt").exists());

        let data = json!({"path": "link/escaped.txt", "content": "x"});
        assert!(EditFileTool::new(fs).rollback(&data).await.is_err());
        assert!(!outside.path().join("escaped.txt").exists());
    }
}
