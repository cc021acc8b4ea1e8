//! searchFiles：在工作区内按文本或正则搜索文件内容
//!
//! 递归遍历（跳过隐藏目录、target、node_modules），可用 glob 过滤文件名，结果数有上限。

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::EffectTag;
use crate::tools::names;
use crate::tools::{SafeFs, Tool, ToolContext, ToolDefinition};

const MAX_FILE_SIZE: u64 = 1024 * 1024;

pub struct SearchFilesTool {
    fs: SafeFs,
    max_results: usize,
}

impl SearchFilesTool {
    pub fn new(fs: SafeFs, max_results: usize) -> Self {
        Self {
            fs,
            max_results: max_results.max(1),
        }
    }

    fn search(
        &self,
        dir: &Path,
        matcher: &Matcher,
        include: Option<&glob::Pattern>,
    ) -> (Vec<Value>, bool) {
        let mut results = Vec::new();
        let walker = walkdir::WalkDir::new(dir)
            .max_depth(10)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0
                    || (!name.starts_with('.') && name != "target" && name != "node_modules")
            })
            .filter_map(|e| e.ok());

        for entry in walker {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
                continue;
            }
            let path = entry.path();
            if let Some(pattern) = include {
                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !pattern.matches(file_name) {
                    continue;
                }
            }
            // 非 UTF-8 文件跳过
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            for (line_num, line) in content.lines().enumerate() {
                if matcher.is_match(line) {
                    if results.len() >= self.max_results {
                        return (results, true);
                    }
                    results.push(json!({
                        "file": self.fs.relative(path),
                        "line": line_num + 1,
                        "text": line.trim(),
                    }));
                }
            }
        }
        (results, false)
    }
}

enum Matcher {
    Literal(String),
    Regex(regex::Regex),
}

impl Matcher {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Literal(s) => line.contains(s.as_str()),
            Matcher::Regex(re) => re.is_match(line),
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            names::SEARCH_FILES,
            "Search file contents in the workspace. Args: {\"pattern\", \"path\"?, \"include\"? (glob like *.rs), \"regex\"? (bool)}",
            EffectTag::Read,
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Text or regex to search for"},
                "path": {"type": "string", "description": "Directory to search, default '.'"},
                "include": {"type": "string", "description": "Glob filter on file names"},
                "regex": {"type": "boolean", "description": "Treat pattern as a regex"}
            },
            "required": ["pattern"]
        }))
    }

    async fn execute(&self, params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
        let pattern = params
            .get("pattern")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .ok_or("Missing string parameter 'pattern'")?;
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let use_regex = params.get("regex").and_then(|v| v.as_bool()).unwrap_or(false);
        let include = params
            .get("include")
            .and_then(|v| v.as_str())
            .map(|g| glob::Pattern::new(g).map_err(|e| format!("Invalid include glob: {e}")))
            .transpose()?;

        let matcher = if use_regex {
            Matcher::Regex(regex::Regex::new(pattern).map_err(|e| format!("Invalid regex pattern: {e}"))?)
        } else {
            Matcher::Literal(pattern.to_string())
        };
        let dir = if path == "." || path.is_empty() {
            self.fs.root().to_path_buf()
        } else {
            self.fs.resolve(path)?
        };

        tracing::info!(pattern = %pattern, path = %path, "searchFiles");
        let (matches, truncated) = self.search(&dir, &matcher, include.as_ref());
        Ok(json!({"matches": matches, "truncated": truncated}))
    }
}
