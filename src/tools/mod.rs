pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod rollback;
pub mod schema;
pub mod search;
pub mod shell;

/// 内置工具名（模型与计划中使用的名字）
pub mod names {
    pub const READ_FILE: &str = "readFile";
    pub const LIST_FILES: &str = "listFiles";
    pub const SEARCH_FILES: &str = "searchFiles";
    pub const CREATE_FILE: &str = "createFile";
    pub const EDIT_FILE: &str = "editFile";
    pub const DELETE_FILE: &str = "deleteFile";
    pub const RUN_COMMAND: &str = "runCommand";
    pub const RUN_IN_TERMINAL: &str = "runInTerminal";
}

pub use executor::{ToolExecutor, ToolOutcome};
pub use filesystem::{
    CreateFileTool, DeleteFileTool, EditFileTool, ListFilesTool, ReadFileTool, SafeFs,
};
pub use registry::{ProgressFn, Tool, ToolContext, ToolDefinition, ToolRegistry};
pub use rollback::{RollbackEntry, RollbackStack};
pub use schema::plan_schema_json;
pub use search::SearchFilesTool;
pub use shell::{inverse_command, CommandPolicy, RunCommandTool, RunInTerminalTool};
