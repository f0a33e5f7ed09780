pub mod executor;
pub mod registry;
pub mod toolset;
pub mod types;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use toolset::SandboxToolset;
pub use types::{
    builtin_tool_specs, ToolCall, ToolObservation, ToolSpec, ASK_CLARIFICATION, COLLABORATOR_TOOLS,
    DELEGATE_SUB_TASKS, EXEC, GITHUB_SEARCH, LIST_DIR, MEMORY_SEARCH, MUTATING_TOOLS, READ_FILE,
    TASK, WEB_FETCH, WEB_SEARCH, WRITE_FILE, WRITE_TODOS,
};
