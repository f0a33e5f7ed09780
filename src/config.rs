//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ATELIER__*` 覆盖（双下划线表示嵌套，如 `ATELIER__DELEGATION__MAX_CONCURRENCY=4`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::ModelRouting;
use crate::react::PlannerSettings;
use crate::sandbox::{SandboxSettings, DEFAULT_VIRTUAL_ROOT};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub sandbox: SandboxSection,
    pub planner: PlannerSection,
    pub delegation: DelegationSection,
    pub tools: ToolsSection,
    pub models: ModelRouting,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工作区根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./workspace"))
    }
}

/// [sandbox] 段：虚拟根、额外允许根、读取上限、命令超时与白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub virtual_root: String,
    /// 为空时只允许工作区根
    pub allowed_roots: Vec<PathBuf>,
    pub max_read_bytes: u64,
    pub exec_timeout_secs: u64,
    /// 允许执行的命令名（仅首词，如 ls、grep、cargo）
    pub allowed_commands: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let defaults = SandboxSettings::default();
        let mut allowed_commands: Vec<String> = defaults.allowed_commands.into_iter().collect();
        allowed_commands.sort();
        Self {
            virtual_root: DEFAULT_VIRTUAL_ROOT.to_string(),
            allowed_roots: Vec::new(),
            max_read_bytes: defaults.max_read_bytes,
            exec_timeout_secs: defaults.exec_timeout.as_secs(),
            allowed_commands,
        }
    }
}

impl SandboxSection {
    pub fn settings(&self) -> SandboxSettings {
        SandboxSettings {
            max_read_bytes: self.max_read_bytes,
            exec_timeout: Duration::from_secs(self.exec_timeout_secs.max(1)),
            allowed_commands: self.allowed_commands.iter().cloned().collect(),
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub max_tool_steps: usize,
    pub failure_stop_threshold: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        let defaults = PlannerSettings::default();
        Self {
            max_tool_steps: defaults.max_tool_steps,
            failure_stop_threshold: defaults.failure_stop_threshold,
        }
    }
}

impl PlannerSection {
    pub fn settings(&self) -> PlannerSettings {
        PlannerSettings {
            max_tool_steps: self.max_tool_steps.max(1),
            failure_stop_threshold: self.failure_stop_threshold.max(1),
        }
    }
}

/// [delegation] 段：Worker Pool 容量与子 Agent 步数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelegationSection {
    pub max_concurrency: usize,
    pub sub_agent_max_steps: usize,
}

impl Default for DelegationSection {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            sub_agent_max_steps: 6,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 60 }
    }
}

/// 从 config 目录加载配置，环境变量 ATELIER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ATELIER__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("ATELIER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
