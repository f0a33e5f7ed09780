//! Agent 构建器：从 AppConfig 装配沙箱、工具执行器、委派引擎、中间件管线与 Planner 主循环
//!
//! 所有接入方式（CLI、宿主进程）共用同一套装配逻辑。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, AgentOutcome};
use crate::delegation::{AgentRuntime, DelegationEngine};
use crate::llm::{MockModelService, ModelService};
use crate::middleware::{default_pipeline, Middleware};
use crate::react::{AgentRequest, PlannerLoop, ProgressEvent};
use crate::sandbox::{PathGuard, SandboxError, SandboxService};
use crate::tools::{SandboxToolset, Tool, ToolExecutor, ToolRegistry};

pub struct AgentBuilder {
    config: AppConfig,
    workspace: PathBuf,
    model: Option<Arc<dyn ModelService>>,
    collaborators: ToolRegistry,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            model: None,
            collaborators: ToolRegistry::new(),
            middlewares: Vec::new(),
        }
    }

    /// 设置 Model Service；未设置时使用离线 echo 模型
    pub fn with_model(mut self, model: Arc<dyn ModelService>) -> Self {
        self.model = Some(model);
        self
    }

    /// 注册协作方工具（web_search / web_fetch / github_search / memory_search）
    pub fn with_collaborator(mut self, tool: impl Tool + 'static) -> Self {
        self.collaborators.register(tool);
        self
    }

    /// 追加在内置中间件之后
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn build_sandbox(&self) -> Result<Arc<SandboxService>, AgentError> {
        std::fs::create_dir_all(&self.workspace).map_err(|e| SandboxError::io("create workspace", e))?;
        let sandbox = &self.config.sandbox;
        let guard = PathGuard::with_allowed_roots(&sandbox.virtual_root, &self.workspace, sandbox.allowed_roots.clone())?;
        Ok(Arc::new(SandboxService::new(guard, sandbox.settings())))
    }

    pub fn build_components(self) -> Result<AgentComponents, AgentError> {
        let model = self.model.clone().unwrap_or_else(|| {
            tracing::warn!("no model service configured, using the offline echo model");
            Arc::new(MockModelService::echo())
        });
        let sandbox = self.build_sandbox()?;
        let toolset = SandboxToolset::new(sandbox.clone(), Arc::new(self.collaborators));

        let runtime = AgentRuntime::new(
            model.clone(),
            &self.config.models,
            toolset.clone(),
            self.config.delegation.sub_agent_max_steps,
        );
        let delegation = Arc::new(DelegationEngine::new(
            self.config.delegation.max_concurrency,
            Arc::new(runtime),
        ));
        let executor = Arc::new(
            ToolExecutor::new(toolset, self.config.tools.tool_timeout_secs).with_delegation(delegation.clone()),
        );

        let mut pipeline = default_pipeline();
        for middleware in self.middlewares {
            pipeline.register_arc(middleware);
        }
        tracing::info!(
            workspace = %self.workspace.display(),
            virtual_root = %sandbox.virtual_root(),
            middlewares = ?pipeline.names(),
            "agent components ready"
        );

        let planner = PlannerLoop::new(
            model,
            self.config.models.clone(),
            Arc::new(pipeline),
            executor.clone(),
            self.config.planner.settings(),
        );
        Ok(AgentComponents {
            planner,
            executor,
            delegation,
            sandbox,
            workspace: self.workspace,
            config: self.config,
        })
    }
}

/// 预构建的 Agent 组件，可多会话共享
pub struct AgentComponents {
    pub planner: PlannerLoop,
    pub executor: Arc<ToolExecutor>,
    pub delegation: Arc<DelegationEngine>,
    pub sandbox: Arc<SandboxService>,
    pub workspace: PathBuf,
    pub config: AppConfig,
}

impl AgentComponents {
    /// 对单条用户输入跑完整个 Planner 循环
    pub async fn process_message(
        &self,
        session_id: &str,
        message: &str,
        events: Option<UnboundedSender<ProgressEvent>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let request = AgentRequest::new(session_id, message, self.workspace.clone());
        self.planner.run(request, events, cancel).await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 便捷函数：加载配置并创建 AgentBuilder（配置加载失败时退回默认值）
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let workspace = config.app.workspace_root();
    AgentBuilder::new(config, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_components_answer_with_echo_model() {
        let dir = TempDir::new().unwrap();
        let components = AgentBuilder::new(AppConfig::default(), dir.path().join("ws"))
            .build_components()
            .unwrap();
        assert!(dir.path().join("ws").is_dir());

        let outcome = components
            .process_message("s1", "hello there", None, CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            AgentOutcome::Answered { text, saved_path, steps } => {
                assert!(text.contains("Echo from Mock"));
                assert!(saved_path.is_none());
                assert_eq!(steps, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
