//! 按角色路由模型
//!
//! Planner、Synthesizer、Clarifier 以及三类子智能体各自绑定一个 RuntimeConfig，
//! 可以全部指向同一模型，也可以拆开（例如用更便宜的模型生成澄清选项）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::llm::RuntimeConfig;

/// 调用模型的逻辑角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Planner,
    Synthesizer,
    Clarifier,
    Researcher,
    BashOperator,
    Writer,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Planner => "planner",
            ModelRole::Synthesizer => "synthesizer",
            ModelRole::Clarifier => "clarifier",
            ModelRole::Researcher => "researcher",
            ModelRole::BashOperator => "bash_operator",
            ModelRole::Writer => "writer",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_profile() -> RuntimeConfig {
    RuntimeConfig::new("deepseek", "deepseek-chat")
}

fn default_clarifier_profile() -> RuntimeConfig {
    RuntimeConfig::new("deepseek", "deepseek-chat").with_temperature(0.5)
}

/// [models] 段：每个角色一个 RuntimeConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRouting {
    #[serde(default = "default_profile")]
    pub planner: RuntimeConfig,
    #[serde(default = "default_profile")]
    pub synthesizer: RuntimeConfig,
    #[serde(default = "default_clarifier_profile")]
    pub clarifier: RuntimeConfig,
    #[serde(default = "default_profile")]
    pub researcher: RuntimeConfig,
    #[serde(default = "default_profile")]
    pub bash_operator: RuntimeConfig,
    #[serde(default = "default_profile")]
    pub writer: RuntimeConfig,
}

impl Default for ModelRouting {
    fn default() -> Self {
        Self {
            planner: default_profile(),
            synthesizer: default_profile(),
            clarifier: default_clarifier_profile(),
            researcher: default_profile(),
            bash_operator: default_profile(),
            writer: default_profile(),
        }
    }
}

impl ModelRouting {
    /// 所有角色共用同一个配置
    pub fn uniform(profile: RuntimeConfig) -> Self {
        Self {
            planner: profile.clone(),
            synthesizer: profile.clone(),
            clarifier: profile.clone(),
            researcher: profile.clone(),
            bash_operator: profile.clone(),
            writer: profile,
        }
    }

    pub fn profile(&self, role: ModelRole) -> &RuntimeConfig {
        match role {
            ModelRole::Planner => &self.planner,
            ModelRole::Synthesizer => &self.synthesizer,
            ModelRole::Clarifier => &self.clarifier,
            ModelRole::Researcher => &self.researcher,
            ModelRole::BashOperator => &self.bash_operator,
            ModelRole::Writer => &self.writer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lookup_by_role() {
        let mut routing = ModelRouting::uniform(RuntimeConfig::new("p", "base"));
        routing.synthesizer = RuntimeConfig::new("p", "big");
        assert_eq!(routing.profile(ModelRole::Planner).model, "base");
        assert_eq!(routing.profile(ModelRole::Synthesizer).model, "big");
        assert_eq!(ModelRole::BashOperator.to_string(), "bash_operator");
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let routing: ModelRouting = serde_json::from_value(serde_json::json!({
            "writer": {"provider": "openai", "model": "gpt-4o-mini"}
        }))
        .unwrap();
        assert_eq!(routing.writer.model, "gpt-4o-mini");
        assert_eq!(routing.planner, default_profile());
    }
}
