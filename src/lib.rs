//! Atelier - 桌面工程助手的智能体执行核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、请求终态与 Agent 装配
//! - **delegation**: 委派计划校验、DAG 调度、有界 Worker Pool 与子 Agent
//! - **llm**: 消息类型、Model Service 抽象、按角色的模型路由、Mock 实现
//! - **middleware**: 生命周期中间件管线与内置中间件
//! - **observability**: tracing 初始化
//! - **react**: Planner 解析、落盘策略、澄清、进度事件与主循环
//! - **sandbox**: 路径守卫与沙箱文件/命令服务
//! - **tools**: 工具调用类型、沙箱工具集、协作方工具注册表与执行器

pub mod config;
pub mod core;
pub mod delegation;
pub mod llm;
pub mod middleware;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;
