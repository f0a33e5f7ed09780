//! 有界 Worker Pool
//!
//! 每个任务交给一个独立的执行单元（tokio task），任务描述先序列化为 JSON 再在单元内反序列化，
//! 单元与调度器之间只通过 mpsc 消息通信。
//! 活动单元表是唯一的共享可变结构；单元结束时（正常、出错、panic、abort）由 UnitGuard 负责摘除并上报。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use crate::delegation::types::{AgentResult, AgentRole};

/// 上游依赖的输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyOutput {
    pub task_id: String,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// 交给执行单元的完整任务描述（可序列化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub task_id: String,
    pub agent_role: AgentRole,
    pub prompt: String,
    #[serde(default)]
    pub write_path: Option<String>,
    #[serde(default)]
    pub dependency_outputs: Vec<DependencyOutput>,
    #[serde(default)]
    pub workspace_override: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Progress { task_id: String, message: String },
    Completed { task_id: String, result: AgentResult },
    Failed { task_id: String, error: String },
}

impl WorkerMessage {
    pub fn task_id(&self) -> &str {
        match self {
            WorkerMessage::Progress { task_id, .. }
            | WorkerMessage::Completed { task_id, .. }
            | WorkerMessage::Failed { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool at capacity ({0})")]
    AtCapacity(usize),

    #[error("task '{0}' is already running")]
    AlreadyRunning(String),

    #[error("failed to serialize task: {0}")]
    Serialize(String),

    #[error("worker pool state is poisoned")]
    Poisoned,
}

/// 执行单元内的进度上报
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    tx: UnboundedSender<WorkerMessage>,
}

impl ProgressReporter {
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.send(WorkerMessage::Progress {
            task_id: self.task_id.clone(),
            message: message.into(),
        });
    }
}

/// 真正执行任务的一方（子 Agent 运行时）
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: WorkerTask, progress: ProgressReporter) -> AgentResult;
}

type ActiveUnits = Arc<Mutex<HashMap<String, AbortHandle>>>;

pub struct WorkerPool {
    capacity: usize,
    runner: Arc<dyn TaskRunner>,
    active: ActiveUnits,
    tx: UnboundedSender<WorkerMessage>,
}

impl WorkerPool {
    /// capacity 至少为 1；返回的 receiver 接收所有单元的消息
    pub fn new(capacity: usize, runner: Arc<dyn TaskRunner>) -> (Self, UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            capacity: capacity.max(1),
            runner,
            active: Arc::new(Mutex::new(HashMap::new())),
            tx,
        };
        (pool, rx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn available_slots(&self) -> usize {
        self.capacity.saturating_sub(self.active_count())
    }

    /// 超出容量立即失败，不排队
    pub fn submit(&self, task: WorkerTask) -> Result<(), PoolError> {
        let payload = serde_json::to_value(&task).map_err(|e| PoolError::Serialize(e.to_string()))?;
        let task_id = task.task_id;

        let mut active = self.active.lock().map_err(|_| PoolError::Poisoned)?;
        if active.len() >= self.capacity {
            return Err(PoolError::AtCapacity(self.capacity));
        }
        if active.contains_key(&task_id) {
            return Err(PoolError::AlreadyRunning(task_id));
        }

        let guard = UnitGuard {
            task_id: task_id.clone(),
            active: self.active.clone(),
            tx: self.tx.clone(),
            outcome: None,
        };
        let runner = self.runner.clone();
        let reporter = ProgressReporter {
            task_id: task_id.clone(),
            tx: self.tx.clone(),
        };
        // 持锁期间 spawn：单元即使立刻结束，也要等登记完成后才能摘除自己
        let handle = tokio::spawn(async move {
            // 整体移入单元：正常结束、panic 或 abort 时都由它的 Drop 收尾
            let mut guard = guard;
            let task: WorkerTask = match serde_json::from_value(payload) {
                Ok(task) => task,
                Err(e) => {
                    guard.outcome = Some(Err(format!("invalid task payload: {}", e)));
                    return;
                }
            };
            let result = runner.run(task, reporter).await;
            guard.outcome = Some(Ok(result));
        });
        active.insert(task_id, handle.abort_handle());
        Ok(())
    }

    /// 强制终止所有活动单元，返回终止数量
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<(String, AbortHandle)> = match self.active.lock() {
            Ok(mut active) => active.drain().collect(),
            Err(_) => return 0,
        };
        for (task_id, handle) in &drained {
            tracing::warn!(task_id = %task_id, "terminating worker unit");
            handle.abort();
        }
        drained.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

/// 单元的生命周期守卫：先从活动表摘除，再发送结果
struct UnitGuard {
    task_id: String,
    active: ActiveUnits,
    tx: UnboundedSender<WorkerMessage>,
    outcome: Option<Result<AgentResult, String>>,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.task_id);
        }
        let task_id = self.task_id.clone();
        let message = match self.outcome.take() {
            Some(Ok(result)) => WorkerMessage::Completed { task_id, result },
            Some(Err(error)) => WorkerMessage::Failed { task_id, error },
            None => WorkerMessage::Failed {
                task_id,
                error: "worker terminated before reporting a result".to_string(),
            },
        };
        let _ = self.tx.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(id: &str) -> WorkerTask {
        WorkerTask {
            task_id: id.to_string(),
            agent_role: AgentRole::Researcher,
            prompt: "p".to_string(),
            write_path: None,
            dependency_outputs: Vec::new(),
            workspace_override: None,
        }
    }

    struct Sleepy {
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TaskRunner for Sleepy {
        async fn run(&self, task: WorkerTask, progress: ProgressReporter) -> AgentResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            progress.report("working");
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            AgentResult::ok(format!("done {}", task.task_id))
        }
    }

    struct Panicky;

    #[async_trait]
    impl TaskRunner for Panicky {
        async fn run(&self, _task: WorkerTask, _progress: ProgressReporter) -> AgentResult {
            panic!("boom");
        }
    }

    fn sleepy(delay: Duration) -> Arc<Sleepy> {
        Arc::new(Sleepy {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let runner = sleepy(Duration::from_millis(50));
        let (pool, mut rx) = WorkerPool::new(2, runner.clone());
        pool.submit(task("a")).unwrap();
        pool.submit(task("b")).unwrap();
        assert_eq!(pool.submit(task("c")).unwrap_err(), PoolError::AtCapacity(2));
        assert_eq!(pool.available_slots(), 0);

        let mut done = 0;
        while done < 2 {
            match rx.recv().await.unwrap() {
                WorkerMessage::Completed { result, .. } => {
                    assert!(result.success);
                    done += 1;
                }
                WorkerMessage::Progress { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(pool.available_slots(), 2);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_duplicate_running_task_rejected() {
        let (pool, _rx) = WorkerPool::new(3, sleepy(Duration::from_millis(50)));
        pool.submit(task("a")).unwrap();
        assert_eq!(
            pool.submit(task("a")).unwrap_err(),
            PoolError::AlreadyRunning("a".into())
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (pool, mut rx) = WorkerPool::new(1, Arc::new(Panicky));
        pool.submit(task("a")).unwrap();
        match rx.recv().await.unwrap() {
            WorkerMessage::Failed { task_id, error } => {
                assert_eq!(task_id, "a");
                assert!(error.contains("terminated"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_all_aborts_units() {
        let (pool, mut rx) = WorkerPool::new(2, sleepy(Duration::from_secs(60)));
        pool.submit(task("a")).unwrap();
        pool.submit(task("b")).unwrap();
        assert_eq!(pool.terminate_all(), 2);
        assert_eq!(pool.active_count(), 0);

        let mut failed = Vec::new();
        while failed.len() < 2 {
            if let WorkerMessage::Failed { task_id, .. } = rx.recv().await.unwrap() {
                failed.push(task_id);
            }
        }
        failed.sort();
        assert_eq!(failed, vec!["a", "b"]);
    }
}
