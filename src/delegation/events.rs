//! 可注入的事件总线与委派生命周期事件

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::delegation::types::{AgentResult, AgentRole};

pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// on / off / emit；emit 时先复制监听器列表再逐个调用，监听器内部可以安全地再 on/off
pub struct EventBus<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(handler)));
        }
        id
    }

    /// 返回是否确实移除了监听器
    pub fn off(&self, id: ListenerId) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// 委派生命周期事件；run_id 区分同一引擎上的并发执行
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelegationEvent {
    PlanAccepted {
        run_id: String,
        task_ids: Vec<String>,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        role: AgentRole,
    },
    TaskProgress {
        run_id: String,
        task_id: String,
        role: AgentRole,
        message: String,
    },
    TaskCompleted {
        run_id: String,
        task_id: String,
        role: AgentRole,
        result: AgentResult,
    },
    TaskFailed {
        run_id: String,
        task_id: String,
        role: AgentRole,
        error: String,
    },
    Aborted {
        run_id: String,
    },
    Finished {
        run_id: String,
        succeeded: usize,
        failed: usize,
    },
}

impl DelegationEvent {
    pub fn run_id(&self) -> &str {
        match self {
            DelegationEvent::PlanAccepted { run_id, .. }
            | DelegationEvent::TaskStarted { run_id, .. }
            | DelegationEvent::TaskProgress { run_id, .. }
            | DelegationEvent::TaskCompleted { run_id, .. }
            | DelegationEvent::TaskFailed { run_id, .. }
            | DelegationEvent::Aborted { run_id }
            | DelegationEvent::Finished { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_off_emit() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = seen.clone();
        let id = bus.on(move |v| s1.lock().unwrap().push(*v));
        let s2 = seen.clone();
        bus.on(move |v| s2.lock().unwrap().push(*v * 10));

        bus.emit(&1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 10, 20]);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = DelegationEvent::Aborted { run_id: "r1".into() };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "aborted");
        assert_eq!(ev.run_id(), "r1");
    }
}
