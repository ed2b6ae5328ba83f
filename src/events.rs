//! 管线事件与回调分发
//!
//! 回调在独立线程池中执行, 观察者的错误 / 崩溃只记日志, 不影响推理线程。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use crate::counting::CountEvent;
use crate::detection::TrackedObject;
use crate::pipeline::worker_pool::WorkerPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Frame,
    Inference,
    Error,
    Count,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// 采集到新帧
    Frame {
        pipeline: String,
        seq: u64,
        timestamp: DateTime<Utc>,
        bytes: usize,
    },
    /// 单个模型完成一帧
    Inference {
        pipeline: String,
        model: String,
        seq: u64,
        elapsed_ms: f64,
        objects: Vec<TrackedObject>,
    },
    Error {
        pipeline: String,
        kind: &'static str,
        message: String,
    },
    Count {
        pipeline: String,
        #[serde(flatten, rename = "count_event")]
        event: CountEvent,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::Frame { .. } => EventKind::Frame,
            PipelineEvent::Inference { .. } => EventKind::Inference,
            PipelineEvent::Error { .. } => EventKind::Error,
            PipelineEvent::Count { .. } => EventKind::Count,
        }
    }
}

pub type Observer = Arc<dyn Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync>;

/// 观察者注册表 + 回调线程池
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<HashMap<EventKind, Vec<Observer>>>,
    executor: RwLock<Option<WorkerPool>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, observer: F)
    where
        F: Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(observer);
    }

    pub fn has_observers(&self, kind: EventKind) -> bool {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(false, |v| !v.is_empty())
    }

    /// 绑定回调线程池 (管线启动时)
    pub(crate) fn attach_executor(&self, pool: WorkerPool) {
        *self.executor.write().unwrap_or_else(|e| e.into_inner()) = Some(pool);
    }

    /// 解绑回调线程池 (管线停止时), 由调用者负责关闭
    pub(crate) fn detach_executor(&self) -> Option<WorkerPool> {
        self.executor.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// 异步分发, 回调队列满或未运行时丢弃
    pub fn emit(&self, event: PipelineEvent) {
        let observers = {
            let map = self.observers.read().unwrap_or_else(|e| e.into_inner());
            match map.get(&event.kind()) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return,
            }
        };

        let executor = self.executor.read().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = executor.as_ref() {
            let kind = event.kind();
            if !pool.try_submit(Box::new(move || deliver(&observers, &event))) {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("⚠️ 回调队列已满, 丢弃 {:?} 事件 (累计 {})", kind, dropped);
            }
        }
    }

    /// 因回调队列满而丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn deliver(observers: &[Observer], event: &PipelineEvent) {
    for observer in observers {
        match catch_unwind(AssertUnwindSafe(|| observer(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("⚠️ 事件回调失败 ({:?}): {:#}", event.kind(), e),
            Err(_) => error!("❌ 事件回调崩溃 ({:?})", event.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn error_event() -> PipelineEvent {
        PipelineEvent::Error {
            pipeline: "p".into(),
            kind: "transient_read",
            message: "x".into(),
        }
    }

    #[test]
    fn test_failing_observers_do_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::Error, |_| anyhow::bail!("observer failed"));
        bus.subscribe(EventKind::Error, |_| panic!("observer panicked"));
        let h = hits.clone();
        bus.subscribe(EventKind::Error, move |e| {
            assert_eq!(e.kind(), EventKind::Error);
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.attach_executor(WorkerPool::new("cb", 1, 8).unwrap());
        bus.emit(error_event());
        bus.emit(error_event());
        bus.detach_executor().unwrap().shutdown();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_are_routed_by_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(EventKind::Frame, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(bus.has_observers(EventKind::Frame));
        assert!(!bus.has_observers(EventKind::Count));

        bus.attach_executor(WorkerPool::new("cb", 1, 8).unwrap());
        bus.emit(error_event());
        bus.detach_executor().unwrap().shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_callback_queue_counts_dropped_events() {
        let bus = EventBus::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        bus.subscribe(EventKind::Error, move |_| {
            let _ = gate_rx.recv();
            Ok(())
        });

        // 1 个回调线程 + 1 个排队位置, 第 3 个事件必然被丢弃
        bus.attach_executor(WorkerPool::new("cb", 1, 1).unwrap());
        for _ in 0..3 {
            bus.emit(error_event());
        }
        assert!(bus.dropped() >= 1);

        drop(gate_tx);
        bus.detach_executor().unwrap().shutdown();
    }

    #[test]
    fn test_emit_without_executor_is_dropped() {
        let bus = EventBus::new();
        bus.subscribe(EventKind::Error, |_| panic!("must not run"));
        bus.emit(error_event());
    }
}
