//! 固定大小线程池 (推理 / 回调)
//!
//! 任务通过 crossbeam 有界通道分发, 容量为0时是同步交接 (rendezvous)。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, SendTimeoutError, TrySendError};
use tracing::{debug, error};

use crate::error::{PipelineError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(capacity);
        let mut handles = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let rx = rx.clone();
            let thread_name = format!("{}-{}", name, i);
            let label = thread_name.clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    for job in rx.iter() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("❌ 工作线程 {} 任务崩溃", label);
                        }
                    }
                    debug!("✅ 工作线程 {} 退出", label);
                })
                .map_err(|e| PipelineError::Spawn(format!("{}: {}", name, e)))?;
            handles.push(handle);
        }
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            handles,
        })
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// 等待空闲线程, 超时后把任务交还给调用者
    pub fn submit_timeout(&self, job: Job, timeout: Duration) -> std::result::Result<(), Job> {
        match &self.tx {
            Some(tx) => match tx.send_timeout(job, timeout) {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(job)) | Err(SendTimeoutError::Disconnected(job)) => {
                    Err(job)
                }
            },
            None => Err(job),
        }
    }

    /// 非阻塞提交, 队列满时丢弃并返回 false
    pub fn try_submit(&self, job: Job) -> bool {
        match &self.tx {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("⚠️ {} 队列已满, 丢弃任务", self.name);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// 关闭队列并等待所有已提交任务完成
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("❌ {} 线程异常退出", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_all_jobs_before_shutdown() {
        let pool = WorkerPool::new("test", 3, 16).unwrap();
        assert_eq!(pool.size(), 3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            let job: Job = Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            assert!(pool.submit_timeout(job, Duration::from_secs(1)).is_ok());
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panic", 1, 4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        assert!(pool.try_submit(Box::new(|| panic!("boom"))));
        let d = done.clone();
        assert!(pool.try_submit(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })));
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_submit_drops_when_full() {
        let pool = WorkerPool::new("full", 1, 1).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        // 占住唯一的工作线程
        assert!(pool.try_submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        })));
        started_rx.recv().unwrap();
        assert!(pool.try_submit(Box::new(|| {})));
        assert!(!pool.try_submit(Box::new(|| {})));
        gate_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_rendezvous_submit_times_out_when_busy() {
        let pool = WorkerPool::new("sync", 1, 0).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let job: Job = Box::new(move || {
            let _ = gate_rx.recv();
        });
        assert!(pool.submit_timeout(job, Duration::from_secs(1)).is_ok());
        let rejected = pool.submit_timeout(Box::new(|| {}), Duration::from_millis(50));
        assert!(rejected.is_err());
        gate_tx.send(()).unwrap();
    }
}
