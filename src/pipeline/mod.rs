/// 视频处理管线 (Pipeline Orchestrator)
///
/// 每次运行两个常驻线程 + 两个线程池, 通过 crossbeam 通道通信:
/// - Ingest:   读取帧源 → 有界帧队列 (满时按策略丢弃/等待)
/// - Dispatch: 帧队列 → 推理线程池 (同步交接, 背压留在帧队列)
/// - Workers:  解码 → 各模型推理/计数 → 叠加 → 编码 → 最新帧缓存 + 推流
/// - Callbacks: 事件回调 (观察者失败不影响推理)
pub mod compositor;
pub mod metrics;
pub mod models;
pub mod worker_pool;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, ClientReport, ClientSession, StreamOptions};
use crate::config::{ConfigPatch, PipelineConfig, QueuePolicy, SourceSpec};
use crate::counting::CountSnapshot;
use crate::detection::{DetectParams, ModelRegistry, TrackedObject};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, EventKind, PipelineEvent};
use crate::frame::Frame;
use crate::input::{self, FrameSource, ReadOutcome, SourceContext, UpstreamLookup};
use compositor::{LastFrame, Overlay};
use metrics::{InferenceStats, PipelineMetrics};
use models::{ModelSet, ModelSlot};
use worker_pool::{Job, WorkerPool};

/// 帧队列 / 提交轮询间隔 (观察停止标志)
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 回调队列容量, 满时丢弃事件
const CALLBACK_QUEUE: usize = 256;
/// 未配置计数时的检测框线宽
const DEFAULT_LINE_WIDTH: u32 = 2;

/// 健康状态
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub queue_size: usize,
    pub active_clients: usize,
    pub last_error: Option<String>,
    pub inference_ms: InferenceStats,
}

/// 运行指标
#[derive(Clone, Debug, Serialize)]
pub struct MetricsReport {
    pub avg_inference_ms: f64,
    pub frames_served: u64,
    pub bytes_served: u64,
    pub last_error: Option<String>,
    /// 回调队列满时丢弃的事件数
    pub events_dropped: u64,
    pub counters: BTreeMap<String, CountSnapshot>,
    pub clients: Vec<ClientReport>,
}

/// 工作线程共享状态
struct Shared {
    name: String,
    config: RwLock<Arc<PipelineConfig>>,
    models: RwLock<Arc<ModelSet>>,
    overlay: RwLock<Arc<Overlay>>,
    metrics: PipelineMetrics,
    broadcaster: Broadcaster,
    last_frame: Arc<LastFrame>,
    events: EventBus,
    running: AtomicBool,
    /// 当前运行的帧队列 (只用于查询长度, 不经过运行锁)
    queue: RwLock<Option<Receiver<Frame>>>,
}

impl Shared {
    fn config(&self) -> Arc<PipelineConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn models(&self) -> Arc<ModelSet> {
        self.models.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn overlay(&self) -> Arc<Overlay> {
        self.overlay.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 整体替换配置快照 (工作线程下一帧生效)
    fn swap(&self, config: Arc<PipelineConfig>, models: Arc<ModelSet>, overlay: Arc<Overlay>) {
        *self.models.write().unwrap_or_else(|e| e.into_inner()) = models;
        *self.overlay.write().unwrap_or_else(|e| e.into_inner()) = overlay;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn queue_len(&self) -> usize {
        self.queue
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |q| q.len())
    }

    /// 记录最近错误并通知观察者
    fn report_error(&self, err: &PipelineError) {
        warn!("⚠️ 管线 {}: {}", self.name, err);
        let message = err.to_string();
        self.metrics.set_error(message.clone());
        self.events.emit(PipelineEvent::Error {
            pipeline: self.name.clone(),
            kind: err.kind(),
            message,
        });
    }
}

/// 一次运行的线程句柄
struct RunHandle {
    stop: Arc<AtomicBool>,
    ingest: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl RunHandle {
    /// 停止并等待采集 / 分发线程退出
    fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.ingest.join().is_err() {
            error!("❌ 采集线程异常退出");
        }
        if self.dispatch.join().is_err() {
            error!("❌ 分发线程异常退出");
        }
    }
}

/// 视频处理管线
pub struct Pipeline {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
    /// 串行化配置更新
    update_lock: Mutex<()>,
    registry: Arc<ModelRegistry>,
    upstream: Option<UpstreamLookup>,
}

fn reject_self_chain(name: &str, config: &PipelineConfig) -> Result<()> {
    match &config.source {
        SourceSpec::Pipeline { name: upstream } if upstream == name => Err(
            PipelineError::rejected(format!("管线 {} 不能串联自身", name)),
        ),
        _ => Ok(()),
    }
}

impl Pipeline {
    /// 构造管线 (不启动); 配置无效或模型加载失败时返回 `ConfigRejected`
    pub fn new(
        name: impl Into<String>,
        config: PipelineConfig,
        registry: Arc<ModelRegistry>,
        upstream: Option<UpstreamLookup>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        reject_self_chain(&name, &config)?;
        let models = ModelSet::build(&config.models, &registry, None)?;
        let overlay = Overlay::from_config(&config)?;

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                config: RwLock::new(Arc::new(config)),
                models: RwLock::new(Arc::new(models)),
                overlay: RwLock::new(Arc::new(overlay)),
                metrics: PipelineMetrics::new(),
                broadcaster: Broadcaster::new(),
                last_frame: Arc::new(LastFrame::new()),
                events: EventBus::new(),
                running: AtomicBool::new(false),
                queue: RwLock::new(None),
            }),
            run: Mutex::new(None),
            update_lock: Mutex::new(()),
            registry,
            upstream,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        self.shared.config()
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动管线; 运行中重复调用直接返回
    pub fn start(&self) -> Result<()> {
        let mut run = self.lock_run();
        if run.is_some() && self.is_running() {
            return Ok(());
        }
        // 上一轮已自行结束 (文件读完), 先回收线程
        if let Some(finished) = run.take() {
            finished.shutdown();
        }
        let config = self.shared.config();
        // 统计按运行周期计; 配置更新引起的内部重启不清零
        self.shared.metrics.reset();
        *run = Some(self.launch(&config)?);
        Ok(())
    }

    /// 停止管线并断开所有客户端
    pub fn stop(&self) {
        let handle = self.lock_run().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!("⏹️ 管线 {} 已停止", self.shared.name);
        }
        *self.shared.queue.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.broadcaster.close_all();
    }

    fn launch(&self, config: &PipelineConfig) -> Result<RunHandle> {
        let shared = &self.shared;
        let name = &shared.name;

        let ctx = SourceContext {
            pipeline: name.clone(),
            upstream: self.upstream.clone(),
        };
        let source = input::open(&config.source, &ctx)?;
        let describe = source.describe();

        let (tx, rx) = bounded::<Frame>(config.queue_depth);
        let pool = WorkerPool::new(&format!("{}-infer", name), config.workers, 0)?;
        let callbacks =
            WorkerPool::new(&format!("{}-callback", name), config.callback_workers, CALLBACK_QUEUE)?;
        shared.events.attach_executor(callbacks);

        let stop = Arc::new(AtomicBool::new(false));
        shared.running.store(true, Ordering::SeqCst);

        let ingest = {
            let shared = shared.clone();
            let stop = stop.clone();
            let policy = config.queue_policy;
            thread::Builder::new()
                .name(format!("{}-ingest", name))
                .spawn(move || ingest_loop(shared, source, tx, policy, stop))
        };
        let ingest = match ingest {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                if let Some(callbacks) = shared.events.detach_executor() {
                    callbacks.shutdown();
                }
                return Err(PipelineError::Spawn(format!("{}-ingest: {}", name, e)));
            }
        };

        let dispatch = {
            let shared = shared.clone();
            let stop = stop.clone();
            let queue = rx.clone();
            thread::Builder::new()
                .name(format!("{}-dispatch", name))
                .spawn(move || dispatch_loop(shared, queue, pool, stop))
        };
        let dispatch = match dispatch {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                let _ = ingest.join();
                shared.running.store(false, Ordering::SeqCst);
                if let Some(callbacks) = shared.events.detach_executor() {
                    callbacks.shutdown();
                }
                return Err(PipelineError::Spawn(format!("{}-dispatch: {}", name, e)));
            }
        };

        *shared.queue.write().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        info!(
            "✅ 管线 {} 已启动: {} (队列 {}, 推理线程 {})",
            name, describe, config.queue_depth, config.workers
        );
        Ok(RunHandle {
            stop,
            ingest,
            dispatch,
        })
    }

    /// 局部更新配置
    ///
    /// 新配置与模型集合先完整构造再替换, 失败时原配置不变。
    /// 帧源 / 队列 / 线程数变化会在内部重启采集, 客户端连接保留。
    pub fn update_config(&self, patch: ConfigPatch) -> Result<Arc<PipelineConfig>> {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        let shared = &self.shared;

        let current = shared.config();
        let next = patch.apply(&current);
        next.validate()?;
        reject_self_chain(&shared.name, &next)?;

        let current_models = shared.models();
        let models = if next.models == current.models {
            current_models.clone()
        } else {
            Arc::new(ModelSet::build(
                &next.models,
                &self.registry,
                Some(&current_models),
            )?)
        };
        let current_overlay = shared.overlay();
        let overlay = if current_overlay.matches(&current, &next) {
            current_overlay.clone()
        } else {
            Arc::new(Overlay::from_config(&next)?)
        };

        let next = Arc::new(next);
        let restart = current.requires_restart(&next);
        shared.swap(next.clone(), models, overlay);

        if restart {
            let mut run = self.lock_run();
            if let Some(handle) = run.take() {
                let was_running = self.is_running();
                handle.shutdown();
                if was_running {
                    info!("🔄 管线 {} 配置变化, 重启采集", shared.name);
                    match self.launch(&next) {
                        Ok(handle) => *run = Some(handle),
                        Err(e) => {
                            shared.swap(current.clone(), current_models, current_overlay);
                            match self.launch(&current) {
                                Ok(handle) => *run = Some(handle),
                                Err(e) => error!("❌ 管线 {} 恢复原配置失败: {}", shared.name, e),
                            }
                            return Err(PipelineError::rejected(format!(
                                "新配置无法启动: {}",
                                e
                            )));
                        }
                    }
                }
            }
        }

        info!("⚙️ 管线 {} 配置已更新", shared.name);
        Ok(next)
    }

    /// 注册事件观察者
    pub fn on<F>(&self, kind: EventKind, observer: F)
    where
        F: Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(kind, observer);
    }

    /// 新建推流会话
    pub fn attach(&self, options: StreamOptions) -> ClientSession {
        self.shared.broadcaster.attach(options)
    }

    pub fn last_frame(&self) -> Option<Frame> {
        self.shared.last_frame.latest()
    }

    /// 最新帧缓存 (供下游串联管线读取)
    pub fn last_frame_cache(&self) -> Arc<LastFrame> {
        self.shared.last_frame.clone()
    }

    /// 所有计数模型清零
    pub fn reset_counts(&self) {
        self.shared.models().reset_counts();
        info!("🔢 管线 {} 计数已清零", self.shared.name);
    }

    pub fn health(&self) -> HealthReport {
        let shared = &self.shared;
        HealthReport {
            running: self.is_running(),
            frames_received: shared.metrics.frames_received(),
            frames_processed: shared.metrics.frames_processed(),
            frames_dropped: shared.metrics.frames_dropped(),
            queue_size: shared.queue_len(),
            active_clients: shared.broadcaster.active_clients(),
            last_error: shared.metrics.last_error(),
            inference_ms: shared.metrics.inference_stats(),
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        let shared = &self.shared;
        MetricsReport {
            avg_inference_ms: shared.metrics.inference_stats().avg,
            frames_served: shared.broadcaster.frames_served(),
            bytes_served: shared.broadcaster.bytes_served(),
            last_error: shared.metrics.last_error(),
            events_dropped: shared.events.dropped(),
            counters: shared.models().snapshots(),
            clients: shared.broadcaster.clients(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ========== 线程主循环 ==========

fn ingest_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    queue: Sender<Frame>,
    policy: QueuePolicy,
    stop: Arc<AtomicBool>,
) {
    let mut seq = 0u64;
    while !stop.load(Ordering::Relaxed) {
        match source.read() {
            Ok(ReadOutcome::Frame(raw)) => {
                seq += 1;
                let mut frame = Frame::new(seq, raw.data);
                frame.meta = raw.meta.map(Arc::new);
                shared.metrics.frame_received();
                shared.events.emit(PipelineEvent::Frame {
                    pipeline: shared.name.clone(),
                    seq,
                    timestamp: frame.timestamp,
                    bytes: frame.len(),
                });

                let delivered = match policy {
                    QueuePolicy::Drop => queue.try_send(frame).is_ok(),
                    QueuePolicy::Block { timeout_ms } => {
                        send_blocking(&queue, frame, Duration::from_millis(timeout_ms), &stop)
                    }
                };
                if !delivered {
                    shared.metrics.frame_dropped();
                    debug!("⏭️ 管线 {} 队列已满, 丢弃帧 #{}", shared.name, seq);
                }
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Exhausted) | Err(PipelineError::SourceExhausted) => {
                info!("🏁 管线 {} 视频源已结束 (共 {} 帧)", shared.name, seq);
                break;
            }
            Err(e) => {
                shared.report_error(&e);
                thread::sleep(Duration::from_millis(shared.config().read_retry_ms));
            }
        }
    }
    source.release();
    debug!("✅ 管线 {} 采集线程退出", shared.name);
}

/// 分段等待队列空位, 每段之间检查停止标志
fn send_blocking(queue: &Sender<Frame>, frame: Frame, timeout: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + timeout;
    let mut frame = frame;
    loop {
        let slice = deadline.saturating_duration_since(Instant::now()).min(POLL_INTERVAL);
        match queue.send_timeout(frame, slice) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    return false;
                }
                frame = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn dispatch_loop(
    shared: Arc<Shared>,
    queue: Receiver<Frame>,
    pool: WorkerPool,
    stop: Arc<AtomicBool>,
) {
    let mut last_report = Instant::now();
    let mut last_processed = shared.metrics.frames_processed();
    let mut exhausted = false;

    'frames: while !stop.load(Ordering::Relaxed) {
        let frame = match queue.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            // 采集结束且队列已取空
            Err(RecvTimeoutError::Disconnected) => {
                exhausted = !stop.load(Ordering::SeqCst);
                break;
            }
        };

        let mut job: Job = {
            let shared = shared.clone();
            let stop = stop.clone();
            Box::new(move || process_frame(&shared, frame, &stop))
        };
        loop {
            match pool.submit_timeout(job, POLL_INTERVAL) {
                Ok(()) => break,
                Err(returned) => {
                    if stop.load(Ordering::Relaxed) {
                        break 'frames;
                    }
                    job = returned;
                }
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let processed = shared.metrics.frames_processed();
            let fps = (processed - last_processed) as f64 / last_report.elapsed().as_secs_f64();
            debug!(
                "📊 管线 {}: {:.1} fps | 排队 {} | 丢弃 {} | 客户端 {}",
                shared.name,
                fps,
                queue.len(),
                shared.metrics.frames_dropped(),
                shared.broadcaster.active_clients()
            );
            last_report = Instant::now();
            last_processed = processed;
        }
    }

    pool.shutdown();
    if let Some(callbacks) = shared.events.detach_executor() {
        callbacks.shutdown();
    }
    if exhausted {
        // 视频源读完: 管线自行停止, 推流随之结束
        shared.broadcaster.close_all();
    }
    shared.running.store(false, Ordering::SeqCst);
    info!("🛑 管线 {} 处理线程退出", shared.name);
}

// ========== 单帧处理 ==========

fn process_frame(shared: &Shared, frame: Frame, stop: &AtomicBool) {
    let models = shared.models();
    if models.is_empty() {
        if !stop.load(Ordering::Relaxed) {
            deliver(shared, frame);
        }
        return;
    }

    let image = match image::load_from_memory(&frame.data) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            shared.report_error(&PipelineError::TransientRead(format!(
                "帧 #{} 解码失败: {}",
                frame.seq, e
            )));
            return;
        }
    };

    let results = detect_all(shared, &models, &image, frame.seq);
    if stop.load(Ordering::Relaxed) {
        return;
    }

    let overlay = shared.overlay();
    let mut canvas = image;
    let mut drawn = false;
    let now = Instant::now();

    for (slot, objects) in models.iter().zip(results) {
        let Some(objects) = objects else {
            continue;
        };
        let line_width = slot
            .spec
            .counting
            .as_ref()
            .map_or(DEFAULT_LINE_WIDTH, |c| c.line_width);

        if slot.spec.draw && !objects.is_empty() {
            overlay.draw_objects(&mut canvas, &objects, line_width);
            drawn = true;
        }

        if let (Some(counter), Some(spec)) = (&slot.counter, &slot.spec.counting) {
            let (events, snapshot) = {
                let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
                let events = counter.update(&objects, spec, now);
                (events, counter.snapshot())
            };
            for event in events {
                info!(
                    "🔢 管线 {} 模型 {} ID {} {:?} ({})",
                    shared.name, event.model, event.track_id, event.direction, event.label
                );
                shared.events.emit(PipelineEvent::Count {
                    pipeline: shared.name.clone(),
                    event,
                });
            }
            if slot.spec.draw {
                overlay.draw_counting(&mut canvas, spec, &snapshot);
                drawn = true;
            }
        }
    }

    let frame = if drawn {
        match overlay.encode(&canvas) {
            Ok(bytes) => frame.with_data(Arc::new(bytes)),
            Err(e) => {
                shared.report_error(&e);
                frame
            }
        }
    } else {
        frame
    };

    if !stop.load(Ordering::Relaxed) {
        deliver(shared, frame);
    }
}

/// 依次 (多模型时并行) 运行当前模型集合, 失败的模型返回 None
fn detect_all(
    shared: &Shared,
    models: &ModelSet,
    image: &RgbImage,
    seq: u64,
) -> Vec<Option<Vec<TrackedObject>>> {
    if models.len() == 1 {
        return models
            .iter()
            .map(|slot| run_model(shared, slot, image, seq))
            .collect();
    }

    thread::scope(|scope| {
        let handles: Vec<_> = models
            .iter()
            .map(|slot| (slot, scope.spawn(move || run_model(shared, slot, image, seq))))
            .collect();
        handles
            .into_iter()
            .map(|(slot, handle)| {
                handle.join().unwrap_or_else(|_| {
                    shared.report_error(&PipelineError::InferenceFailure {
                        model: slot.spec.id.clone(),
                        message: "推理线程崩溃".to_string(),
                    });
                    None
                })
            })
            .collect()
    })
}

fn run_model(
    shared: &Shared,
    slot: &ModelSlot,
    image: &RgbImage,
    seq: u64,
) -> Option<Vec<TrackedObject>> {
    let params = DetectParams::from(&slot.spec);
    let started = Instant::now();
    match slot.detector.detect(image, &params) {
        Ok(objects) => {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            shared.metrics.record_inference(elapsed_ms);
            if shared.events.has_observers(EventKind::Inference) {
                shared.events.emit(PipelineEvent::Inference {
                    pipeline: shared.name.clone(),
                    model: slot.spec.id.clone(),
                    seq,
                    elapsed_ms,
                    objects: objects.clone(),
                });
            }
            Some(objects)
        }
        Err(e) => {
            shared.report_error(&PipelineError::InferenceFailure {
                model: slot.spec.id.clone(),
                message: format!("{:#}", e),
            });
            None
        }
    }
}

/// 写入最新帧缓存并推送给客户端
fn deliver(shared: &Shared, frame: Frame) {
    shared.last_frame.store(frame.clone());
    shared.broadcaster.publish(&frame);
    shared.metrics.frame_processed();
}
