//! 多客户端推流 (Multi-client Broadcaster)
//!
//! 每个客户端一个单槽队列: 新帧到来时挤掉未取走的旧帧, 慢客户端永远只看到最新画面,
//! 也不会拖慢推理线程。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::frame_interval;
use crate::frame::Frame;
use crate::pipeline::compositor::encode_jpeg;

/// multipart 分隔符
pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// 默认读超时 (超时后发送"无信号"占位图)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// 读超时下限, 避免占位图刷屏
pub const MIN_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// "无信号"占位图
pub static NO_SIGNAL_JPEG: Lazy<Arc<Vec<u8>>> = Lazy::new(|| Arc::new(render_no_signal()));

fn render_no_signal() -> Vec<u8> {
    let (w, h) = (320u32, 240u32);
    let mut img = RgbImage::from_pixel(w, h, Rgb([32, 32, 32]));
    draw_filled_rect_mut(&mut img, Rect::at(0, 0).of_size(w, 12), Rgb([128, 0, 0]));
    for off in -1..=1 {
        let o = off as f32;
        draw_line_segment_mut(&mut img, (40.0 + o, 40.0), (280.0 + o, 200.0), Rgb([200, 40, 40]));
        draw_line_segment_mut(&mut img, (280.0 + o, 40.0), (40.0 + o, 200.0), Rgb([200, 40, 40]));
    }
    encode_jpeg(&img, 70).unwrap_or_default()
}

/// 编码一个 multipart 分片
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// 客户端拉流参数
#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    /// 限速 (None = 不限)
    pub fps: Option<f64>,
    pub read_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            fps: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct SessionStats {
    frames_served: AtomicU64,
    bytes_served: AtomicU64,
    frames_dropped: AtomicU64,
    no_signal: AtomicU64,
}

struct SessionEntry {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    stats: Arc<SessionStats>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Shared {
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_id: AtomicU64,
    frames_served: AtomicU64,
    bytes_served: AtomicU64,
}

/// 单个客户端统计
#[derive(Clone, Debug, Serialize)]
pub struct ClientReport {
    pub id: u64,
    pub connected_at: DateTime<Utc>,
    pub frames_served: u64,
    pub bytes_served: u64,
    pub frames_dropped: u64,
    pub no_signal: u64,
}

/// 推流分发器 (clone 共享同一组会话)
#[derive(Clone, Default)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新客户端
    pub fn attach(&self, options: StreamOptions) -> ClientSession {
        let interval = frame_interval(options.fps);
        let read_timeout = options.read_timeout.max(MIN_READ_TIMEOUT);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = bounded(1);
        let stats = Arc::new(SessionStats::default());
        let entry = SessionEntry {
            tx,
            rx: rx.clone(),
            stats: stats.clone(),
            connected_at: Utc::now(),
        };
        let active = {
            let mut sessions = self.lock();
            sessions.insert(id, entry);
            sessions.len()
        };
        info!("📺 客户端 #{} 接入 (在线 {})", id, active);

        ClientSession {
            id,
            rx,
            stats,
            shared: Arc::downgrade(&self.shared),
            interval,
            read_timeout,
            last_emit: None,
        }
    }

    /// 分发新帧: 每个客户端只保留最新一帧
    pub fn publish(&self, frame: &Frame) {
        let sessions = self.lock();
        for entry in sessions.values() {
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    if entry.rx.try_recv().is_ok() {
                        entry.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    let _ = entry.tx.try_send(frame);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// 断开所有客户端 (管线停止)
    pub fn close_all(&self) {
        let closed: Vec<SessionEntry> = self.lock().drain().map(|(_, e)| e).collect();
        if !closed.is_empty() {
            info!("🔌 断开全部客户端 ({})", closed.len());
        }
    }

    pub fn active_clients(&self) -> usize {
        self.lock().len()
    }

    pub fn frames_served(&self) -> u64 {
        self.shared.frames_served.load(Ordering::Relaxed)
    }

    pub fn bytes_served(&self) -> u64 {
        self.shared.bytes_served.load(Ordering::Relaxed)
    }

    pub fn clients(&self) -> Vec<ClientReport> {
        let sessions = self.lock();
        let mut reports: Vec<ClientReport> = sessions
            .iter()
            .map(|(id, e)| ClientReport {
                id: *id,
                connected_at: e.connected_at,
                frames_served: e.stats.frames_served.load(Ordering::Relaxed),
                bytes_served: e.stats.bytes_served.load(Ordering::Relaxed),
                frames_dropped: e.stats.frames_dropped.load(Ordering::Relaxed),
                no_signal: e.stats.no_signal.load(Ordering::Relaxed),
            })
            .collect();
        reports.sort_by_key(|r| r.id);
        reports
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.shared.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 一次取帧的结果
#[derive(Clone, Debug)]
pub enum Delivery {
    Frame(Frame),
    /// 读超时, 附带占位图
    NoSignal(Arc<Vec<u8>>),
    /// 分发器已关闭
    Closed,
}

/// 客户端会话, drop 时自动注销
pub struct ClientSession {
    id: u64,
    rx: Receiver<Frame>,
    stats: Arc<SessionStats>,
    shared: Weak<Shared>,
    interval: Option<Duration>,
    read_timeout: Duration,
    last_emit: Option<Instant>,
}

impl ClientSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 阻塞取下一帧 (先按 fps 限速, 再最多等待 read_timeout)
    pub fn next(&mut self) -> Delivery {
        if let (Some(interval), Some(last)) = (self.interval, self.last_emit) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        let delivery = match self.rx.recv_timeout(self.read_timeout) {
            Ok(frame) => {
                let len = frame.len() as u64;
                self.stats.frames_served.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_served.fetch_add(len, Ordering::Relaxed);
                if let Some(shared) = self.shared.upgrade() {
                    shared.frames_served.fetch_add(1, Ordering::Relaxed);
                    shared.bytes_served.fetch_add(len, Ordering::Relaxed);
                }
                Delivery::Frame(frame)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.no_signal.fetch_add(1, Ordering::Relaxed);
                Delivery::NoSignal(NO_SIGNAL_JPEG.clone())
            }
            Err(RecvTimeoutError::Disconnected) => return Delivery::Closed,
        };
        self.last_emit = Some(Instant::now());
        delivery
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut sessions = shared.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.remove(&self.id).is_some() {
                debug!("👋 客户端 #{} 断开 (在线 {})", self.id, sessions.len());
            }
        }
    }
}
