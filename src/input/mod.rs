/// 视频输入系统 (Frame Source Adapter)
///
/// 统一的帧源接口, 由采集线程独占驱动:
/// - file:     MJPEG 文件 / 图片 / 图片目录 (容器格式需 ffmpeg 特性)
/// - stream:   上游 multipart HTTP 流 / 快照地址
/// - pipeline: 串联另一条管线的最新合成帧
/// - device:   本地摄像头 (需 ffmpeg 特性)
pub mod chained;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod file;
pub mod multipart;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::{frame_interval, SourceSpec};
use crate::error::{PipelineError, Result};
use crate::pipeline::compositor::LastFrame;

/// 源输出的原始帧 (JPEG)
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Arc<Vec<u8>>,
    pub meta: Option<BTreeMap<String, String>>,
}

impl RawFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            meta: None,
        }
    }
}

/// 一次读取的结果
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RawFrame),
    /// 暂时没有新帧
    Idle,
    /// 有限源已读完
    Exhausted,
}

/// 帧源
pub trait FrameSource: Send {
    /// 读取下一帧; 可恢复的失败返回 `TransientRead`
    fn read(&mut self) -> Result<ReadOutcome>;

    /// 释放底层资源 (drop 时也会释放)
    fn release(&mut self) {}

    fn describe(&self) -> String;
}

/// 按名称查找管线的最新帧缓存 (串联源使用)
pub type UpstreamLookup = Arc<dyn Fn(&str) -> Option<Arc<LastFrame>> + Send + Sync>;

/// 打开帧源时的上下文
#[derive(Clone)]
pub struct SourceContext {
    /// 当前管线名 (拒绝串联自身)
    pub pipeline: String,
    pub upstream: Option<UpstreamLookup>,
}

impl SourceContext {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            upstream: None,
        }
    }
}

/// 按描述打开帧源
pub fn open(spec: &SourceSpec, ctx: &SourceContext) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match spec {
        SourceSpec::File { path, fps } => file::open(path, *fps)?,
        SourceSpec::Stream { url, timeout_ms } => Box::new(multipart::StreamSource::connect(
            url,
            timeout_ms.map(Duration::from_millis),
        )?),
        SourceSpec::Pipeline { name } => {
            if *name == ctx.pipeline {
                return Err(PipelineError::SourceUnavailable(format!(
                    "管线 {} 不能串联自身",
                    name
                )));
            }
            let cache = ctx
                .upstream
                .as_ref()
                .and_then(|lookup| lookup(name))
                .ok_or_else(|| {
                    PipelineError::SourceUnavailable(format!("上游管线不存在: {}", name))
                })?;
            Box::new(chained::PipelineSource::new(name, cache))
        }
        #[cfg(feature = "ffmpeg")]
        SourceSpec::Device {
            index,
            width,
            height,
            fps,
        } => Box::new(ffmpeg::FfmpegSource::device(*index, *width, *height, *fps)?),
        #[cfg(not(feature = "ffmpeg"))]
        SourceSpec::Device { index, .. } => {
            return Err(PipelineError::SourceUnavailable(format!(
                "摄像头 {} 需要启用 ffmpeg 特性",
                index
            )))
        }
    };
    info!("🎥 视频源已打开: {}", source.describe());
    Ok(source)
}

/// 读取限速: 每个周期只补足剩余时间, 超时不追帧
#[derive(Debug)]
pub struct Pacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(fps: Option<f64>) -> Self {
        Self {
            interval: frame_interval(fps),
            last: None,
        }
    }

    pub fn wait(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// 从缓冲区提取第一张完整 JPEG (SOI..EOI), 并丢弃之前的字节
pub(crate) fn take_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let soi = match buf.windows(2).position(|w| w == [0xFF, 0xD8]) {
        Some(pos) => pos,
        None => {
            // 保留最后一个字节, 可能是被截断的标记
            let keep = buf.last().copied().filter(|b| *b == 0xFF);
            buf.clear();
            buf.extend(keep);
            return None;
        }
    };
    let eoi = buf[soi + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .map(|p| soi + 2 + p)?;
    let jpeg = buf[soi..eoi + 2].to_vec();
    buf.drain(..eoi + 2);
    Some(jpeg)
}
