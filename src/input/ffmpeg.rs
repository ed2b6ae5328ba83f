//! FFmpeg 采集 (摄像头 / 容器格式视频文件)
//!
//! 解码线程通过 FrameFilter 拿到 YUV420P 帧, 转 RGB 后编码为 JPEG 送入有界通道。
//! 摄像头支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{FrameSource, Pacer, RawFrame, ReadOutcome};
use crate::error::{PipelineError, Result};
use crate::pipeline::compositor::encode_jpeg;

const CAPTURE_QUALITY: u8 = 90;
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_DIMENSION: u32 = 8192;

/// 解码帧过滤器: YUV420P → RGB → JPEG
struct CaptureFilter {
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    rgb: Vec<u8>,
}

impl FrameFilter for CaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("capture stopped".to_string());
        }

        let Some((w, h)) = (unsafe { self.convert(&frame) }) else {
            return Ok(None);
        };
        let Some(img) = RgbImage::from_raw(w, h, self.rgb.clone()) else {
            return Ok(None);
        };
        let mut jpeg = encode_jpeg(&img, CAPTURE_QUALITY).map_err(|e| e.to_string())?;

        loop {
            match self.tx.send_timeout(jpeg, Duration::from_millis(100)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return Err("capture stopped".to_string());
                    }
                    jpeg = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err("reader dropped".to_string());
                }
            }
        }
        Ok(Some(frame))
    }
}

impl CaptureFilter {
    /// 校验帧并转换到 self.rgb, 返回宽高
    unsafe fn convert(&mut self, frame: &Frame) -> Option<(u32, u32)> {
        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            return None;
        }
        let raw = &*frame.as_ptr();
        let (w, h) = (raw.width as u32, raw.height as u32);
        if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
            return None;
        }

        let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
        let y_stride = raw.linesize[0] as usize;
        let uv_stride = raw.linesize[1] as usize;
        if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
            return None;
        }
        if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
            return None;
        }

        self.rgb.resize((w * h * 3) as usize, 0);
        yuv420p_to_rgb(
            y_plane,
            u_plane,
            v_plane,
            y_stride,
            uv_stride,
            &mut self.rgb,
            w as usize,
            h as usize,
        );
        Some((w, h))
    }
}

/// 整数近似 BT.601
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    out: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;
        for x in 0..width {
            let luma = *y_plane.add(y_row + x) as i32;
            let u = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            out[idx] = (luma + ((v * 179) >> 7)).clamp(0, 255) as u8;
            out[idx + 1] = (luma - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
            out[idx + 2] = (luma + ((u * 227) >> 7)).clamp(0, 255) as u8;
            idx += 3;
        }
    }
}

#[derive(Clone, Debug)]
enum Target {
    Device {
        index: u32,
        url: String,
        format: &'static str,
        opts: HashMap<String, String>,
    },
    File {
        path: PathBuf,
    },
}

impl Target {
    fn input(&self) -> Input {
        match self {
            Target::Device {
                url, format, opts, ..
            } => {
                let input = Input::new(url.as_str()).set_format(*format);
                if opts.is_empty() {
                    input
                } else {
                    input.set_input_opts(opts.clone())
                }
            }
            Target::File { path } => Input::new(path.to_string_lossy().to_string()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Target::Device { index, url, .. } => format!("device:{} ({})", index, url),
            Target::File { path } => format!("video:{}", path.display()),
        }
    }
}

fn device_format() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dshow"
    }
    #[cfg(target_os = "macos")]
    {
        "avfoundation"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "v4l2"
    }
}

#[cfg(target_os = "windows")]
fn device_url(index: u32) -> Result<String> {
    let devices = ez_ffmpeg::device::get_input_video_devices()
        .map_err(|e| PipelineError::SourceUnavailable(format!("获取摄像头列表失败: {}", e)))?;
    devices
        .get(index as usize)
        .map(|name| format!("video={}", name))
        .ok_or_else(|| PipelineError::SourceUnavailable(format!("摄像头 {} 不存在", index)))
}

#[cfg(target_os = "macos")]
fn device_url(index: u32) -> Result<String> {
    Ok(index.to_string())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn device_url(index: u32) -> Result<String> {
    Ok(format!("/dev/video{}", index))
}

struct Capture {
    rx: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    /// 启动解码线程, 等待 FFmpeg 打开输入
    fn spawn(target: &Target) -> std::result::Result<Self, String> {
        let (tx, rx) = bounded(2);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let filter = CaptureFilter {
            tx,
            stop: stop.clone(),
            rgb: Vec::new(),
        };
        let input = target.input();
        let handle = thread::Builder::new()
            .name("ffmpeg-capture".into())
            .spawn(move || {
                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("capture", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);

                let ctx = match FfmpegContext::builder()
                    .input(input)
                    .filter_descs(["format=yuv420p"].into())
                    .output(out)
                    .build()
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("构建失败: {}", e)));
                        return;
                    }
                };
                let sch = match ctx.start() {
                    Ok(sch) => sch,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("启动失败: {}", e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = sch.wait();
                debug!("📹 解码循环结束");
            })
            .map_err(|e| e.to_string())?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                rx,
                stop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                Err("打开超时".to_string())
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // 解码线程在下一帧到达时退出; 卡住的设备不阻塞调用方
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct FfmpegSource {
    target: Target,
    capture: Option<Capture>,
    pacer: Pacer,
}

impl FfmpegSource {
    pub fn device(
        index: u32,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<u32>,
    ) -> Result<Self> {
        let mut opts = HashMap::new();
        if let Some(fps) = fps {
            opts.insert("framerate".to_string(), fps.to_string());
        }
        if let (Some(w), Some(h)) = (width, height) {
            opts.insert("video_size".to_string(), format!("{}x{}", w, h));
        }
        let target = Target::Device {
            index,
            url: device_url(index)?,
            format: device_format(),
            opts,
        };
        // 设备自身按采集帧率出帧
        Self::open(target, None)
    }

    pub fn file(path: &Path, fps: Option<f64>) -> Result<Self> {
        Self::open(
            Target::File {
                path: path.to_path_buf(),
            },
            fps,
        )
    }

    fn open(target: Target, fps: Option<f64>) -> Result<Self> {
        let capture = Capture::spawn(&target).map_err(|e| {
            PipelineError::SourceUnavailable(format!("{}: {}", target.describe(), e))
        })?;
        info!("🔗 FFmpeg 输入已打开: {}", target.describe());
        Ok(Self {
            target,
            capture: Some(capture),
            pacer: Pacer::new(fps),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<ReadOutcome> {
        let Some(capture) = self.capture.as_mut() else {
            return match self.target {
                Target::File { .. } => Ok(ReadOutcome::Exhausted),
                Target::Device { .. } => {
                    self.capture = Some(Capture::spawn(&self.target).map_err(|e| {
                        PipelineError::TransientRead(format!("{}: {}", self.target.describe(), e))
                    })?);
                    info!("🔄 摄像头已重新打开: {}", self.target.describe());
                    Ok(ReadOutcome::Idle)
                }
            };
        };

        match capture.rx.recv_timeout(READ_TIMEOUT) {
            Ok(jpeg) => {
                self.pacer.wait();
                Ok(ReadOutcome::Frame(RawFrame::new(jpeg)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                self.capture = None;
                match self.target {
                    Target::File { .. } => Ok(ReadOutcome::Exhausted),
                    Target::Device { .. } => {
                        warn!("⚠️ 摄像头断开: {}", self.target.describe());
                        Err(PipelineError::TransientRead(format!(
                            "{}: 解码结束",
                            self.target.describe()
                        )))
                    }
                }
            }
        }
    }

    fn release(&mut self) {
        self.capture = None;
    }

    fn describe(&self) -> String {
        self.target.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_gray_maps_to_gray() {
        let (w, h) = (4usize, 2usize);
        let y = vec![128u8; w * h];
        let u = vec![128u8; w / 2];
        let v = vec![128u8; w / 2];
        let mut out = vec![0u8; w * h * 3];
        unsafe {
            yuv420p_to_rgb(y.as_ptr(), u.as_ptr(), v.as_ptr(), w, w / 2, &mut out, w, h);
        }
        assert!(out.iter().all(|&c| c == 128));
    }

    #[test]
    fn test_missing_video_file_is_unavailable() {
        assert!(matches!(
            FfmpegSource::file(Path::new("/nonexistent/clip.mp4"), None),
            Err(PipelineError::SourceUnavailable(_))
        ));
    }
}
