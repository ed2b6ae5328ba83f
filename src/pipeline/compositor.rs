//! 叠加渲染与最新帧缓存
//!
//! - Overlay:   检测框 / 计数区域 / 计数文字绘制 + JPEG编码
//! - LastFrame: 最近一帧完整合成结果 (快照接口 / 串联管线读取)

use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;

use crate::config::{CountingSpec, PipelineConfig};
use crate::counting::{CountSnapshot, Region};
use crate::detection::{id_to_color, TrackedObject};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;

const REGION_COLOR: Rgb<u8> = Rgb([123, 0, 104]);
const UNTRACKED_COLOR: Rgb<u8> = Rgb([64, 255, 64]);
const LABEL_BG: Rgb<u8> = Rgb([17, 31, 104]);
const LABEL_FG: Rgb<u8> = Rgb([255, 255, 255]);

/// 叠加渲染参数 (字体 + 编码质量), 随配置整体替换
pub struct Overlay {
    font: Option<FontArc>,
    quality: u8,
}

impl Overlay {
    pub fn new(font: Option<FontArc>, quality: u8) -> Self {
        Self { font, quality }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => Some(load_font(path)?),
            None => None,
        };
        Ok(Self::new(font, config.jpeg_quality))
    }

    /// 字体 / 质量是否与配置一致
    pub fn matches(&self, old: &PipelineConfig, new: &PipelineConfig) -> bool {
        old.font_path == new.font_path && self.quality == new.jpeg_quality
    }

    /// 画检测框 (跟踪对象按ID配色) 与标签
    pub fn draw_objects(&self, img: &mut RgbImage, objects: &[TrackedObject], line_width: u32) {
        for obj in objects {
            let color = obj.track_id.map_or(UNTRACKED_COLOR, |id| Rgb(id_to_color(id)));
            let b = &obj.bbox;
            thick_rect(img, b.x1, b.y1, b.x2, b.y2, line_width, color);

            let caption = match obj.track_id {
                Some(id) => format!("{} #{} {:.2}", obj.label, id, obj.confidence()),
                None => format!("{} {:.2}", obj.label, obj.confidence()),
            };
            self.label(img, b.x1 as i32, b.y1 as i32 - 18, &caption, color, LABEL_FG);
        }
    }

    /// 画计数区域与分类计数
    pub fn draw_counting(&self, img: &mut RgbImage, spec: &CountingSpec, snapshot: &CountSnapshot) {
        if spec.draw_region {
            if let Some(region) = Region::from_points(&spec.region) {
                let outline = region.outline();
                for pair in outline.windows(2) {
                    thick_line(img, pair[0], pair[1], spec.line_width * 2, REGION_COLOR);
                }
            }
        }

        let margin = (spec.line_width * 2) as i32;
        let mut y = margin;
        for (label, tally) in &snapshot.classwise {
            let mut parts = Vec::new();
            if spec.show_in && tally.in_count > 0 {
                parts.push(format!("IN {}", tally.in_count));
            }
            if spec.show_out && tally.out_count > 0 {
                parts.push(format!("OUT {}", tally.out_count));
            }
            if parts.is_empty() {
                continue;
            }
            let text = format!("{}: {}", label, parts.join(" "));
            self.label(img, margin, y, &text, LABEL_BG, LABEL_FG);
            y += 26;
        }
    }

    /// 文字标签 (未配置字体时跳过)
    fn label(&self, img: &mut RgbImage, x: i32, y: i32, text: &str, bg: Rgb<u8>, fg: Rgb<u8>) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(18.0);
        let (w, h) = text_size(scale, font, text);
        let y = y.max(0);
        draw_filled_rect_mut(img, Rect::at(x, y).of_size(w.max(1) + 6, h.max(1) + 6), bg);
        draw_text_mut(img, fg, x + 3, y + 3, scale, font, text);
    }

    pub fn encode(&self, img: &RgbImage) -> Result<Vec<u8>> {
        encode_jpeg(img, self.quality)
    }
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(img.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(img)
        .map_err(|e| PipelineError::TransientRead(format!("JPEG编码失败: {}", e)))?;
    Ok(out)
}

pub fn load_font(path: &Path) -> Result<FontArc> {
    let data = std::fs::read(path).map_err(|e| {
        PipelineError::rejected(format!("读取字体失败 {}: {}", path.display(), e))
    })?;
    FontArc::try_from_vec(data)
        .map_err(|e| PipelineError::rejected(format!("字体无效 {}: {}", path.display(), e)))
}

fn thick_rect(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, width: u32, color: Rgb<u8>) {
    let (x1, y1) = (x1.round() as i32, y1.round() as i32);
    let (x2, y2) = (x2.round() as i32, y2.round() as i32);
    for i in 0..width.max(1) as i32 {
        let w = x2 - x1 - 2 * i;
        let h = y2 - y1 - 2 * i;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(img, Rect::at(x1 + i, y1 + i).of_size(w as u32, h as u32), color);
    }
}

fn thick_line(img: &mut RgbImage, a: (f32, f32), b: (f32, f32), width: u32, color: Rgb<u8>) {
    let half = (width.max(1) / 2) as i32;
    // 按线的主方向做垂直偏移
    let steep = (b.1 - a.1).abs() > (b.0 - a.0).abs();
    for off in -half..=half {
        let o = off as f32;
        let (pa, pb) = if steep {
            ((a.0 + o, a.1), (b.0 + o, b.1))
        } else {
            ((a.0, a.1 + o), (b.0, b.1 + o))
        };
        draw_line_segment_mut(img, pa, pb, color);
    }
}

/// 最新合成帧缓存
///
/// 版本号每次写入递增; 上游重启后帧序号归零, 版本号不会。
#[derive(Default)]
pub struct LastFrame {
    slot: Mutex<(u64, Option<Frame>)>,
    cond: Condvar,
}

impl LastFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.0 += 1;
        slot.1 = Some(frame);
        drop(slot);
        self.cond.notify_all();
    }

    pub fn latest(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).1.clone()
    }

    /// 等待版本号大于 after 的帧, 返回 (版本号, 帧); 超时返回 None
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<(u64, Frame)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if slot.0 > after {
                if let Some(frame) = slot.1.as_ref() {
                    return Some((slot.0, frame.clone()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.cond.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_draw_objects_marks_pixels() {
        let overlay = Overlay::new(None, 80);
        let mut img = RgbImage::new(100, 100);
        let obj = TrackedObject {
            track_id: Some(3),
            label: "person".into(),
            bbox: BBox::new(10.0, 10.0, 60.0, 80.0, 0.9, 0),
        };
        overlay.draw_objects(&mut img, &[obj], 2);
        assert_eq!(*img.get_pixel(10, 40), Rgb(id_to_color(3)));
        assert_eq!(*img.get_pixel(30, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_region_line() {
        let overlay = Overlay::new(None, 80);
        let mut img = RgbImage::new(100, 100);
        let spec = CountingSpec::new(vec![[50.0, 0.0], [50.0, 99.0]]);
        overlay.draw_counting(&mut img, &spec, &CountSnapshot::default());
        assert_eq!(*img.get_pixel(50, 50), REGION_COLOR);
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let bytes = encode_jpeg(&RgbImage::new(16, 16), 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[test]
    fn test_missing_font_is_rejected() {
        assert!(matches!(
            load_font(Path::new("/nonexistent/font.ttf")),
            Err(PipelineError::ConfigRejected(_))
        ));
    }

    #[test]
    fn test_wait_newer_wakes_on_store() {
        let cache = Arc::new(LastFrame::new());
        assert!(cache.wait_newer(0, Duration::from_millis(20)).is_none());

        let writer = cache.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.store(Frame::new(1, Arc::new(vec![1, 2, 3])));
        });
        let (version, frame) = cache.wait_newer(0, Duration::from_secs(2)).unwrap();
        assert_eq!(frame.seq, 1);
        handle.join().unwrap();

        // 已经读过的版本不会重复返回
        assert!(cache.wait_newer(version, Duration::from_millis(20)).is_none());
        assert_eq!(cache.latest().unwrap().seq, 1);

        // 上游重启后序号归零, 仍然是新帧
        cache.store(Frame::new(1, Arc::new(vec![9])));
        let (_, frame) = cache.wait_newer(version, Duration::from_millis(20)).unwrap();
        assert_eq!(*frame.data, vec![9]);
    }
}
