//! 帧数据结构 (采集线程 → 推理线程 → 推流客户端)

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// 已编码帧 (JPEG)
///
/// 字节用 Arc 共享, clone 不复制图像数据。
#[derive(Clone, Debug)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Arc<Vec<u8>>,
    pub meta: Option<Arc<BTreeMap<String, String>>>,
}

impl Frame {
    pub fn new(seq: u64, data: Arc<Vec<u8>>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            data,
            meta: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 替换图像字节, 保留序号/时间戳/元数据
    pub fn with_data(&self, data: Arc<Vec<u8>>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};

    /// 纯色测试 JPEG
    pub fn solid_jpeg(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([value, value / 2, 255 - value]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode_image(&img)
            .unwrap();
        out
    }
}
