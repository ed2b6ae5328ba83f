/// 检测 / 跟踪数据结构定义
/// Data structures shared by detectors, trackers and counters
use serde::Serialize;

/// 检测框 (Detection bounding box), 原图像素坐标
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    /// 以中心点和宽高构造
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, confidence: f32, class_id: u32) -> Self {
        Self::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            confidence,
            class_id,
        )
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// 获取中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// 模型原始输出 (检测后端 → 跟踪器)
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    /// 自带跟踪能力的后端可直接给出ID
    pub track_id: Option<u32>,
}

impl Detection {
    pub fn new(bbox: BBox, label: impl Into<String>) -> Self {
        Self {
            bbox,
            label: label.into(),
            track_id: None,
        }
    }

    pub fn with_track_id(mut self, id: u32) -> Self {
        self.track_id = Some(id);
        self
    }
}

/// 跟踪对象 (检测器 → 计数器 / 叠加渲染)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedObject {
    /// 未跟踪的对象没有ID, 不参与计数
    pub track_id: Option<u32>,
    pub label: String,
    pub bbox: BBox,
}

impl TrackedObject {
    pub fn class_id(&self) -> u32 {
        self.bbox.class_id
    }

    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }

    pub fn centroid(&self) -> (f32, f32) {
        self.bbox.center()
    }
}

impl From<Detection> for TrackedObject {
    fn from(det: Detection) -> Self {
        Self {
            track_id: det.track_id,
            label: det.label,
            bbox: det.bbox,
        }
    }
}
