// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测系统 (Detection System)
//!
//! - Model:    检测后端 (推理本身, 由外部提供)
//! - Detector: 后处理 (NMS / 置信度 / 类别过滤) + 目标追踪
//! - ModelRegistry: 按模型ID构造后端
pub mod bytetrack;
pub mod tracker;
pub mod types;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use image::RgbImage;
use tracing::info;

use crate::config::{ModelSpec, TrackerKind};
use crate::error::PipelineError;
pub use bytetrack::ByteTracker;
pub use tracker::{compute_iou, id_to_color};
pub use types::{BBox, Detection, TrackedObject};

/// 每次调用的检测参数 (取自当前配置快照)
#[derive(Clone, Debug, PartialEq)]
pub struct DetectParams {
    pub confidence: f32,
    pub iou: f32,
    pub classes: Option<Vec<u32>>,
}

impl From<&ModelSpec> for DetectParams {
    fn from(spec: &ModelSpec) -> Self {
        Self {
            confidence: spec.confidence,
            iou: spec.iou,
            classes: spec.classes.clone(),
        }
    }
}

/// 检测后端接口
///
/// 实现必须可并发调用 (多个工作线程共享同一实例)。
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// 推理, 返回原图坐标系下的检测框
    fn infer(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<Detection>>;
}

/// 检测器接口 (推理 + 跟踪)
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<TrackedObject>>;
}

/// 类别感知的非极大值抑制
pub fn non_max_suppression(dets: &mut Vec<Detection>, iou_threshold: f32) {
    dets.sort_by(|a, b| {
        b.bbox
            .confidence
            .partial_cmp(&a.bbox.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept = 0;
    for index in 0..dets.len() {
        let suppressed = (0..kept).any(|prev| {
            dets[prev].bbox.class_id == dets[index].bbox.class_id
                && compute_iou(&dets[prev].bbox, &dets[index].bbox) > iou_threshold
        });
        if !suppressed {
            dets.swap(kept, index);
            kept += 1;
        }
    }
    dets.truncate(kept);
}

/// 后端 + 后处理 + 追踪器
///
/// 推理可并行, 追踪器状态由互斥锁串行化。
pub struct TrackingDetector {
    model: Box<dyn Model>,
    tracker: Option<Mutex<ByteTracker>>,
}

impl TrackingDetector {
    pub fn new(model: Box<dyn Model>, tracker: Option<ByteTracker>) -> Self {
        Self {
            model,
            tracker: tracker.map(Mutex::new),
        }
    }

    /// 按模型配置构造: 只有带计数区域且选择 bytetrack 的模型才启用追踪
    pub fn from_spec(model: Box<dyn Model>, spec: &ModelSpec) -> Self {
        let tracker = spec
            .counting
            .as_ref()
            .filter(|c| c.tracker == TrackerKind::Bytetrack)
            .map(|c| ByteTracker::new(c.tracker_params.clone()));
        Self::new(model, tracker)
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }
}

impl Detector for TrackingDetector {
    fn detect(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<TrackedObject>> {
        let mut dets = self.model.infer(image, params)?;

        // 追踪时保留低分框, 只用于延续已有轨迹
        let floor = match &self.tracker {
            Some(tracker) => {
                let low = tracker.lock().unwrap_or_else(|e| e.into_inner()).low_score_threshold();
                params.confidence.min(low)
            }
            None => params.confidence,
        };
        dets.retain(|d| {
            d.bbox.confidence >= floor
                && params
                    .classes
                    .as_ref()
                    .map_or(true, |cls| cls.contains(&d.bbox.class_id))
        });
        non_max_suppression(&mut dets, params.iou);

        match &self.tracker {
            Some(tracker) => {
                let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
                Ok(tracker.update(&dets, params.confidence))
            }
            None => Ok(dets.into_iter().map(TrackedObject::from).collect()),
        }
    }
}

/// 空后端: 不产生任何检测 (只转发画面)
pub struct Passthrough;

impl Model for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn infer(&self, _image: &RgbImage, _params: &DetectParams) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

pub type ModelFactory = Arc<dyn Fn(&ModelSpec) -> Result<Box<dyn Model>> + Send + Sync>;

/// 模型注册表: 精确ID优先, 其次默认工厂
pub struct ModelRegistry {
    factories: RwLock<HashMap<String, ModelFactory>>,
    fallback: RwLock<Option<ModelFactory>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        };
        registry.register("passthrough", |_| Ok(Box::new(Passthrough)));
        registry
    }

    pub fn register<F>(&self, id: &str, factory: F)
    where
        F: Fn(&ModelSpec) -> Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Arc::new(factory));
        info!("📦 注册模型后端: {}", id);
    }

    pub fn set_fallback<F>(&self, factory: F)
    where
        F: Fn(&ModelSpec) -> Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        *self.fallback.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(factory));
    }

    /// 构造检测器, 失败统一为配置拒绝
    pub fn build(&self, spec: &ModelSpec) -> std::result::Result<TrackingDetector, PipelineError> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(&spec.id).cloned()
        }
        .or_else(|| self.fallback.read().unwrap_or_else(|e| e.into_inner()).clone())
        .ok_or_else(|| PipelineError::rejected(format!("未知模型: {}", spec.id)))?;

        let model = factory(spec)
            .map_err(|e| PipelineError::rejected(format!("模型 {} 加载失败: {:#}", spec.id, e)))?;
        let detector = TrackingDetector::from_spec(model, spec);
        info!("✅ 模型 {} 加载成功 (后端 {})", spec.id, detector.model_name());
        Ok(detector)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
