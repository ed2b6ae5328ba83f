//! 管线配置 - 通过JSON文件 / HTTP PATCH 调整参数
//! Pipeline, model and counting configuration

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

// ========== 视频源 ==========

/// 帧率取值范围 (源读取限速 / 客户端推流限速)
pub const MIN_FPS: f64 = 0.1;
pub const MAX_FPS: f64 = 1000.0;

/// Block 策略单帧最长等待
pub const MAX_BLOCK_TIMEOUT_MS: u64 = 10_000;

/// fps → 帧间隔; 非正数 / 非有限值表示不限速, 其余夹到 [MIN_FPS, MAX_FPS]
pub fn frame_interval(fps: Option<f64>) -> Option<Duration> {
    fps.filter(|f| f.is_finite() && *f > 0.0)
        .map(|f| Duration::from_secs_f64(1.0 / f.clamp(MIN_FPS, MAX_FPS)))
}

fn fps_in_range(fps: f64) -> bool {
    fps.is_finite() && (MIN_FPS..=MAX_FPS).contains(&fps)
}

/// 视频源描述 (四选一)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// 本地采集设备
    Device {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
    },
    /// 视频文件 / MJPEG 文件 / 图片目录
    File {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
    },
    /// 上游 multipart HTTP 流 (或单张快照地址)
    Stream {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// 串联另一条管线的输出
    Pipeline { name: String },
}

impl SourceSpec {
    fn validate(&self) -> Result<()> {
        match self {
            SourceSpec::Device { fps: Some(fps), .. } if !fps_in_range(*fps as f64) => Err(
                PipelineError::rejected(format!("device fps 取值范围 {}-{}", MIN_FPS, MAX_FPS)),
            ),
            SourceSpec::File { path, fps } => {
                if path.as_os_str().is_empty() {
                    return Err(PipelineError::rejected("file path 不能为空"));
                }
                match fps {
                    Some(f) if !fps_in_range(*f) => Err(PipelineError::rejected(format!(
                        "file fps 取值范围 {}-{}",
                        MIN_FPS, MAX_FPS
                    ))),
                    _ => Ok(()),
                }
            }
            SourceSpec::Stream { url, .. } => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(())
                } else {
                    Err(PipelineError::rejected(format!("不支持的流地址: {}", url)))
                }
            }
            SourceSpec::Pipeline { name } if name.trim().is_empty() => {
                Err(PipelineError::rejected("上游管线名不能为空"))
            }
            _ => Ok(()),
        }
    }
}

/// 字符串简写: "0" → 设备, "http://..." → 流, "pipeline:name" → 串联, 其它 → 文件
impl FromStr for SourceSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PipelineError::rejected("source 不能为空"));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(SourceSpec::Device {
                index,
                width: None,
                height: None,
                fps: None,
            });
        }
        if let Some(name) = s.strip_prefix("pipeline:") {
            return Ok(SourceSpec::Pipeline {
                name: name.to_string(),
            });
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(SourceSpec::Stream {
                url: s.to_string(),
                timeout_ms: None,
            });
        }
        Ok(SourceSpec::File {
            path: PathBuf::from(s),
            fps: None,
        })
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Device { index, .. } => write!(f, "device:{}", index),
            SourceSpec::File { path, .. } => write!(f, "file:{}", path.display()),
            SourceSpec::Stream { url, .. } => write!(f, "stream:{}", url),
            SourceSpec::Pipeline { name } => write!(f, "pipeline:{}", name),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceRepr {
    Short(String),
    Full(SourceSpec),
}

impl SourceRepr {
    fn into_spec<E: serde::de::Error>(self) -> std::result::Result<SourceSpec, E> {
        match self {
            SourceRepr::Short(s) => s.parse().map_err(E::custom),
            SourceRepr::Full(spec) => Ok(spec),
        }
    }
}

fn de_source<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SourceSpec, D::Error> {
    SourceRepr::deserialize(d)?.into_spec()
}

fn de_opt_source<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<SourceSpec>, D::Error> {
    Option::<SourceRepr>::deserialize(d)?
        .map(SourceRepr::into_spec)
        .transpose()
}

// ========== 队列策略 ==========

/// 帧队列满时的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// 丢弃新帧 (默认)
    #[default]
    Drop,
    /// 阻塞等待, 超时后丢弃
    Block { timeout_ms: u64 },
}

// ========== 跟踪 / 计数 ==========

/// 跟踪算法
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    #[default]
    Bytetrack,
    /// 不跟踪, 直接使用模型给出的ID
    #[serde(rename = "none")]
    Off,
}

/// ByteTrack + 卡尔曼滤波参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub max_lost_frames: u32,      // 最大丢失帧数
    pub high_score_threshold: f32, // 高分阈值
    pub low_score_threshold: f32,  // 低分阈值 (救援)
    pub high_iou_threshold: f32,   // 高分IOU阈值
    pub low_iou_threshold: f32,    // 低分IOU阈值
    pub process_noise: f32,        // 过程噪声 q
    pub observation_noise: f32,    // 观测噪声 r
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_lost_frames: 60,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.4,
            low_iou_threshold: 0.3,
            process_noise: 0.1,
            observation_noise: 0.5,
        }
    }
}

/// 计数区域与参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CountingSpec {
    /// 2个点 = 计数线, ≥3个点 = 多边形
    pub region: Vec<[f32; 2]>,
    #[serde(default = "default_true")]
    pub show_in: bool,
    #[serde(default = "default_true")]
    pub show_out: bool,
    #[serde(default = "default_true")]
    pub draw_region: bool,
    #[serde(default = "default_line_width")]
    pub line_width: u32,
    /// 去抖窗口 / 过期时间
    #[serde(default = "default_id_timeout_ms")]
    pub id_timeout_ms: u64,
    /// 轨迹点数达到该值才参与计数
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,
    #[serde(default)]
    pub tracker: TrackerKind,
    #[serde(default)]
    pub tracker_params: TrackerParams,
}

impl CountingSpec {
    pub fn new(region: Vec<[f32; 2]>) -> Self {
        Self {
            region,
            show_in: true,
            show_out: true,
            draw_region: true,
            line_width: default_line_width(),
            id_timeout_ms: default_id_timeout_ms(),
            min_frames: default_min_frames(),
            tracker: TrackerKind::default(),
            tracker_params: TrackerParams::default(),
        }
    }

    fn validate(&self, model: &str) -> Result<()> {
        if self.region.len() < 2 {
            return Err(PipelineError::rejected(format!(
                "模型 {} 的计数区域至少需要2个点",
                model
            )));
        }
        if self
            .region
            .iter()
            .any(|p| !p[0].is_finite() || !p[1].is_finite())
        {
            return Err(PipelineError::rejected(format!(
                "模型 {} 的计数区域包含非法坐标",
                model
            )));
        }
        if self.region.len() == 2 && self.region[0] == self.region[1] {
            return Err(PipelineError::rejected(format!(
                "模型 {} 的计数线长度为0",
                model
            )));
        }
        if self.min_frames == 0 || self.line_width == 0 {
            return Err(PipelineError::rejected(format!(
                "模型 {} 的 min_frames / line_width 必须大于0",
                model
            )));
        }
        Ok(())
    }
}

// ========== 模型 ==========

/// 单个模型配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default = "default_true")]
    pub draw: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    /// 类别过滤 (None = 全部)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counting: Option<CountingSpec>,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            draw: true,
            confidence: default_confidence(),
            iou: default_iou(),
            classes: None,
            counting: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::rejected("模型ID不能为空"));
        }
        for (name, v) in [("confidence", self.confidence), ("iou", self.iou)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::rejected(format!(
                    "模型 {} 的 {} 超出范围 [0, 1]: {}",
                    self.id, name, v
                )));
            }
        }
        if let Some(counting) = &self.counting {
            counting.validate(&self.id)?;
        }
        Ok(())
    }
}

// ========== 管线 ==========

/// 单条管线配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(deserialize_with = "de_source")]
    pub source: SourceSpec,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// 读取失败后的重试间隔
    #[serde(default = "default_read_retry_ms")]
    pub read_retry_ms: u64,
    /// 叠加文字字体 (未配置时只画框)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            models: Vec::new(),
            queue_depth: default_queue_depth(),
            queue_policy: QueuePolicy::default(),
            workers: default_workers(),
            callback_workers: default_callback_workers(),
            jpeg_quality: default_jpeg_quality(),
            read_retry_ms: default_read_retry_ms(),
            font_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        if self.queue_depth == 0 {
            return Err(PipelineError::rejected("queue_depth 必须大于0"));
        }
        if self.workers == 0 || self.callback_workers == 0 {
            return Err(PipelineError::rejected(
                "workers / callback_workers 必须大于0",
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(PipelineError::rejected("jpeg_quality 取值范围 1-100"));
        }
        if let QueuePolicy::Block { timeout_ms } = self.queue_policy {
            if timeout_ms > MAX_BLOCK_TIMEOUT_MS {
                return Err(PipelineError::rejected(format!(
                    "queue_policy.timeout_ms 不能超过 {}",
                    MAX_BLOCK_TIMEOUT_MS
                )));
            }
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            model.validate()?;
            if !seen.insert(model.id.as_str()) {
                return Err(PipelineError::rejected(format!(
                    "模型ID重复: {}",
                    model.id
                )));
            }
        }
        Ok(())
    }

    /// 这些字段变化时需要重启采集/工作线程
    pub fn requires_restart(&self, next: &PipelineConfig) -> bool {
        self.source != next.source
            || self.queue_depth != next.queue_depth
            || self.queue_policy != next.queue_policy
            || self.workers != next.workers
            || self.callback_workers != next.callback_workers
    }
}

/// 局部配置更新 (未知字段直接拒绝)
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default, deserialize_with = "de_opt_source")]
    pub source: Option<SourceSpec>,
    pub models: Option<Vec<ModelSpec>>,
    pub queue_depth: Option<usize>,
    pub queue_policy: Option<QueuePolicy>,
    pub workers: Option<usize>,
    pub callback_workers: Option<usize>,
    pub jpeg_quality: Option<u8>,
    pub read_retry_ms: Option<u64>,
    /// 空字符串表示清除字体
    pub font_path: Option<PathBuf>,
}

impl ConfigPatch {
    /// 在 base 上合并, 返回新配置 (base 不变)
    pub fn apply(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut next = base.clone();
        if let Some(source) = &self.source {
            next.source = source.clone();
        }
        if let Some(models) = &self.models {
            next.models = models.clone();
        }
        if let Some(v) = self.queue_depth {
            next.queue_depth = v;
        }
        if let Some(v) = self.queue_policy {
            next.queue_policy = v;
        }
        if let Some(v) = self.workers {
            next.workers = v;
        }
        if let Some(v) = self.callback_workers {
            next.callback_workers = v;
        }
        if let Some(v) = self.jpeg_quality {
            next.jpeg_quality = v;
        }
        if let Some(v) = self.read_retry_ms {
            next.read_retry_ms = v;
        }
        if let Some(path) = &self.font_path {
            next.font_path = if path.as_os_str().is_empty() {
                None
            } else {
                Some(path.clone())
            };
        }
        next
    }
}

// ========== 服务配置文件 ==========

/// 服务配置 (sentinel.json)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut pipelines = BTreeMap::new();
        pipelines.insert(
            "default".to_string(),
            PipelineConfig::new(SourceSpec::Device {
                index: 0,
                width: None,
                height: None,
                fps: None,
            }),
        );
        Self {
            bind: default_bind(),
            autostart: true,
            pipelines,
        }
    }
}

impl AppConfig {
    /// 从JSON文件加载配置, 文件不存在时写出默认配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("📝 配置文件不存在,创建默认配置: {}", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("配置文件解析失败: {}", path.display()))?;
        for (name, pipeline) in &config.pipelines {
            pipeline
                .validate()
                .with_context(|| format!("管线 {} 配置无效", name))?;
        }
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("保存配置失败: {}", path.display()))?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_confidence() -> f32 {
    0.5
}
fn default_iou() -> f32 {
    0.45
}
fn default_line_width() -> u32 {
    2
}
fn default_id_timeout_ms() -> u64 {
    3000
}
fn default_min_frames() -> usize {
    2
}
fn default_queue_depth() -> usize {
    10
}
fn default_workers() -> usize {
    1
}
fn default_callback_workers() -> usize {
    2
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_read_retry_ms() -> u64 {
    50
}
fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_shorthand() {
        assert!(matches!(
            "0".parse::<SourceSpec>().unwrap(),
            SourceSpec::Device { index: 0, .. }
        ));
        assert!(matches!(
            "http://cam/stream".parse::<SourceSpec>().unwrap(),
            SourceSpec::Stream { .. }
        ));
        assert_eq!(
            "pipeline:gate".parse::<SourceSpec>().unwrap(),
            SourceSpec::Pipeline {
                name: "gate".into()
            }
        );
        assert!(matches!(
            "videos/a.mjpg".parse::<SourceSpec>().unwrap(),
            SourceSpec::File { .. }
        ));
        assert!("  ".parse::<SourceSpec>().is_err());
    }

    #[test]
    fn test_pipeline_defaults_from_json() {
        let cfg: PipelineConfig = serde_json::from_value(json!({ "source": "0" })).unwrap();
        assert_eq!(cfg.queue_depth, 10);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.callback_workers, 2);
        assert_eq!(cfg.queue_policy, QueuePolicy::Drop);
        assert_eq!(cfg.jpeg_quality, 80);
        assert!(cfg.models.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_tagged_source_and_model_defaults() {
        let cfg: PipelineConfig = serde_json::from_value(json!({
            "source": { "kind": "file", "path": "clip.mjpg", "fps": 12.5 },
            "queue_policy": { "mode": "block", "timeout_ms": 200 },
            "models": [{
                "id": "people",
                "counting": { "region": [[320.0, 0.0], [320.0, 480.0]] }
            }]
        }))
        .unwrap();
        assert_eq!(cfg.queue_policy, QueuePolicy::Block { timeout_ms: 200 });
        let model = &cfg.models[0];
        assert_eq!(model.confidence, 0.5);
        assert_eq!(model.iou, 0.45);
        let counting = model.counting.as_ref().unwrap();
        assert_eq!(counting.tracker, TrackerKind::Bytetrack);
        assert_eq!(counting.tracker_params.max_lost_frames, 60);
        assert!(counting.show_in && counting.show_out);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = PipelineConfig::new("0".parse().unwrap());
        cfg.queue_depth = 0;
        assert!(matches!(
            cfg.validate(),
            Err(PipelineError::ConfigRejected(_))
        ));

        let mut cfg = PipelineConfig::new("0".parse().unwrap());
        cfg.models = vec![ModelSpec::new("a"), ModelSpec::new("a")];
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::new("0".parse().unwrap());
        let mut model = ModelSpec::new("a");
        model.counting = Some(CountingSpec::new(vec![[1.0, 1.0]]));
        cfg.models = vec![model];
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::new("0".parse().unwrap());
        let mut model = ModelSpec::new("a");
        model.confidence = 1.5;
        cfg.models = vec![model];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_rates() {
        for fps in [1e-20, 0.0, -1.0, f64::NAN, f64::INFINITY, 5000.0] {
            let cfg = PipelineConfig::new(SourceSpec::File {
                path: "clip.mjpg".into(),
                fps: Some(fps),
            });
            assert!(cfg.validate().is_err(), "fps {} accepted", fps);
        }
        let cfg = PipelineConfig::new(SourceSpec::Device {
            index: 0,
            width: None,
            height: None,
            fps: Some(0),
        });
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::new("clip.mjpg".parse().unwrap());
        cfg.queue_policy = QueuePolicy::Block {
            timeout_ms: MAX_BLOCK_TIMEOUT_MS + 1,
        };
        assert!(cfg.validate().is_err());
        cfg.queue_policy = QueuePolicy::Block { timeout_ms: 200 };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_frame_interval_is_clamped() {
        assert_eq!(frame_interval(None), None);
        assert_eq!(frame_interval(Some(0.0)), None);
        assert_eq!(frame_interval(Some(f64::NAN)), None);
        assert_eq!(frame_interval(Some(10.0)), Some(Duration::from_millis(100)));
        assert_eq!(
            frame_interval(Some(1e-20)),
            Some(Duration::from_secs_f64(1.0 / MIN_FPS))
        );
        assert_eq!(
            frame_interval(Some(1e12)),
            Some(Duration::from_secs_f64(1.0 / MAX_FPS))
        );
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let err = serde_json::from_value::<ConfigPatch>(json!({ "queue_dpth": 3 }));
        assert!(err.is_err());
    }

    #[test]
    fn test_patch_apply_and_restart_detection() {
        let base = PipelineConfig::new("0".parse().unwrap());
        let patch: ConfigPatch = serde_json::from_value(json!({
            "models": [{ "id": "cars" }],
            "jpeg_quality": 60
        }))
        .unwrap();
        let next = patch.apply(&base);
        assert_eq!(next.models.len(), 1);
        assert_eq!(next.jpeg_quality, 60);
        assert_eq!(base.jpeg_quality, 80);
        assert!(!base.requires_restart(&next));

        let patch: ConfigPatch =
            serde_json::from_value(json!({ "source": "pipeline:upstream" })).unwrap();
        let next = patch.apply(&base);
        assert!(base.requires_restart(&next));

        let patch: ConfigPatch = serde_json::from_value(json!({ "workers": 3 })).unwrap();
        assert!(base.requires_restart(&patch.apply(&base)));
    }

    #[test]
    fn test_app_config_load_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        let cfg = AppConfig::load(&path).unwrap();
        assert!(path.exists());
        assert!(cfg.pipelines.contains_key("default"));

        let again = AppConfig::load(&path).unwrap();
        assert_eq!(again.bind, cfg.bind);
    }

    #[test]
    fn test_app_config_malformed_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
