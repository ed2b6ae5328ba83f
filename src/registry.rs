//! 管线注册表: 按名称管理多条管线, 并为串联源提供上游查找

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use tracing::{error, info};

use crate::config::{AppConfig, PipelineConfig};
use crate::detection::ModelRegistry;
use crate::error::{PipelineError, Result};
use crate::input::UpstreamLookup;
use crate::pipeline::Pipeline;

/// 管线列表项
#[derive(Clone, Debug, Serialize)]
pub struct PipelineSummary {
    pub name: String,
    pub running: bool,
    pub source: String,
}

pub struct PipelineRegistry {
    pipelines: RwLock<BTreeMap<String, Arc<Pipeline>>>,
    models: Arc<ModelRegistry>,
}

impl PipelineRegistry {
    pub fn new(models: Arc<ModelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            pipelines: RwLock::new(BTreeMap::new()),
            models,
        })
    }

    /// 按服务配置创建全部管线 (不启动)
    pub fn from_config(config: &AppConfig, models: Arc<ModelRegistry>) -> Result<Arc<Self>> {
        let registry = Self::new(models);
        for (name, pipeline) in &config.pipelines {
            registry.create(name, pipeline.clone())?;
        }
        Ok(registry)
    }

    /// 注册新管线; 名称重复时拒绝
    pub fn create(self: &Arc<Self>, name: &str, config: PipelineConfig) -> Result<Arc<Pipeline>> {
        if self.read().contains_key(name) {
            return Err(PipelineError::rejected(format!("管线已存在: {}", name)));
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let lookup: UpstreamLookup = Arc::new(move |upstream: &str| {
            let registry = weak.upgrade()?;
            let pipeline = registry.get(upstream).ok()?;
            Some(pipeline.last_frame_cache())
        });

        let pipeline = Arc::new(Pipeline::new(
            name,
            config,
            self.models.clone(),
            Some(lookup),
        )?);
        self.pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), pipeline.clone());
        info!("📋 管线 {} 已注册", name);
        Ok(pipeline)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("管线 {}", name)))
    }

    pub fn list(&self) -> Vec<PipelineSummary> {
        self.read()
            .values()
            .map(|p| PipelineSummary {
                name: p.name().to_string(),
                running: p.is_running(),
                source: p.config().source.to_string(),
            })
            .collect()
    }

    /// 启动全部管线, 失败的只记日志
    pub fn start_all(&self) {
        for pipeline in self.pipelines() {
            if let Err(e) = pipeline.start() {
                error!("❌ 管线 {} 启动失败: {}", pipeline.name(), e);
            }
        }
    }

    pub fn stop_all(&self) {
        for pipeline in self.pipelines() {
            pipeline.stop();
        }
    }

    fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Pipeline>>> {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner())
    }
}
