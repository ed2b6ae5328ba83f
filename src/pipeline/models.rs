//! 模型集合 (随配置整体替换)
//!
//! 新集合在替换前完整构造; 未变化的模型沿用原检测器与计数器, 计数不丢失。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::ModelSpec;
use crate::counting::{CountSnapshot, DirectionalCounter};
use crate::detection::{Detector, ModelRegistry};
use crate::error::Result;

/// 单个模型: 配置 + 检测器 + 计数器
pub struct ModelSlot {
    pub spec: ModelSpec,
    pub detector: Arc<dyn Detector>,
    pub counter: Option<Arc<Mutex<DirectionalCounter>>>,
}

impl ModelSlot {
    pub fn snapshot(&self) -> Option<CountSnapshot> {
        self.counter
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).snapshot())
    }
}

/// 检测器是否可以沿用: 同一后端且追踪配置一致
fn same_detector(old: &ModelSpec, new: &ModelSpec) -> bool {
    let tracking = |spec: &ModelSpec| {
        spec.counting
            .as_ref()
            .map(|c| (c.tracker, c.tracker_params.clone()))
    };
    old.id == new.id && tracking(old) == tracking(new)
}

#[derive(Default)]
pub struct ModelSet {
    slots: Vec<Arc<ModelSlot>>,
}

impl ModelSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 按配置构造; 任一模型失败则整体失败, 原集合不受影响
    pub fn build(
        specs: &[ModelSpec],
        registry: &ModelRegistry,
        previous: Option<&ModelSet>,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(specs.len());
        for spec in specs {
            let old = previous.and_then(|set| set.get(&spec.id));

            let detector: Arc<dyn Detector> = match old {
                Some(old) if same_detector(&old.spec, spec) => old.detector.clone(),
                _ => Arc::new(registry.build(spec)?),
            };

            let counter = match (&spec.counting, old.and_then(|o| o.counter.clone())) {
                (Some(_), Some(counter)) => Some(counter),
                (Some(_), None) => {
                    info!("🔢 模型 {} 启用计数", spec.id);
                    Some(Arc::new(Mutex::new(DirectionalCounter::new(spec.id.clone()))))
                }
                (None, _) => None,
            };

            slots.push(Arc::new(ModelSlot {
                spec: spec.clone(),
                detector,
                counter,
            }));
        }
        Ok(Self { slots })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ModelSlot>> {
        self.slots.iter().find(|s| s.spec.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSlot>> {
        self.slots.iter()
    }

    /// 各计数模型的当前计数
    pub fn snapshots(&self) -> BTreeMap<String, CountSnapshot> {
        self.slots
            .iter()
            .filter_map(|s| s.snapshot().map(|snap| (s.spec.id.clone(), snap)))
            .collect()
    }

    pub fn reset_counts(&self) {
        for slot in &self.slots {
            if let Some(counter) = &slot.counter {
                counter.lock().unwrap_or_else(|e| e.into_inner()).reset();
            }
        }
    }
}
