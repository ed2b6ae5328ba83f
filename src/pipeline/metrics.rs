//! 管线运行统计

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// 推理耗时滑动窗口长度
pub const INFERENCE_WINDOW: usize = 120;

/// 推理耗时统计 (毫秒)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct InferenceStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub samples: usize,
}

#[derive(Default)]
pub struct PipelineMetrics {
    frames_received: AtomicU64,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    inference_ms: Mutex<VecDeque<f64>>,
    last_error: Mutex<Option<String>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新一轮运行开始时清零
    pub fn reset(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.frames_processed.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.inference_ms.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn record_inference(&self, ms: f64) {
        let mut window = self.inference_ms.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == INFERENCE_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    pub fn inference_stats(&self) -> InferenceStats {
        let window = self.inference_ms.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return InferenceStats::default();
        }
        let (min, max, sum) = window
            .iter()
            .fold((f64::MAX, f64::MIN, 0.0), |(lo, hi, sum), &v| {
                (lo.min(v), hi.max(v), sum + v)
            });
        InferenceStats {
            min,
            avg: sum / window.len() as f64,
            max,
            samples: window.len(),
        }
    }

    pub fn set_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_window_is_bounded() {
        let m = PipelineMetrics::new();
        for i in 0..(INFERENCE_WINDOW + 30) {
            m.record_inference(i as f64);
        }
        let stats = m.inference_stats();
        assert_eq!(stats.samples, INFERENCE_WINDOW);
        assert_eq!(stats.min, 30.0);
        assert_eq!(stats.max, (INFERENCE_WINDOW + 29) as f64);
    }

    #[test]
    fn test_reset_clears_everything() {
        let m = PipelineMetrics::new();
        m.frame_received();
        m.frame_dropped();
        m.record_inference(3.0);
        m.set_error("boom".into());
        m.reset();
        assert_eq!(m.frames_received(), 0);
        assert_eq!(m.frames_dropped(), 0);
        assert_eq!(m.inference_stats(), InferenceStats::default());
        assert!(m.last_error().is_none());
    }
}
