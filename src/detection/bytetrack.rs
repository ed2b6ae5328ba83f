//! ByteTrack 算法实现
//! ByteTrack: Simple and effective multi-object tracking
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先匹配 (IOU)
//! 3. 低分框救援丢失的轨迹
//! 4. 纯运动模型,无需外观特征
//!
//! 只在同类别之间匹配, ID 在所有类别间唯一。

use std::cmp::Ordering;

use super::tracker::{compute_iou, KalmanBoxFilter};
use super::types::{BBox, Detection, TrackedObject};
use crate::config::TrackerParams;

/// 单条轨迹
#[derive(Clone, Debug)]
struct Track {
    id: u32,
    class_id: u32,
    label: String,
    /// 卡尔曼滤波平滑后的框
    bbox: BBox,
    kalman: KalmanBoxFilter,
    frames_lost: u32,
    score: f32,
}

impl Track {
    fn new(id: u32, det: &Detection, params: &TrackerParams) -> Self {
        let kalman = KalmanBoxFilter::new(&det.bbox, params.process_noise, params.observation_noise);
        let mut track = Self {
            id,
            class_id: det.bbox.class_id,
            label: det.label.clone(),
            bbox: det.bbox.clone(),
            kalman,
            frames_lost: 0,
            score: det.bbox.confidence,
        };
        track.sync_bbox();
        track
    }

    fn sync_bbox(&mut self) {
        let mut bbox = self.kalman.state_bbox();
        bbox.confidence = self.score;
        bbox.class_id = self.class_id;
        self.bbox = bbox;
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.sync_bbox();
    }

    fn update(&mut self, det: &Detection) {
        self.kalman.update(&det.bbox);
        self.frames_lost = 0;
        self.score = det.bbox.confidence;
        self.label.clone_from(&det.label);
        self.sync_bbox();
    }

    fn output(&self) -> TrackedObject {
        TrackedObject {
            track_id: Some(self.id),
            label: self.label.clone(),
            bbox: self.bbox.clone(),
        }
    }
}

/// ByteTrack 追踪器
pub struct ByteTracker {
    tracks: Vec<Track>,
    next_id: u32,
    params: TrackerParams,
}

impl ByteTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            params,
        }
    }

    /// 当前活跃轨迹数 (含短暂丢失的)
    #[cfg(test)]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// 低于该分数的检测不参与匹配
    pub fn low_score_threshold(&self) -> f32 {
        self.params.low_score_threshold
    }

    /// 更新跟踪 (ByteTrack 三步匹配), 返回本帧匹配到或新建的轨迹
    ///
    /// 高分框的门槛取 `high_score_threshold` 与 `min_confidence` 中较大者,
    /// 只有高分框能新建轨迹。
    pub fn update(&mut self, detections: &[Detection], min_confidence: f32) -> Vec<TrackedObject> {
        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.predict();
        }

        // 2. 分离高低分检测框
        let high_threshold = self.params.high_score_threshold.max(min_confidence);
        let mut high = Vec::new();
        let mut low = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            let score = det.bbox.confidence;
            if score >= high_threshold {
                high.push(idx);
            } else if score >= self.params.low_score_threshold {
                low.push(idx);
            }
        }

        let mut det_matched = vec![false; detections.len()];
        let mut track_matched = vec![false; self.tracks.len()];
        let mut updated = Vec::new();

        // 3. 第一轮: 高分检测 + 所有轨迹
        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        let first = self.associate(detections, &high, &all_tracks, self.params.high_iou_threshold);
        for (d, t) in first {
            det_matched[d] = true;
            track_matched[t] = true;
            self.tracks[t].update(&detections[d]);
            updated.push(t);
        }

        // 4. 第二轮: 低分检测 + 未匹配轨迹 (救援)
        let unmatched: Vec<usize> = (0..self.tracks.len())
            .filter(|&t| !track_matched[t])
            .collect();
        let second = self.associate(detections, &low, &unmatched, self.params.low_iou_threshold);
        for (d, t) in second {
            det_matched[d] = true;
            track_matched[t] = true;
            self.tracks[t].update(&detections[d]);
            updated.push(t);
        }

        // 5. 未匹配轨迹 → 丢失计数
        for (t, matched) in track_matched.iter().enumerate() {
            if !matched {
                self.tracks[t].frames_lost += 1;
            }
        }

        let mut output: Vec<TrackedObject> = updated.iter().map(|&t| self.tracks[t].output()).collect();

        // 6. 未匹配的高分检测 → 新建轨迹
        for &d in &high {
            if !det_matched[d] {
                let track = Track::new(self.next_id, &detections[d], &self.params);
                self.next_id += 1;
                output.push(track.output());
                self.tracks.push(track);
            }
        }

        // 7. 删除丢失太久的轨迹
        let max_lost = self.params.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        output
    }

    /// 贪心 IOU 匹配 (仅同类别), 返回 (检测下标, 轨迹下标)
    fn associate(
        &self,
        detections: &[Detection],
        det_indices: &[usize],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if det_indices.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for &d in det_indices {
            let det = &detections[d];
            for &t in track_indices {
                let track = &self.tracks[t];
                if track.class_id != det.bbox.class_id {
                    continue;
                }
                let iou = compute_iou(&det.bbox, &track.kalman.predicted_bbox());
                if iou >= iou_threshold {
                    candidates.push((1.0 - iou, d, t));
                }
            }
        }

        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut used_det = vec![false; detections.len()];
        let mut used_track = vec![false; self.tracks.len()];
        let mut assignments = Vec::new();
        for (_, d, t) in candidates {
            if !used_det[d] && !used_track[t] {
                used_det[d] = true;
                used_track[t] = true;
                assignments.push((d, t));
            }
        }
        assignments
    }

}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(TrackerParams::default())
    }
}
