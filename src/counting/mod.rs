//! 方向计数器 (Directional Counter)
//!
//! 每个带计数区域的模型一个实例。记录每个跟踪ID的质心轨迹,
//! 质心穿越计数线 / 进入多边形时按方向计数, 并做去抖与过期清理。
pub mod geometry;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::CountingSpec;
use crate::detection::TrackedObject;
pub use geometry::{Direction, Point, Region};

/// 每个ID保留的轨迹点上限
pub const HISTORY_CAP: usize = 30;

/// 过期清理最小间隔
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// 计数事件
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountEvent {
    pub model: String,
    pub track_id: u32,
    pub class_id: u32,
    pub label: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub position: Point,
}

/// 单类别计数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClassTally {
    #[serde(rename = "IN")]
    pub in_count: u64,
    #[serde(rename = "OUT")]
    pub out_count: u64,
}

/// 计数快照
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CountSnapshot {
    pub in_count: u64,
    pub out_count: u64,
    pub classwise: BTreeMap<String, ClassTally>,
}

impl CountSnapshot {
    pub fn total(&self) -> u64 {
        self.in_count + self.out_count
    }
}

struct TrackState {
    history: VecDeque<Point>,
    last_direction: Option<Direction>,
    last_count_at: Option<Instant>,
    last_seen: Instant,
}

impl TrackState {
    fn new(now: Instant) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAP),
            last_direction: None,
            last_count_at: None,
            last_seen: now,
        }
    }

    fn push(&mut self, p: Point, now: Instant) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(p);
        self.last_seen = now;
    }

    /// 去抖: 同方向重复 / 窗口内再次计数 → 抑制
    fn debounced(&self, direction: Direction, now: Instant, timeout: Duration) -> bool {
        match (self.last_direction, self.last_count_at) {
            (Some(prev), Some(at)) => {
                prev == direction || now.saturating_duration_since(at) < timeout
            }
            _ => false,
        }
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        let since = self.last_count_at.unwrap_or(self.last_seen);
        now.saturating_duration_since(since) > timeout
    }
}

/// 方向计数器
pub struct DirectionalCounter {
    model: String,
    tracks: HashMap<u32, TrackState>,
    in_count: u64,
    out_count: u64,
    classwise: BTreeMap<String, ClassTally>,
    last_sweep: Option<Instant>,
}

impl DirectionalCounter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tracks: HashMap::new(),
            in_count: 0,
            out_count: 0,
            classwise: BTreeMap::new(),
            last_sweep: None,
        }
    }

    /// 处理一帧的跟踪结果, 返回本帧接受的计数事件
    ///
    /// 区域参数按调用传入, 配置热更新后下一帧即生效。
    pub fn update(
        &mut self,
        objects: &[TrackedObject],
        spec: &CountingSpec,
        now: Instant,
    ) -> Vec<CountEvent> {
        let timeout = Duration::from_millis(spec.id_timeout_ms);
        self.sweep(now, timeout);

        let Some(region) = Region::from_points(&spec.region) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for obj in objects {
            let Some(track_id) = obj.track_id else {
                continue;
            };
            let centroid = obj.centroid();
            let state = self
                .tracks
                .entry(track_id)
                .or_insert_with(|| TrackState::new(now));
            state.push(centroid, now);

            if state.history.len() < spec.min_frames || state.history.len() < 2 {
                continue;
            }
            let prev = state.history[state.history.len() - 2];
            if !region.crossed(prev, centroid) {
                continue;
            }

            let direction = region.direction(prev, centroid);
            if state.debounced(direction, now, timeout) {
                debug!("⏸️ 计数去抖: 模型 {} ID {} {:?}", self.model, track_id, direction);
                continue;
            }
            state.last_direction = Some(direction);
            state.last_count_at = Some(now);

            let tally = self.classwise.entry(obj.label.clone()).or_default();
            match direction {
                Direction::In => {
                    self.in_count += 1;
                    tally.in_count += 1;
                }
                Direction::Out => {
                    self.out_count += 1;
                    tally.out_count += 1;
                }
            }

            events.push(CountEvent {
                model: self.model.clone(),
                track_id,
                class_id: obj.class_id(),
                label: obj.label.clone(),
                direction,
                timestamp: Utc::now(),
                position: centroid,
            });
        }
        events
    }

    /// 过期清理 (最多每秒一次)
    fn sweep(&mut self, now: Instant, timeout: Duration) {
        if let Some(last) = self.last_sweep {
            if now.saturating_duration_since(last) < SWEEP_INTERVAL {
                return;
            }
        }
        self.last_sweep = Some(now);
        let before = self.tracks.len();
        self.tracks.retain(|_, state| !state.expired(now, timeout));
        let evicted = before - self.tracks.len();
        if evicted > 0 {
            debug!("🧹 模型 {} 清理过期ID {} 个", self.model, evicted);
        }
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            in_count: self.in_count,
            out_count: self.out_count,
            classwise: self.classwise.clone(),
        }
    }

    /// 当前保留的跟踪ID数
    pub fn tracked_ids(&self) -> usize {
        self.tracks.len()
    }

    pub fn history_len(&self, track_id: u32) -> Option<usize> {
        self.tracks.get(&track_id).map(|s| s.history.len())
    }

    /// 清零计数与轨迹
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.in_count = 0;
        self.out_count = 0;
        self.classwise.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn obj(id: u32, cx: f32, cy: f32, label: &str) -> TrackedObject {
        TrackedObject {
            track_id: Some(id),
            label: label.to_string(),
            bbox: BBox::from_center(cx, cy, 20.0, 40.0, 0.9, 0),
        }
    }

    fn vertical_line(min_frames: usize) -> CountingSpec {
        let mut spec = CountingSpec::new(vec![[320.0, 0.0], [320.0, 480.0]]);
        spec.min_frames = min_frames;
        spec.id_timeout_ms = 2000;
        spec
    }

    #[test]
    fn test_vertical_line_crossing_counts_in() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("people");
        let t0 = Instant::now();

        assert!(counter.update(&[obj(1, 300.0, 200.0, "person")], &spec, t0).is_empty());
        let events = counter.update(
            &[obj(1, 340.0, 200.0, "person")],
            &spec,
            t0 + Duration::from_millis(40),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
        assert_eq!(events[0].model, "people");
        assert_eq!(events[0].track_id, 1);

        let snap = counter.snapshot();
        assert_eq!(snap.in_count, 1);
        assert_eq!(snap.out_count, 0);
        assert_eq!(snap.classwise["person"].in_count, 1);
    }

    #[test]
    fn test_object_resting_on_line_is_not_counted() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        for i in 0..3 {
            let now = t0 + Duration::from_millis(40 * i);
            assert!(counter.update(&[obj(5, 320.0, 200.0, "person")], &spec, now).is_empty());
        }
        assert_eq!(counter.snapshot(), CountSnapshot::default());
    }

    #[test]
    fn test_movement_along_line_is_not_counted() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(6, 320.0, 100.0, "person")], &spec, t0);
        let events = counter.update(
            &[obj(6, 320.0, 150.0, "person")],
            &spec,
            t0 + Duration::from_millis(40),
        );
        assert!(events.is_empty());
        assert_eq!(counter.snapshot().total(), 0);
    }

    #[test]
    fn test_min_frames_blocks_short_histories() {
        let spec = vertical_line(5);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(1, 300.0, 200.0, "car")], &spec, t0);
        let events = counter.update(&[obj(1, 340.0, 200.0, "car")], &spec, t0);
        assert!(events.is_empty());
        assert_eq!(counter.snapshot().total(), 0);
    }

    #[test]
    fn test_same_direction_recrossing_counts_once() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        let xs = [300.0, 340.0, 300.0, 340.0, 300.0, 340.0];
        let mut total = 0;
        for (i, x) in xs.iter().enumerate() {
            let now = t0 + Duration::from_millis(100 * i as u64);
            total += counter.update(&[obj(7, *x, 200.0, "person")], &spec, now).len();
        }
        // 首次 In 被接受, 之后窗口内的 Out / In 都被抑制
        assert_eq!(total, 1);
        assert_eq!(counter.snapshot().in_count, 1);
    }

    #[test]
    fn test_opposite_direction_after_window_is_counted() {
        let mut spec = vertical_line(1);
        spec.id_timeout_ms = 500;
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(3, 300.0, 200.0, "bike")], &spec, t0);
        assert_eq!(counter.update(&[obj(3, 340.0, 200.0, "bike")], &spec, t0).len(), 1);

        // 窗口已过但还没到清理间隔: 反向穿越被接受
        let later = t0 + Duration::from_millis(600);
        let events = counter.update(&[obj(3, 300.0, 200.0, "bike")], &spec, later);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Out);
        let snap = counter.snapshot();
        assert_eq!((snap.in_count, snap.out_count), (1, 1));
    }

    #[test]
    fn test_independent_ids_count_independently() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(
            &[obj(1, 300.0, 100.0, "person"), obj(2, 340.0, 300.0, "car")],
            &spec,
            t0,
        );
        let events = counter.update(
            &[obj(1, 340.0, 100.0, "person"), obj(2, 300.0, 300.0, "car")],
            &spec,
            t0,
        );
        assert_eq!(events.len(), 2);
        let snap = counter.snapshot();
        assert_eq!(snap.classwise["person"].in_count, 1);
        assert_eq!(snap.classwise["car"].out_count, 1);
    }

    #[test]
    fn test_untracked_objects_are_ignored() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let mut o = obj(1, 300.0, 200.0, "person");
        o.track_id = None;
        counter.update(&[o.clone()], &spec, Instant::now());
        assert_eq!(counter.tracked_ids(), 0);
    }

    #[test]
    fn test_history_is_capped() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        for i in 0..(HISTORY_CAP + 15) {
            counter.update(&[obj(9, 10.0, i as f32, "person")], &spec, t0);
        }
        assert_eq!(counter.history_len(9), Some(HISTORY_CAP));
    }

    #[test]
    fn test_expiry_evicts_counted_and_stale_ids() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(1, 300.0, 200.0, "person")], &spec, t0);
        counter.update(
            &[obj(1, 340.0, 200.0, "person"), obj(2, 10.0, 10.0, "person")],
            &spec,
            t0,
        );
        assert_eq!(counter.tracked_ids(), 2);

        counter.update(&[], &spec, t0 + Duration::from_millis(2500));
        assert_eq!(counter.tracked_ids(), 0);
        // 计数保留
        assert_eq!(counter.snapshot().in_count, 1);

        // 过期后同一ID从头开始, 可再次计数
        let t1 = t0 + Duration::from_millis(2600);
        counter.update(&[obj(1, 300.0, 200.0, "person")], &spec, t1);
        assert_eq!(counter.update(&[obj(1, 340.0, 200.0, "person")], &spec, t1).len(), 1);
        assert_eq!(counter.snapshot().in_count, 2);
    }

    #[test]
    fn test_polygon_entry_direction() {
        let mut spec = CountingSpec::new(vec![
            [100.0, 100.0],
            [300.0, 100.0],
            [300.0, 200.0],
            [100.0, 200.0],
        ]);
        spec.min_frames = 1;
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(4, 200.0, 60.0, "car")], &spec, t0);
        let events = counter.update(&[obj(4, 200.0, 150.0, "car")], &spec, t0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
        // 在多边形内移动不再计数
        assert!(counter.update(&[obj(4, 210.0, 150.0, "car")], &spec, t0).is_empty());
    }

    #[test]
    fn test_reset_clears_tallies() {
        let spec = vertical_line(1);
        let mut counter = DirectionalCounter::new("m");
        let t0 = Instant::now();
        counter.update(&[obj(1, 300.0, 200.0, "person")], &spec, t0);
        counter.update(&[obj(1, 340.0, 200.0, "person")], &spec, t0);
        counter.reset();
        assert_eq!(counter.snapshot(), CountSnapshot::default());
        assert_eq!(counter.tracked_ids(), 0);
    }
}
