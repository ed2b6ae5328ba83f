//! 多目标跟踪公共组件: 卡尔曼框滤波 / IOU / 轨迹配色
//! Common components for multi-object tracking

use super::types::BBox;

/// 框的观测量 [cx, cy, w, h]
fn measure(bbox: &BBox) -> [f32; 4] {
    let (cx, cy) = bbox.center();
    [cx, cy, bbox.width(), bbox.height()]
}

fn bbox_from(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    BBox::from_center(cx, cy, w.max(1.0), h.max(1.0), 1.0, 0)
}

// ========== 卡尔曼滤波器 ==========

/// 简化卡尔曼滤波器 (单个边界框的位置和尺寸平滑)
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh], 协方差简化为对角阵
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    /// 过程噪声 (0.1-1.0, 越小越平滑)
    q: f32,
    /// 观测噪声 (越大越平滑)
    r: f32,
    velocity_decay: f32,
    /// 静止阈值 (像素/帧)
    stationary_threshold: f32,
    stationary_count: u32,
}

impl KalmanBoxFilter {
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let [cx, cy, w, h] = measure(bbox);
        Self {
            state: [cx, cy, w, h, 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q,
            r,
            velocity_decay: 0.95,
            stationary_threshold: 2.0,
            stationary_count: 0,
        }
    }

    fn speed(&self) -> f32 {
        self.state[4].hypot(self.state[5])
    }

    /// 预测下一帧状态 (匀速模型 + 速度衰减)
    pub fn predict(&mut self) {
        let stationary = self.speed() < self.stationary_threshold;

        let (pos_decay, size_decay) = if stationary {
            self.stationary_count += 1;
            // 连续静止3帧后大幅衰减速度
            let d = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            (d, d)
        } else {
            self.stationary_count = 0;
            (self.velocity_decay, 0.98)
        };
        self.state[4] *= pos_decay;
        self.state[5] *= pos_decay;
        self.state[6] *= size_decay;
        self.state[7] *= size_decay;

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        let q = if stationary { self.q * 0.5 } else { self.q };
        for p in self.p.iter_mut() {
            *p += q;
        }
    }

    /// 融合观测值 (根据残差自适应调整观测噪声)
    pub fn update(&mut self, bbox: &BBox) {
        let z = measure(bbox);
        let residual = [
            z[0] - self.state[0],
            z[1] - self.state[1],
            z[2] - self.state[2],
            z[3] - self.state[3],
        ];

        let residual_norm = residual[0].hypot(residual[1]);
        let small_move = residual_norm < self.stationary_threshold;
        // 小幅移动更信任观测, 大幅跳变更信任预测
        let r = if small_move {
            self.r * 0.3
        } else if residual_norm < 10.0 {
            self.r
        } else {
            self.r * 3.0
        };
        let velocity_gain = if small_move { 0.3 } else { 1.0 };

        for i in 0..4 {
            let k_pos = self.p[i] / (self.p[i] + r);
            let k_vel = self.p[i + 4] / (self.p[i + 4] + r * 10.0);
            self.state[i] += k_pos * residual[i];
            self.state[i + 4] += k_vel * residual[i] * velocity_gain;
            self.p[i] *= 1.0 - k_pos;
            self.p[i + 4] *= 1.0 - k_vel;
        }

        if !small_move {
            self.stationary_count = 0;
        }
    }

    /// 当前状态的边界框
    pub fn state_bbox(&self) -> BBox {
        bbox_from(self.state[0], self.state[1], self.state[2], self.state[3])
    }

    /// 预测的边界框 (用于匹配)
    pub fn predicted_bbox(&self) -> BBox {
        bbox_from(
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            self.state[2] + self.state[6],
            self.state[3] + self.state[7],
        )
    }
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// 根据ID生成不同颜色 (黄金角度采样)
pub fn id_to_color(id: u32) -> [u8; 3] {
    let hue = (id as f32 * 137.508) % 360.0;
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV转RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    [
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ]
}
