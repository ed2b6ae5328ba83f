//! 计数区域几何: 线段相交 / 点在多边形内 / 方向判定

use serde::{Deserialize, Serialize};

pub type Point = (f32, f32);

/// 穿越方向
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

/// 计数区域: 2点为线, ≥3点为多边形
#[derive(Clone, Debug, PartialEq)]
pub enum Region {
    Line(Point, Point),
    Polygon(Vec<Point>),
}

impl Region {
    /// 点数不足2时返回 None
    pub fn from_points(points: &[[f32; 2]]) -> Option<Self> {
        match points.len() {
            0 | 1 => None,
            2 => Some(Region::Line(
                (points[0][0], points[0][1]),
                (points[1][0], points[1][1]),
            )),
            _ => Some(Region::Polygon(
                points.iter().map(|p| (p[0], p[1])).collect(),
            )),
        }
    }

    /// 质心从 prev 移动到 cur 是否触发计数
    ///
    /// 线: prev / cur 分处计数线两侧 (允许其中一点恰好在线上)
    /// 多边形: 从外部进入内部
    pub fn crossed(&self, prev: Point, cur: Point) -> bool {
        match self {
            Region::Line(a, b) => crosses_segment(prev, cur, *a, *b),
            Region::Polygon(poly) => !point_in_polygon(prev, poly) && point_in_polygon(cur, poly),
        }
    }

    /// 区域是否"竖高": 竖线 / 高大于宽的多边形按x方向判定, 否则按y方向
    pub fn is_tall(&self) -> bool {
        match self {
            Region::Line(a, b) => (a.0 - b.0).abs() < (a.1 - b.1).abs(),
            Region::Polygon(poly) => {
                let (min_x, min_y, max_x, max_y) = bounds(poly);
                (max_x - min_x) < (max_y - min_y)
            }
        }
    }

    /// 沿判定轴坐标严格增大 → In, 否则 Out
    pub fn direction(&self, prev: Point, cur: Point) -> Direction {
        let increasing = if self.is_tall() {
            cur.0 > prev.0
        } else {
            cur.1 > prev.1
        };
        if increasing {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// 绘制用的顶点序列 (多边形首尾闭合)
    pub fn outline(&self) -> Vec<Point> {
        match self {
            Region::Line(a, b) => vec![*a, *b],
            Region::Polygon(poly) => {
                let mut pts = poly.clone();
                if let Some(first) = poly.first() {
                    pts.push(*first);
                }
                pts
            }
        }
    }
}

/// 叉积方向: >0 逆时针, <0 顺时针, 0 共线
fn orientation(a: Point, b: Point, c: Point) -> f32 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

/// 共线时 p 是否落在线段 ab 的包围盒内
fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

/// 两侧判定: 严格异号, 或恰好一个为0
fn opposite_sides(a: f32, b: f32) -> bool {
    (a > 0.0 && b < 0.0) || (a < 0.0 && b > 0.0) || ((a == 0.0) != (b == 0.0))
}

/// 移动 p1→p2 是否从线段 q1q2 的一侧到达另一侧
///
/// 零长度移动与沿线移动 (共线) 不算穿越。
pub fn crosses_segment(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    if !opposite_sides(d1, d2) {
        return false;
    }

    // 交点必须落在 q1q2 范围内
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    (d3 > 0.0 && d4 < 0.0)
        || (d3 < 0.0 && d4 > 0.0)
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// 射线法判断点是否在多边形内
pub fn point_in_polygon(p: Point, poly: &[Point]) -> bool {
    let mut inside = false;
    let n = poly.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if (yi > p.1) != (yj > p.1) && p.0 < (xj - xi) * (p.1 - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// 包围盒 (min_x, min_y, max_x, max_y)
pub fn bounds(points: &[Point]) -> (f32, f32, f32, f32) {
    points.iter().fold(
        (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
        |(min_x, min_y, max_x, max_y), &(x, y)| {
            (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crosses_segment() {
        assert!(crosses_segment((0.0, 0.0), (10.0, 10.0), (0.0, 10.0), (10.0, 0.0)));
        assert!(!crosses_segment((0.0, 0.0), (1.0, 1.0), (5.0, 0.0), (5.0, 10.0)));
        // 到达线上 / 从线上离开
        assert!(crosses_segment((0.0, 5.0), (5.0, 5.0), (5.0, 0.0), (5.0, 10.0)));
        assert!(crosses_segment((5.0, 5.0), (9.0, 5.0), (5.0, 0.0), (5.0, 10.0)));
        // 平行不相交
        assert!(!crosses_segment((0.0, 0.0), (10.0, 0.0), (0.0, 1.0), (10.0, 1.0)));
        // 越过延长线但不在线段范围内
        assert!(!crosses_segment((0.0, 20.0), (10.0, 20.0), (5.0, 0.0), (5.0, 10.0)));
    }

    #[test]
    fn test_stationary_or_collinear_movement_is_not_a_crossing() {
        let line = Region::from_points(&[[320.0, 0.0], [320.0, 480.0]]).unwrap();
        // 停在线上
        assert!(!line.crossed((320.0, 200.0), (320.0, 200.0)));
        // 沿线移动
        assert!(!line.crossed((320.0, 100.0), (320.0, 150.0)));
        // 停在线外
        assert!(!line.crossed((300.0, 200.0), (300.0, 200.0)));
    }

    #[test]
    fn test_point_in_polygon() {
        let square = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon((5.0, 5.0), &square));
        assert!(!point_in_polygon((15.0, 5.0), &square));
        assert!(!point_in_polygon((-1.0, -1.0), &square));
    }

    #[test]
    fn test_vertical_line_uses_x_axis() {
        let line = Region::from_points(&[[320.0, 0.0], [320.0, 480.0]]).unwrap();
        assert!(line.is_tall());
        assert!(line.crossed((300.0, 200.0), (340.0, 200.0)));
        assert_eq!(line.direction((300.0, 200.0), (340.0, 200.0)), Direction::In);
        assert_eq!(line.direction((340.0, 200.0), (300.0, 200.0)), Direction::Out);
    }

    #[test]
    fn test_horizontal_line_uses_y_axis() {
        let line = Region::from_points(&[[0.0, 240.0], [640.0, 240.0]]).unwrap();
        assert!(!line.is_tall());
        assert_eq!(line.direction((100.0, 200.0), (100.0, 260.0)), Direction::In);
        assert_eq!(line.direction((100.0, 260.0), (100.0, 200.0)), Direction::Out);
    }

    #[test]
    fn test_polygon_counts_entry_only() {
        let region =
            Region::from_points(&[[100.0, 100.0], [300.0, 100.0], [300.0, 200.0], [100.0, 200.0]])
                .unwrap();
        assert!(!region.is_tall());
        assert!(region.crossed((50.0, 150.0), (150.0, 150.0)));
        assert!(!region.crossed((150.0, 150.0), (160.0, 150.0)));
        assert!(!region.crossed((150.0, 150.0), (350.0, 150.0)));
        assert_eq!(region.outline().len(), 5);
    }

    #[test]
    fn test_region_needs_two_points() {
        assert!(Region::from_points(&[[1.0, 1.0]]).is_none());
    }
}
