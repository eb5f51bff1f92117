// src/zones.rs
//
// Zone occupancy counting. Each detection's anchor is tested against the
// camera's zones in declaration order and lands in at most one of them.

use crate::types::{CameraConfig, Detection, Occupancy};

const EDGE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub index: usize,
    pub vertices: Vec<(i32, i32)>,
}

impl Zone {
    pub fn new(index: usize, vertices: &[[i32; 2]]) -> Self {
        Self {
            index,
            vertices: vertices.iter().map(|v| (v[0], v[1])).collect(),
        }
    }

    /// Point-in-polygon with the boundary counted as inside.
    pub fn contains(&self, point: (f32, f32)) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let (px, py) = (point.0 as f64, point.1 as f64);

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.vertices[i].0 as f64, self.vertices[i].1 as f64);
            let (xj, yj) = (self.vertices[j].0 as f64, self.vertices[j].1 as f64);

            if on_segment(px, py, xi, yi, xj, yj) {
                return true;
            }

            if (yi > py) != (yj > py) {
                let x_cross = xj + (py - yj) * (xi - xj) / (yi - yj);
                if px < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    if cross.abs() > EDGE_EPSILON * ((bx - ax).abs() + (by - ay).abs()).max(1.0) {
        return false;
    }
    px >= ax.min(bx) - EDGE_EPSILON
        && px <= ax.max(bx) + EDGE_EPSILON
        && py >= ay.min(by) - EDGE_EPSILON
        && py <= ay.max(by) + EDGE_EPSILON
}

/// Build the ordered zone list for one camera.
pub fn zones_for_camera(camera: &CameraConfig) -> Vec<Zone> {
    camera
        .zones
        .iter()
        .enumerate()
        .map(|(i, vertices)| Zone::new(i, vertices))
        .collect()
}

/// Index of the first zone containing `point`, if any.
pub fn assign(point: (f32, f32), zones: &[Zone]) -> Option<usize> {
    zones.iter().position(|z| z.contains(point))
}

/// Count detections per zone. Output length is always `zones.len()`;
/// detections outside every zone are not counted.
pub fn count(detections: &[Detection], zones: &[Zone]) -> Occupancy {
    let mut counts = vec![0u32; zones.len()];
    for det in detections {
        if let Some(i) = assign(det.anchor, zones) {
            counts[i] += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(index: usize, x0: i32, y0: i32, x1: i32, y1: i32) -> Zone {
        Zone::new(index, &[[x0, y0], [x1, y0], [x1, y1], [x0, y1]])
    }

    fn det_at(x: f32, y: f32) -> Detection {
        Detection::from_bbox([x - 5.0, y - 10.0, x + 5.0, y], 2, "car", 0.8)
    }

    #[test]
    fn test_single_zone_hit() {
        let zones = vec![square(0, 0, 0, 10, 10)];
        assert_eq!(count(&[det_at(5.0, 5.0)], &zones), vec![1]);
    }

    #[test]
    fn test_hit_does_not_touch_other_zones() {
        let zones = vec![square(0, 0, 0, 10, 10), square(1, 20, 0, 30, 10)];
        assert_eq!(count(&[det_at(25.0, 5.0)], &zones), vec![0, 1]);
    }

    #[test]
    fn test_overlap_goes_to_first_declared() {
        let zones = vec![square(0, 0, 0, 10, 10), square(1, 5, 5, 15, 15)];
        assert_eq!(count(&[det_at(7.0, 7.0)], &zones), vec![1, 0]);

        let reversed = vec![square(0, 5, 5, 15, 15), square(1, 0, 0, 10, 10)];
        assert_eq!(count(&[det_at(7.0, 7.0)], &reversed), vec![1, 0]);
    }

    #[test]
    fn test_outside_detections_do_not_change_counts() {
        let zones = vec![square(0, 0, 0, 10, 10), square(1, 20, 0, 30, 10)];
        let inside = vec![det_at(5.0, 5.0), det_at(22.0, 3.0)];
        let baseline = count(&inside, &zones);

        let mut with_strays = inside.clone();
        with_strays.push(det_at(100.0, 100.0));
        with_strays.push(det_at(15.0, 5.0));
        with_strays.push(det_at(-3.0, 4.0));

        let counts = count(&with_strays, &zones);
        assert_eq!(counts, baseline);
        assert_eq!(counts.iter().sum::<u32>(), 2);
    }

    #[test]
    fn test_boundary_counts_as_inside() {
        let zone = square(0, 0, 0, 10, 10);
        assert!(zone.contains((10.0, 5.0)));
        assert!(zone.contains((0.0, 0.0)));
        assert!(zone.contains((5.0, 10.0)));
        assert!(!zone.contains((10.5, 5.0)));
    }

    #[test]
    fn test_non_convex_polygon() {
        // U shape: notch between x=4..6 above y=4
        let zone = Zone::new(
            0,
            &[[0, 0], [10, 0], [10, 10], [6, 10], [6, 4], [4, 4], [4, 10], [0, 10]],
        );
        assert!(zone.contains((2.0, 8.0)));
        assert!(zone.contains((8.0, 8.0)));
        assert!(!zone.contains((5.0, 8.0)));
        assert!(zone.contains((5.0, 2.0)));
    }

    #[test]
    fn test_no_detections_is_zero_vector() {
        let zones = vec![square(0, 0, 0, 10, 10), square(1, 20, 0, 30, 10)];
        assert_eq!(count(&[], &zones), vec![0, 0]);
    }

    #[test]
    fn test_multiple_vehicles_same_zone() {
        let zones = vec![square(0, 0, 0, 10, 10)];
        let dets = vec![det_at(2.0, 2.0), det_at(3.0, 8.0), det_at(9.0, 9.0)];
        assert_eq!(count(&dets, &zones), vec![3]);
    }
}
