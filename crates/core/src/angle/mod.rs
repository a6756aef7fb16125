//! Joint angle computation from three landmarks.
//!
//! Occlusion and degenerate geometry are routine while someone is exercising
//! in front of a camera, so both simply yield `None` rather than an error.

use serde::{Deserialize, Serialize};

use crate::landmark::{JointLandmarks, Landmark};

/// Default minimum landmark visibility accepted for angle computation.
pub const DEFAULT_VISIBILITY_FLOOR: f32 = 0.5;

/// Rays shorter than this are treated as collapsed.
const MIN_RAY_LENGTH: f32 = 1e-6;

/// One joint's angle for one frame. `angle_degrees` is `None` when the angle
/// could not be measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointAngleSample {
    pub joint_id: String,
    pub angle_degrees: Option<f32>,
    pub timestamp_ms: u64,
}

impl JointAngleSample {
    pub fn new(joint_id: impl Into<String>, angle_degrees: Option<f32>, timestamp_ms: u64) -> Self {
        Self {
            joint_id: joint_id.into(),
            angle_degrees,
            timestamp_ms,
        }
    }
}

/// Angle in degrees between the rays `vertex -> a` and `vertex -> b`, using
/// the default visibility floor.
pub fn compute_angle(vertex: &Landmark, a: &Landmark, b: &Landmark) -> Option<f32> {
    compute_angle_with_floor(vertex, a, b, DEFAULT_VISIBILITY_FLOOR)
}

/// Angle in degrees, clamped to [0, 180]. Returns `None` if any landmark is
/// less visible than `floor` or either ray has near-zero length.
pub fn compute_angle_with_floor(
    vertex: &Landmark,
    a: &Landmark,
    b: &Landmark,
    floor: f32,
) -> Option<f32> {
    if !(vertex.is_visible(floor) && a.is_visible(floor) && b.is_visible(floor)) {
        return None;
    }

    let ray_a = [a.x - vertex.x, a.y - vertex.y, a.z - vertex.z];
    let ray_b = [b.x - vertex.x, b.y - vertex.y, b.z - vertex.z];

    let len_a = norm(ray_a);
    let len_b = norm(ray_b);
    if len_a < MIN_RAY_LENGTH || len_b < MIN_RAY_LENGTH {
        return None;
    }

    let dot = ray_a[0] * ray_b[0] + ray_a[1] * ray_b[1] + ray_a[2] * ray_b[2];
    let cosine = (dot / (len_a * len_b)).clamp(-1.0, 1.0);
    let degrees = cosine.acos().to_degrees();

    if degrees.is_finite() {
        Some(degrees.clamp(0.0, 180.0))
    } else {
        None
    }
}

/// Convenience wrapper for a joint's landmark triple.
pub fn joint_angle(landmarks: &JointLandmarks, floor: f32) -> Option<f32> {
    compute_angle_with_floor(&landmarks.vertex, &landmarks.a, &landmarks.b, floor)
}

fn norm(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32, y: f32) -> Landmark {
        Landmark::new(x, y, 0.0, 1.0)
    }

    #[test]
    fn right_angle_is_ninety_degrees() {
        let angle = compute_angle(&point(0.0, 0.0), &point(1.0, 0.0), &point(0.0, 1.0)).unwrap();
        assert!((angle - 90.0).abs() < 1e-3);
    }

    #[test]
    fn straight_and_folded_limbs_hit_the_bounds() {
        let straight = compute_angle(&point(0.0, 0.0), &point(-1.0, 0.0), &point(2.0, 0.0)).unwrap();
        let folded = compute_angle(&point(0.0, 0.0), &point(1.0, 0.0), &point(3.0, 0.0)).unwrap();

        assert!((straight - 180.0).abs() < 1e-3);
        assert!(folded.abs() < 1e-3);
    }

    #[test]
    fn uses_depth_when_present() {
        let vertex = Landmark::new(0.0, 0.0, 0.0, 1.0);
        let a = Landmark::new(1.0, 0.0, 0.0, 1.0);
        let b = Landmark::new(0.0, 0.0, 1.0, 1.0);

        let angle = compute_angle(&vertex, &a, &b).unwrap();
        assert!((angle - 90.0).abs() < 1e-3);
    }

    #[test]
    fn low_visibility_yields_none() {
        let hidden = Landmark::new(1.0, 0.0, 0.0, 0.2);
        assert_eq!(compute_angle(&point(0.0, 0.0), &hidden, &point(0.0, 1.0)), None);
        assert!(compute_angle_with_floor(&point(0.0, 0.0), &hidden, &point(0.0, 1.0), 0.1).is_some());
    }

    #[test]
    fn collapsed_ray_yields_none() {
        assert_eq!(compute_angle(&point(0.5, 0.5), &point(0.5, 0.5), &point(1.0, 1.0)), None);
    }
}
