//! Planar geometry primitives.
//!
//! Every distance used for lap detection and locating is measured in the X/Y
//! plane. Z is interpolated alongside X/Y but never compared.

use trackviz_env::Point3;

/// Euclidean distance between `a` and `b` in the X/Y plane.
pub fn planar_distance(a: &Point3, b: &Point3) -> f64 {
    (b.x - a.x).hypot(b.y - a.y)
}

/// Component-wise linear interpolation from `a` towards `b`.
///
/// Ratios outside `[0, 1]` extrapolate along the same line.
pub fn lerp3(a: &Point3, b: &Point3, ratio: f64) -> Point3 {
    Point3 {
        x: a.x + ratio * (b.x - a.x),
        y: a.y + ratio * (b.y - a.y),
        z: a.z + ratio * (b.z - a.z),
    }
}

/// Running planar arc length along a polyline.
///
/// `result[0]` is always 0 and `result[i]` is the length travelled from
/// `points[0]` to `points[i]`. Empty input gives an empty vector.
pub fn cumulative_arc_lengths(points: &[Point3]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(points.len());
    let mut total = 0.0;
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            total += planar_distance(&points[i - 1], point);
        }
        cumulative.push(total);
    }
    cumulative
}

/// Total planar length of an open polyline.
pub fn polyline_length(points: &[Point3]) -> f64 {
    points
        .windows(2)
        .map(|pair| planar_distance(&pair[0], &pair[1]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_planar_distance_ignores_z() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(3.0, 4.0, 1000.0);
        assert_relative_eq!(planar_distance(&a, &b), 5.0);
        assert_relative_eq!(planar_distance(&b, &a), 5.0);
    }

    #[test]
    fn test_lerp_endpoints_and_midpoint() {
        let a = Point3::new(0.0, 10.0, -4.0);
        let b = Point3::new(10.0, 20.0, 4.0);
        assert_eq!(lerp3(&a, &b, 0.0), a);
        assert_eq!(lerp3(&a, &b, 1.0), b);
        assert_eq!(lerp3(&a, &b, 0.5), Point3::new(5.0, 15.0, 0.0));
    }

    #[test]
    fn test_lerp_extrapolates() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(10.0, 0.0, 2.0);
        assert_eq!(lerp3(&a, &b, 1.5), Point3::new(15.0, 0.0, 3.0));
        assert_eq!(lerp3(&a, &b, -0.5), Point3::new(-5.0, 0.0, -1.0));
    }

    #[test]
    fn test_cumulative_arc_lengths() {
        let points = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3.0, 4.0, 9.0),
            Point3::new(3.0, 4.0, 0.0),
            Point3::new(3.0, 10.0, 0.0),
        ];
        let cumulative = cumulative_arc_lengths(&points);
        assert_eq!(cumulative, vec![0.0, 5.0, 5.0, 11.0]);
        assert_relative_eq!(polyline_length(&points), 11.0);
    }

    #[test]
    fn test_cumulative_arc_lengths_empty() {
        assert!(cumulative_arc_lengths(&[]).is_empty());
        assert_eq!(polyline_length(&[]), 0.0);
    }
}
