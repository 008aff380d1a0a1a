//! Path Locator - maps raw positions onto the 0..=143 lap index.
//!
//! Two modes:
//! - **Nearest point**: [`locate`] against a prebuilt [`ReferencePath`].
//! - **Self-referential**: [`locate_all`] segments a raw stream into laps
//!   around its own first position and indexes each sample by arc length
//!   within its lap. Used when no reference path is available.

use crate::geometry::{cumulative_arc_lengths, planar_distance};
use crate::reference_path::{ReferencePath, PATH_POINTS};
use trackviz_env::{Point3, Sample};

/// A new lap can only begin this many samples after the previous one.
pub const MIN_SAMPLES_PER_LAP: usize = 50;

/// Lap-start proximity threshold, in multiples of the mean segment length.
pub const LAP_START_SEGMENT_FACTOR: f64 = 5.0;

/// Index of the path point nearest to `sample` in the X/Y plane.
pub fn locate(sample: &Sample, path: &ReferencePath) -> usize {
    locate_point(&sample.position(), path)
}

/// Index of the path point nearest to `position` in the X/Y plane.
///
/// The lowest index wins ties. A path without exactly [`PATH_POINTS`]
/// points cannot be indexed and yields 0.
pub fn locate_point(position: &Point3, path: &ReferencePath) -> usize {
    if !path.is_complete() {
        return 0;
    }

    let mut closest = 0;
    let mut min_dist = f64::MAX;
    for (i, point) in path.points.iter().enumerate() {
        let dist = planar_distance(position, point);
        if dist < min_dist {
            min_dist = dist;
            closest = i;
        }
    }
    closest
}

/// Lap indices for a raw stream of samples, see [`locate_all_points`].
pub fn locate_all(samples: &[Sample]) -> Vec<usize> {
    let positions: Vec<Point3> = samples.iter().map(Sample::position).collect();
    locate_all_points(&positions)
}

/// Indices of the samples that begin a lap. Always starts with 0 for
/// non-empty input.
///
/// From sample [`MIN_SAMPLES_PER_LAP`] onward, a sample that comes back
/// within `5 × mean segment length` of the first position starts a new lap,
/// provided more than [`MIN_SAMPLES_PER_LAP`] samples have passed since the
/// previous lap start.
pub fn lap_starts(positions: &[Point3]) -> Vec<usize> {
    if positions.is_empty() {
        return Vec::new();
    }
    if positions.len() == 1 {
        return vec![0];
    }

    let cumulative = cumulative_arc_lengths(positions);
    lap_starts_with(positions, &cumulative)
}

fn lap_starts_with(positions: &[Point3], cumulative: &[f64]) -> Vec<usize> {
    let origin = positions[0];
    let total = cumulative[cumulative.len() - 1];
    let mean_segment = total / (positions.len() - 1) as f64;
    let threshold = mean_segment * LAP_START_SEGMENT_FACTOR;

    let mut starts = vec![0];
    for (i, position) in positions.iter().enumerate().skip(MIN_SAMPLES_PER_LAP) {
        if planar_distance(position, &origin) >= threshold {
            continue;
        }
        let previous = starts[starts.len() - 1];
        if i - previous > MIN_SAMPLES_PER_LAP {
            starts.push(i);
        }
    }
    starts
}

/// Maps every position to an index within its lap.
///
/// A sample's index is `floor(144 × progress)` clamped to 143, where
/// progress is the fraction of its lap's arc length covered so far. A lap
/// that covers no distance maps entirely to 0.
pub fn locate_all_points(positions: &[Point3]) -> Vec<usize> {
    if positions.len() < 2 {
        return vec![0; positions.len()];
    }

    let cumulative = cumulative_arc_lengths(positions);
    let starts = lap_starts_with(positions, &cumulative);

    let mut indices = Vec::with_capacity(positions.len());
    for (lap, &lap_start) in starts.iter().enumerate() {
        let lap_end = starts
            .get(lap + 1)
            .map(|next| next - 1)
            .unwrap_or(positions.len() - 1);

        let start_dist = cumulative[lap_start];
        let lap_length = cumulative[lap_end] - start_dist;

        for dist in &cumulative[lap_start..=lap_end] {
            let index = if lap_length > 0.0 {
                let progress = (dist - start_dist) / lap_length;
                ((progress * PATH_POINTS as f64).floor() as usize).min(PATH_POINTS - 1)
            } else {
                0
            };
            indices.push(index);
        }
    }
    indices
}
