//! Reference Path - a captured lap resampled onto 144 evenly spaced points.
//!
//! The path is the coordinate system every locator works in: index `i` is the
//! point `i/143` of the way around the loop, measured by planar arc length
//! from the start point. Index 0 and index 143 both sit exactly on the start
//! point so distance-based wraparound is well defined.
//!
//! # Building
//!
//! ```text
//! raw lap:   s0 ── s1 ──── s2 ─ s3 ───────── s4 ─ ... ─ sN ┐
//!                                                          │ closing segment
//! start  ◄─────────────────────────────────────────────────┘
//!
//! resampled: p0 ─ p1 ─ p2 ─ ... ─ p142 ─ p143     (p0 == p143 == start)
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{PathError, StoreError};
use crate::geometry::{cumulative_arc_lengths, lerp3, planar_distance, polyline_length};
use trackviz_env::{Point3, Sample};

/// Number of points on every reference path.
pub const PATH_POINTS: usize = 144;

/// Lap detection never closes the lap before this sample index.
pub const LAP_SCAN_START: usize = 100;

/// Planar distance to the start point below which the lap is considered closed.
pub const LAP_CLOSE_THRESHOLD: f64 = 1000.0;

/// One lap of raw positions with its arc length profile.
#[derive(Debug, Clone)]
pub struct LapProfile {
    /// Positions making up the lap, in travel order
    pub positions: Vec<Point3>,

    /// Running arc length, `cumulative[0] == 0`
    pub cumulative: Vec<f64>,

    /// Where the loop closes
    pub start_point: Point3,

    /// Length of the segment from the last position back to `start_point`
    pub closing_length: f64,
}

impl LapProfile {
    /// Extracts the first complete lap from `positions`.
    ///
    /// The lap ends at the first position at or after [`LAP_SCAN_START`] that
    /// lies within [`LAP_CLOSE_THRESHOLD`] of `start_point`. When no position
    /// qualifies, or the detected lap is shorter than [`PATH_POINTS`], the
    /// whole input is used.
    pub fn detect(positions: &[Point3], start_point: Point3) -> Result<Self, PathError> {
        if positions.len() < PATH_POINTS {
            return Err(PathError::InsufficientData {
                needed: PATH_POINTS,
                got: positions.len(),
            });
        }

        let lap_end = positions
            .iter()
            .enumerate()
            .skip(LAP_SCAN_START)
            .find(|(_, p)| planar_distance(p, &start_point) < LAP_CLOSE_THRESHOLD)
            .map(|(i, _)| i)
            .unwrap_or(positions.len() - 1);

        let lap = if lap_end + 1 < PATH_POINTS {
            positions
        } else {
            &positions[..=lap_end]
        };

        debug!(
            "Lap detected: {} of {} positions (closing index {})",
            lap.len(),
            positions.len(),
            lap_end
        );

        let last = lap[lap.len() - 1];
        Ok(Self {
            cumulative: cumulative_arc_lengths(lap),
            positions: lap.to_vec(),
            start_point,
            closing_length: planar_distance(&last, &start_point),
        })
    }

    /// Arc length travelled inside the lap, excluding the closing segment.
    pub fn in_lap_length(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Total loop length including the closing segment.
    pub fn length(&self) -> f64 {
        self.in_lap_length() + self.closing_length
    }

    /// Returns the point `target` units along the loop.
    ///
    /// Uses the first bracketing pair of raw positions; past the last
    /// position, interpolates along the closing segment instead.
    pub fn point_at(&self, target: f64) -> Point3 {
        let bracket = self
            .cumulative
            .windows(2)
            .position(|pair| pair[0] <= target && target <= pair[1]);

        if let Some(j) = bracket {
            let span = self.cumulative[j + 1] - self.cumulative[j];
            let ratio = if span > 0.0 {
                (target - self.cumulative[j]) / span
            } else {
                0.0
            };
            return lerp3(&self.positions[j], &self.positions[j + 1], ratio);
        }

        let last = self.positions[self.positions.len() - 1];
        let ratio = if self.closing_length > 0.0 {
            (target - self.in_lap_length()) / self.closing_length
        } else {
            0.0
        };
        lerp3(&last, &self.start_point, ratio)
    }
}

/// A normalized closed loop of [`PATH_POINTS`] points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePath {
    pub start_point: Point3,
    pub points: Vec<Point3>,
}

impl ReferencePath {
    /// Builds a path from a captured run of samples.
    ///
    /// # Errors
    /// [`PathError::InsufficientData`] when fewer than 144 samples are given.
    pub fn build(samples: &[Sample], start_point: Point3) -> Result<Self, PathError> {
        let positions: Vec<Point3> = samples.iter().map(Sample::position).collect();
        Self::from_positions(&positions, start_point)
    }

    /// Builds a path from raw positions.
    pub fn from_positions(positions: &[Point3], start_point: Point3) -> Result<Self, PathError> {
        let lap = LapProfile::detect(positions, start_point)?;
        let length = lap.length();
        let last_index = PATH_POINTS - 1;

        let points = (0..PATH_POINTS)
            .map(|i| {
                if i == 0 || i == last_index {
                    start_point
                } else {
                    lap.point_at(i as f64 / last_index as f64 * length)
                }
            })
            .collect();

        Ok(Self {
            start_point,
            points,
        })
    }

    /// Returns true if the path has exactly [`PATH_POINTS`] points.
    pub fn is_complete(&self) -> bool {
        self.points.len() == PATH_POINTS
    }

    /// Planar length of the resampled loop.
    pub fn arc_length(&self) -> f64 {
        polyline_length(&self.points)
    }

    fn validate(self) -> Result<Self, PathError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(PathError::InvalidReferencePath {
                expected: PATH_POINTS,
                got: self.points.len(),
            })
        }
    }

    /// Decodes a path from JSON.
    pub fn from_json(json: &str) -> Result<Self, PathError> {
        let path: Self = serde_json::from_str(json).map_err(StoreError::from)?;
        path.validate()
    }

    /// Loads a persisted path.
    ///
    /// # Errors
    /// [`PathError::InvalidReferencePath`] unless the file holds 144 points.
    pub fn load(file: impl AsRef<Path>) -> Result<Self, PathError> {
        let json = std::fs::read_to_string(file).map_err(StoreError::from)?;
        Self::from_json(&json)
    }

    /// Writes the path as pretty-printed JSON.
    pub fn save(&self, file: impl AsRef<Path>) -> Result<(), PathError> {
        let json = serde_json::to_string_pretty(self).map_err(StoreError::from)?;
        std::fs::write(file, json).map_err(StoreError::from)?;
        Ok(())
    }
}
