//! Synthetic course - deterministic upstream for the simulator.
//!
//! The course is a closed loop (an ellipse with a three-lobed wobble and a
//! gentle hill). Every entity drives it at the same pace from its own grid
//! offset; samples are taken at a fixed interval and perturbed with seeded
//! Gaussian noise, so the same seed always yields the same recording.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use trackviz_core::geometry::polyline_length;
use trackviz_env::{
    parse_timestamp, EntityId, EnvError, Point3, Sample, SessionFilter, SessionInfo, UpstreamSource,
};

pub const SESSION_KEY: u32 = 9161;
pub const SESSION_START: &str = "2023-09-17T12:03:00+00:00";

/// Shape and sampling parameters of the course.
#[derive(Debug, Clone)]
pub struct CourseShape {
    pub semi_major: f64,
    pub semi_minor: f64,
    pub wobble: f64,
    pub hill: f64,

    /// Samples taken per lap
    pub samples_per_lap: usize,

    /// Time between two samples of one entity
    pub interval: Duration,

    /// Standard deviation of the position noise
    pub noise_std: f64,
}

impl Default for CourseShape {
    fn default() -> Self {
        Self {
            semi_major: 6000.0,
            semi_minor: 3500.0,
            wobble: 400.0,
            hill: 40.0,
            samples_per_lap: 320,
            interval: Duration::from_millis(270),
            noise_std: 4.0,
        }
    }
}

impl CourseShape {
    /// Noise-free position at lap fraction `progress` (1.0 is one lap).
    pub fn point_at(&self, progress: f64) -> Point3 {
        let theta = 2.0 * PI * progress;
        let r = 1.0 + self.wobble / self.semi_major * (3.0 * theta).sin();
        Point3::new(
            self.semi_major * r * theta.cos(),
            self.semi_minor * r * theta.sin(),
            self.hill * (theta.cos() + 1.0),
        )
    }

    /// Length of one lap, measured on a dense polyline.
    pub fn lap_length(&self) -> f64 {
        let dense: Vec<Point3> = (0..=4096)
            .map(|i| self.point_at(i as f64 / 4096.0))
            .collect();
        polyline_length(&dense)
    }
}

/// Upstream source serving pre-generated recordings.
pub struct CourseSource {
    shape: CourseShape,
    sessions: Vec<SessionInfo>,

    /// Per-entity recordings, sorted by timestamp
    recordings: HashMap<EntityId, Vec<(DateTime<Utc>, Sample)>>,

    /// Probability of a transient fetch failure
    failure_rate: f64,
    failure_rng: Mutex<ChaCha8Rng>,

    fetch_calls: AtomicU64,
    failures: AtomicU64,
}

impl CourseSource {
    /// Records `count` samples for each `(entity, count)`.
    pub fn new(seed: u64, shape: CourseShape, entities: &[(u32, usize)]) -> Self {
        let start = parse_timestamp(SESSION_START).unwrap_or_default();
        let mut noise_rng = ChaCha8Rng::seed_from_u64(seed);
        let noise = Normal::new(0.0, shape.noise_std.max(f64::MIN_POSITIVE)).ok();

        let mut recordings = HashMap::new();
        for (slot, &(entity, count)) in entities.iter().enumerate() {
            let grid_offset = slot as f64 * 3.0 / shape.samples_per_lap as f64;
            let mut samples = Vec::with_capacity(count);
            for k in 0..count {
                let at = start
                    + chrono::Duration::from_std(shape.interval * k as u32)
                        .unwrap_or(chrono::Duration::zero());
                let exact = shape.point_at(k as f64 / shape.samples_per_lap as f64 + grid_offset);
                let mut jitter = || {
                    noise
                        .as_ref()
                        .map(|n| n.sample(&mut noise_rng))
                        .unwrap_or(0.0)
                };
                let sample = Sample {
                    date: at.to_rfc3339_opts(SecondsFormat::Micros, false),
                    driver_number: entity,
                    meeting_key: Some(1219),
                    session_key: Some(SESSION_KEY),
                    x: (exact.x + jitter()).round() as i64,
                    y: (exact.y + jitter()).round() as i64,
                    z: exact.z.round() as i64,
                };
                samples.push((at, sample));
            }
            recordings.insert(EntityId(entity), samples);
        }

        Self {
            shape,
            sessions: vec![SessionInfo {
                session_key: SESSION_KEY,
                date_start: SESSION_START.to_string(),
                date_end: None,
            }],
            recordings,
            failure_rate: 0.0,
            failure_rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed ^ 0x5eed_f00d)),
            fetch_calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Makes a share of window fetches fail transiently.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn shape(&self) -> &CourseShape {
        &self.shape
    }

    /// The full recording of one entity.
    pub fn recording(&self, entity: EntityId) -> Vec<Sample> {
        self.recordings
            .get(&entity)
            .map(|r| r.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn should_fail(&self) -> bool {
        if self.failure_rate <= 0.0 {
            return false;
        }
        self.failure_rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.failure_rate)
    }
}

#[async_trait]
impl UpstreamSource for CourseSource {
    async fn fetch_sessions(&self, _filter: &SessionFilter) -> Result<Vec<SessionInfo>, EnvError> {
        Ok(self.sessions.clone())
    }

    async fn fetch_window(
        &self,
        _session_key: u32,
        entity: EntityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, EnvError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::upstream("simulated 503"));
        }

        let Some(recording) = self.recordings.get(&entity) else {
            return Ok(Vec::new());
        };
        let from = recording.partition_point(|(at, _)| *at < start);
        let to = recording.partition_point(|(at, _)| *at < end);
        Ok(recording[from..to.max(from)]
            .iter()
            .map(|(_, s)| s.clone())
            .collect())
    }
}
