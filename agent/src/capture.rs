//! Reference track capture.
//!
//! Pulls a few minutes of one entity's positions from the start of the
//! configured session, resamples the first lap into a [`ReferencePath`],
//! saves it and draws both the path and the raw capture.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use trackviz_core::locator::{lap_starts, locate_all};
use trackviz_core::{locate, scene, ReferencePath};
use trackviz_env::{EntityId, Point3, Renderer, Sample, SessionFilter, UpstreamSource};

/// Samples whose lap index is reported after a capture.
const PREVIEW_SAMPLES: usize = 5;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub filter: SessionFilter,
    pub entity: EntityId,
    pub duration: chrono::Duration,
    /// Loop anchor; the first captured position when unset
    pub start_point: Option<Point3>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub session_key: u32,
    pub samples: usize,
    pub laps: usize,
    pub path: ReferencePath,
    /// Lap index on the new path of the first few captured samples
    pub preview: Vec<usize>,
}

pub async fn capture_reference<Src, R>(
    source: &Src,
    renderer: &R,
    options: &CaptureOptions,
) -> Result<CaptureReport>
where
    Src: UpstreamSource,
    R: Renderer + ?Sized,
{
    let sessions = source
        .fetch_sessions(&options.filter)
        .await
        .context("Failed to list sessions")?;
    let Some(session) = sessions.first() else {
        bail!("No session found for {:?}", options.filter);
    };
    let Some(start) = session.start_time() else {
        bail!("Unparsable session start: {:?}", session.date_start);
    };

    let samples = source
        .fetch_window(session.session_key, options.entity, start, start + options.duration)
        .await
        .context("Failed to fetch capture window")?;
    if samples.is_empty() {
        bail!(
            "No samples for entity {} in session {}",
            options.entity,
            session.session_key
        );
    }
    info!(
        "Captured {} samples for {} from session {}",
        samples.len(),
        options.entity,
        session.session_key
    );

    let start_point = options
        .start_point
        .unwrap_or_else(|| samples[0].position());
    let path = ReferencePath::build(&samples, start_point)?;
    if let Some(parent) = options.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    path.save(&options.output)
        .with_context(|| format!("Failed to save {}", options.output.display()))?;
    info!(
        "Reference path saved to {} (arc length {:.0})",
        options.output.display(),
        path.arc_length()
    );

    if let Err(e) = scene::draw_reference_track(renderer, &path) {
        warn!("Failed to draw reference track: {}", e);
    }
    if let Err(e) = scene::draw_map(renderer, &samples) {
        warn!("Failed to draw map: {}", e);
    }

    let positions: Vec<Point3> = samples.iter().map(Sample::position).collect();
    let laps = lap_starts(&positions).len();
    let indices = locate_all(&samples);
    info!(
        "{} laps in capture, self-indexed {:?}..{:?}",
        laps,
        indices.first(),
        indices.last()
    );

    let preview: Vec<usize> = samples
        .iter()
        .take(PREVIEW_SAMPLES)
        .map(|s| locate(s, &path))
        .collect();
    for (sample, index) in samples.iter().zip(&preview) {
        info!("  {} ({}, {}) -> index {}", sample.date, sample.x, sample.y, index);
    }

    Ok(CaptureReport {
        session_key: session.session_key,
        samples: samples.len(),
        laps,
        path,
        preview,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, SecondsFormat, Utc};
    use trackviz_core::PATH_POINTS;
    use trackviz_env::{EnvError, NullRenderer, SessionInfo};

    pub(crate) const SESSION_START: &str = "2023-09-17T12:03:00+00:00";

    /// Serves a fixed recording, filtering windows by timestamp.
    pub(crate) struct StaticSource {
        pub sessions: Vec<SessionInfo>,
        pub samples: Vec<Sample>,
    }

    impl StaticSource {
        /// `laps` laps around a circle of radius 5000, 300 samples per lap.
        pub fn circle(laps: f64) -> Self {
            let start = trackviz_env::parse_timestamp(SESSION_START).unwrap();
            let count = (300.0 * laps) as usize;
            let samples = (0..count)
                .map(|i| {
                    let angle = i as f64 / 300.0 * std::f64::consts::TAU;
                    let date = (start + chrono::Duration::milliseconds(270 * i as i64))
                        .to_rfc3339_opts(SecondsFormat::Micros, false);
                    Sample::new(
                        EntityId(44),
                        date,
                        (5000.0 * angle.cos()).round() as i64,
                        (5000.0 * angle.sin()).round() as i64,
                        100,
                    )
                })
                .collect();
            Self {
                sessions: vec![SessionInfo {
                    session_key: 9161,
                    date_start: SESSION_START.to_string(),
                    date_end: None,
                }],
                samples,
            }
        }
    }

    #[async_trait]
    impl UpstreamSource for StaticSource {
        async fn fetch_sessions(&self, _: &SessionFilter) -> Result<Vec<SessionInfo>, EnvError> {
            Ok(self.sessions.clone())
        }

        async fn fetch_window(
            &self,
            _session_key: u32,
            entity: EntityId,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Sample>, EnvError> {
            Ok(self
                .samples
                .iter()
                .filter(|s| s.entity() == entity)
                .filter(|s| s.timestamp().is_some_and(|ts| start <= ts && ts < end))
                .cloned()
                .collect())
        }
    }

    fn options(output: PathBuf) -> CaptureOptions {
        CaptureOptions {
            filter: SessionFilter::default(),
            entity: EntityId(44),
            duration: chrono::Duration::minutes(5),
            start_point: None,
            output,
        }
    }

    #[tokio::test]
    async fn test_capture_builds_and_saves_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tracks").join("reference_track.json");
        let source = StaticSource::circle(1.5);

        let report = capture_reference(&source, &NullRenderer, &options(file.clone()))
            .await
            .unwrap();

        assert_eq!(report.session_key, 9161);
        assert_eq!(report.samples, 450);
        assert_eq!(report.laps, 2);
        assert_eq!(report.path.points.len(), PATH_POINTS);
        assert_eq!(report.preview.len(), PREVIEW_SAMPLES);
        assert_eq!(report.preview[0], 0);

        let loaded = ReferencePath::load(&file).unwrap();
        assert_eq!(loaded, report.path);
    }

    #[tokio::test]
    async fn test_capture_without_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = StaticSource::circle(1.0);
        source.sessions.clear();

        let result = capture_reference(&source, &NullRenderer, &options(dir.path().join("r.json"))).await;
        assert!(result.is_err());
        assert!(!dir.path().join("r.json").exists());
    }

    #[tokio::test]
    async fn test_capture_of_unknown_entity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::circle(1.0);
        let mut opts = options(dir.path().join("r.json"));
        opts.entity = EntityId(1);

        assert!(capture_reference(&source, &NullRenderer, &opts).await.is_err());
    }
}
