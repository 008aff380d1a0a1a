//! Scenario runner - executes deterministic pipeline scenarios.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::SimContext;
use crate::course::{CourseShape, CourseSource, SESSION_KEY, SESSION_START};
use crate::exporter::{RecordingRenderer, SceneFrame};
use crate::scenarios::ScenarioId;

use trackviz_core::fetcher::{FetcherState, TickOutcome, WindowedFetcher};
use trackviz_core::locator::{lap_starts, locate_all, locate_point};
use trackviz_core::scene::{self, MAP_SCENE, MOVEMENT_SCENE, REFERENCE_SCENE};
use trackviz_core::{PipelineConfig, PipelineController, ReferencePath, PATH_POINTS};
use trackviz_env::{parse_timestamp, Color, EntityId, Sample, TrackVizContext, UpstreamSource};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Rounds recorded by the consumer
    pub rounds: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Window fetches issued upstream
    pub fetch_calls: u64,

    /// Fetches that failed transiently
    pub fetch_failures: u64,

    /// Ticks skipped because the queue was above the low threshold
    pub skipped_ticks: u64,

    /// Deepest queue observed
    pub max_queue_depth: usize,

    /// Scenes accepted by the renderer
    pub scenes_drawn: usize,
}

/// Collects failed expectations; the first one becomes the failure reason.
#[derive(Default)]
struct Verdict {
    failures: Vec<String>,
}

impl Verdict {
    fn expect(&mut self, condition: bool, message: impl FnOnce() -> String) {
        if !condition {
            let message = message();
            warn!("  expectation failed: {}", message);
            self.failures.push(message);
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.expect(false, || message.into());
    }

    fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn reason(&self) -> Option<String> {
        self.failures.first().cloned()
    }
}

/// State shared by one scenario run.
struct Run {
    verdict: Verdict,
    metrics: ScenarioMetrics,
    rounds: u64,
    context: Arc<SimContext>,
    renderer: Arc<RecordingRenderer>,
}

impl Run {
    fn new(seed: u64) -> Self {
        let context = SimContext::shared(seed);
        Self {
            verdict: Verdict::default(),
            metrics: ScenarioMetrics::default(),
            rounds: 0,
            renderer: Arc::new(RecordingRenderer::new(context.clone())),
            context,
        }
    }
}

/// Runs pipeline scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Where round logs and reference paths are written
    output_dir: PathBuf,

    /// Pause after each consumer round
    round_pause: Duration,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            output_dir: std::env::temp_dir().join("trackviz-sim"),
            round_pause: Duration::from_millis(10),
        }
    }

    /// Sets the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the pause between rounds.
    pub fn with_round_pause(mut self, pause: Duration) -> Self {
        self.round_pause = pause;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_recorded(scenario).0
    }

    /// Runs a scenario and also returns every scene drawn during it.
    pub fn run_recorded(&self, scenario: ScenarioId) -> (ScenarioResult, Vec<SceneFrame>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut run = Run::new(self.seed);
        match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime.block_on(async {
                match scenario {
                    ScenarioId::Barrier => self.run_barrier(&mut run).await,
                    ScenarioId::Exhaustion => self.run_exhaustion(&mut run).await,
                    ScenarioId::Backpressure => self.run_backpressure(&mut run).await,
                    ScenarioId::ReferenceTrack => self.run_reference_track(&mut run).await,
                    ScenarioId::LapSegmentation => self.run_lap_segmentation(&mut run).await,
                    ScenarioId::FlakyUpstream => self.run_flaky_upstream(&mut run).await,
                }
            }),
            Err(e) => run.verdict.fail(format!("failed to build runtime: {}", e)),
        }

        let frames = run.renderer.frames();
        run.metrics.scenes_drawn = frames.len();

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: run.verdict.passed(),
            rounds: run.rounds,
            final_time_secs: run.context.now().as_secs_f64(),
            failure_reason: run.verdict.reason(),
            metrics: run.metrics,
        };
        (result, frames)
    }

    fn pipeline_config(&self, name: &str) -> PipelineConfig {
        PipelineConfig::default()
            .with_name(name)
            .with_round_pause(self.round_pause)
            .with_round_log(&self.output_dir, format!("{}_rounds", name))
            .with_reference_path_file(self.output_dir.join(format!("{}_reference.json", name)))
    }

    fn controller(
        &self,
        run: &Run,
        source: Arc<CourseSource>,
        name: &str,
    ) -> PipelineController<SimContext, CourseSource, RecordingRenderer> {
        PipelineController::new(
            run.context.clone(),
            source,
            run.renderer.clone(),
            self.pipeline_config(name),
        )
    }

    /// Starts a pipeline, lets it run to exhaustion, stops it and returns
    /// the rounds it recorded.
    async fn run_to_completion(
        &self,
        run: &mut Run,
        source: Arc<CourseSource>,
        entities: &[EntityId],
        name: &str,
    ) -> Option<Vec<trackviz_core::RoundSummary>> {
        let controller = self.controller(run, source.clone(), name);
        if let Err(e) = controller.start(entities).await {
            run.verdict.fail(format!("start failed: {}", e));
            return None;
        }
        controller.wait_finished().await;
        let rounds = controller.rounds();

        let stop = controller.stop().await;
        run.verdict.expect(stop.flush_error.is_none(), || {
            format!("round log flush failed: {:?}", stop.flush_error)
        });
        run.verdict.expect(stop.rounds_flushed == rounds.len(), || {
            format!("flushed {} of {} rounds", stop.rounds_flushed, rounds.len())
        });
        if let Some(file) = &stop.log_file {
            debug!("  round log at {}", file.display());
        }

        run.rounds = rounds.len() as u64;
        run.metrics.fetch_calls = source.fetch_calls();
        run.metrics.fetch_failures = source.failures();
        Some(rounds)
    }

    /// TRK-001: Barrier - three equal streams align into rounds.
    ///
    /// **Assertion**: exactly 10 rounds of 3 entities, and the movement scene
    /// of round r holds 3 trails of min(r, 5) points.
    async fn run_barrier(&self, run: &mut Run) {
        info!("TRK-001: Barrier - 3 entities x 10 samples");

        let entities = [EntityId(1), EntityId(11), EntityId(44)];
        let source = Arc::new(CourseSource::new(
            self.seed,
            CourseShape::default(),
            &[(1, 10), (11, 10), (44, 10)],
        ));
        let Some(rounds) = self.run_to_completion(run, source, &entities, "barrier").await else {
            return;
        };

        run.verdict
            .expect(rounds.len() == 10, || format!("expected 10 rounds, got {}", rounds.len()));
        for entry in &rounds {
            run.verdict.expect(entry.drivers.len() == 3, || {
                format!("round {} has {} entities", entry.round, entry.drivers.len())
            });
        }

        let movement = run.renderer.scene(MOVEMENT_SCENE);
        run.verdict.expect(movement.len() == 10, || {
            format!("expected 10 movement scenes, got {}", movement.len())
        });
        for (r, frame) in movement.iter().enumerate() {
            let expected = 3 * (r + 1).min(5);
            run.verdict.expect(frame.points.len() == expected, || {
                format!(
                    "round {} drew {} points, expected {}",
                    r + 1,
                    frame.points.len(),
                    expected
                )
            });
        }
    }

    /// TRK-002: Exhaustion - one stream closes after 4 samples.
    ///
    /// **Assertion**: rounds 1-4 carry all three entities, rounds 5-10 only
    /// the two remaining ones, and the run ends after round 10.
    async fn run_exhaustion(&self, run: &mut Run) {
        info!("TRK-002: Exhaustion - entity #11 ends after 4 samples");

        let short = EntityId(11);
        let entities = [EntityId(1), short, EntityId(44)];
        let source = Arc::new(CourseSource::new(
            self.seed,
            CourseShape::default(),
            &[(1, 10), (11, 4), (44, 10)],
        ));
        let Some(rounds) = self.run_to_completion(run, source, &entities, "exhaustion").await
        else {
            return;
        };

        run.verdict
            .expect(rounds.len() == 10, || format!("expected 10 rounds, got {}", rounds.len()));
        for entry in &rounds {
            let expected = if entry.round <= 4 { 3 } else { 2 };
            run.verdict.expect(entry.drivers.len() == expected, || {
                format!("round {} has {} entities, expected {}", entry.round, entry.drivers.len(), expected)
            });
            run.verdict.expect(
                entry.round <= 4 || !entry.drivers.contains_key(&short),
                || format!("closed stream {} appears in round {}", short, entry.round),
            );
        }
    }

    /// TRK-003: Backpressure - nobody drains the queue.
    ///
    /// **Assertion**: the queue never holds more than its capacity, a queue
    /// at the low threshold skips the fetch, and cancellation stops a
    /// fetcher blocked on a full queue.
    async fn run_backpressure(&self, run: &mut Run) {
        info!("TRK-003: Backpressure - undrained queue of 50");

        const CAPACITY: usize = 50;
        let entity = EntityId(44);
        let config = self.pipeline_config("backpressure").with_queue_capacity(CAPACITY);
        let source = Arc::new(CourseSource::new(
            self.seed,
            CourseShape::default(),
            &[(44, 2000)],
        ));
        let Some(start) = parse_timestamp(SESSION_START) else {
            run.verdict.fail("session start does not parse");
            return;
        };
        let state = FetcherState {
            session_key: SESSION_KEY,
            entity,
            last_fetched: start,
        };

        // Phase 1: blocked producer
        let (tx, mut rx) = mpsc::channel::<Sample>(CAPACITY);
        let fetcher = WindowedFetcher::new(
            run.context.clone(),
            source.clone(),
            state.clone(),
            tx,
            &config,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fetcher.run(cancel.clone()));

        // 112 samples in the first window: two full queues before it runs dry
        for phase in 0..2 {
            for _ in 0..200 {
                tokio::task::yield_now().await;
            }
            let mut depth = 0;
            while rx.try_recv().is_ok() {
                depth += 1;
            }
            run.metrics.max_queue_depth = run.metrics.max_queue_depth.max(depth);
            run.verdict.expect(depth <= CAPACITY, || {
                format!("queue held {} samples, capacity {}", depth, CAPACITY)
            });
            run.verdict.expect(depth == CAPACITY, || {
                format!("phase {}: expected a full queue, found {}", phase, depth)
            });
        }

        cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(1), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => run.verdict.fail(format!("fetcher task failed: {}", e)),
            Err(_) => run.verdict.fail("fetcher ignored cancellation"),
        }

        // Phase 2: queue exactly at the low threshold
        let (tx, _rx) = mpsc::channel::<Sample>(10);
        for sample in source.recording(entity).into_iter().take(2) {
            if tx.try_send(sample).is_err() {
                run.verdict.fail("could not pre-fill queue");
            }
        }
        let calls_before = source.fetch_calls();
        let mut fetcher =
            WindowedFetcher::new(run.context.clone(), source.clone(), state, tx, &config);
        let outcome = fetcher.tick(&CancellationToken::new()).await;
        if matches!(outcome, TickOutcome::Skipped { .. }) {
            run.metrics.skipped_ticks += 1;
        }
        run.verdict.expect(matches!(outcome, TickOutcome::Skipped { .. }), || {
            format!("expected skip at 20% fill, got {:?}", outcome)
        });
        run.verdict.expect(source.fetch_calls() == calls_before, || {
            "skipped tick still fetched".to_string()
        });

        run.metrics.fetch_calls = source.fetch_calls();
    }

    /// TRK-004: ReferenceTrack - build, persist and draw a reference path.
    ///
    /// **Assertion**: 144 points pinned to the start point, arc length within
    /// 3% of the course length, the persisted path draws 144 gradient points,
    /// and every interior point locates to itself.
    async fn run_reference_track(&self, run: &mut Run) {
        info!("TRK-004: ReferenceTrack - capture 1.3 laps of #44");

        let shape = CourseShape::default();
        let lap_length = shape.lap_length();
        let count = shape.samples_per_lap * 13 / 10;
        let source = Arc::new(CourseSource::new(self.seed, shape, &[(44, count)]));

        let Some(start) = parse_timestamp(SESSION_START) else {
            run.verdict.fail("session start does not parse");
            return;
        };
        let capture = match source
            .fetch_window(SESSION_KEY, EntityId(44), start, start + chrono::Duration::minutes(5))
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                run.verdict.fail(format!("capture failed: {}", e));
                return;
            }
        };
        run.metrics.fetch_calls = source.fetch_calls();

        let start_point = capture[0].position();
        let path = match ReferencePath::build(&capture, start_point) {
            Ok(path) => path,
            Err(e) => {
                run.verdict.fail(format!("build failed: {}", e));
                return;
            }
        };

        run.verdict.expect(path.points.len() == PATH_POINTS, || {
            format!("path has {} points", path.points.len())
        });
        run.verdict.expect(
            path.points.first() == Some(&start_point) && path.points.last() == Some(&start_point),
            || "path is not pinned to the start point".to_string(),
        );
        let arc = path.arc_length();
        let error = (arc - lap_length).abs() / lap_length;
        run.verdict.expect(error < 0.03, || {
            format!("arc length {:.0} vs course {:.0} ({:.1}%)", arc, lap_length, error * 100.0)
        });
        for k in 1..PATH_POINTS - 1 {
            let located = locate_point(&path.points[k], &path);
            run.verdict.expect(located == k, || {
                format!("point {} located to {}", k, located)
            });
        }

        let controller = self.controller(run, source, "reference_track");
        let file = controller.config().reference_path_file.clone();
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            run.verdict.fail(format!("cannot create {}: {}", self.output_dir.display(), e));
            return;
        }
        if let Err(e) = path.save(&file) {
            run.verdict.fail(format!("save failed: {}", e));
            return;
        }
        match controller.draw_reference_track().await {
            Ok(points) => run.verdict.expect(points == PATH_POINTS, || {
                format!("drew {} reference points", points)
            }),
            Err(e) => run.verdict.fail(format!("draw failed: {}", e)),
        }
        if let Err(e) = scene::draw_map(run.renderer.as_ref(), &capture) {
            run.verdict.fail(format!("map draw failed: {}", e));
        }

        let reference = run.renderer.scene(REFERENCE_SCENE);
        run.verdict.expect(
            reference.len() == 1
                && reference[0].points.first().map(|p| p.color) == Some(Color::rgb(0, 0, 255))
                && reference[0].points.last().map(|p| p.color) == Some(Color::rgb(255, 0, 0)),
            || "reference scene missing or not a blue to red gradient".to_string(),
        );
        let map = run.renderer.scene(MAP_SCENE);
        run.verdict.expect(
            map.len() == 1 && map[0].points.len() == capture.len(),
            || "map scene missing".to_string(),
        );

        if let Err(e) = std::fs::remove_file(&file) {
            debug!("  could not remove {}: {}", file.display(), e);
        }
    }

    /// TRK-005: LapSegmentation - 3.5 laps indexed without a reference path.
    ///
    /// **Assertion**: four lap starts, each lap starts at index 0, complete
    /// laps end at 143 and indices never decrease within a lap.
    async fn run_lap_segmentation(&self, run: &mut Run) {
        info!("TRK-005: LapSegmentation - 3.5 laps of #16");

        let shape = CourseShape::default();
        let count = shape.samples_per_lap * 7 / 2;
        let source = CourseSource::new(self.seed, shape, &[(16, count)]);
        let samples = source.recording(EntityId(16));

        let positions: Vec<_> = samples.iter().map(Sample::position).collect();
        let starts = lap_starts(&positions);
        let indices = locate_all(&samples);
        run.rounds = starts.len() as u64;

        run.verdict
            .expect(starts.len() == 4, || format!("expected 4 lap starts, got {:?}", starts));
        run.verdict.expect(indices.len() == samples.len(), || {
            format!("{} indices for {} samples", indices.len(), samples.len())
        });
        run.verdict.expect(indices.iter().all(|&i| i < PATH_POINTS), || {
            "index out of range".to_string()
        });

        for (lap, &lap_start) in starts.iter().enumerate() {
            let lap_end = starts.get(lap + 1).map(|s| s - 1).unwrap_or(indices.len() - 1);
            let Some(lap_indices) = indices.get(lap_start..=lap_end) else {
                run.verdict.fail(format!("lap {} out of bounds", lap));
                continue;
            };
            run.verdict.expect(lap_indices.first() == Some(&0), || {
                format!("lap {} does not start at 0", lap)
            });
            run.verdict.expect(lap_indices.last() == Some(&(PATH_POINTS - 1)), || {
                format!("lap {} does not end at {}", lap, PATH_POINTS - 1)
            });
            run.verdict.expect(lap_indices.windows(2).all(|w| w[0] <= w[1]), || {
                format!("lap {} indices decrease", lap)
            });
        }
    }

    /// TRK-006: FlakyUpstream - transient fetch failures, failing renderer.
    ///
    /// **Assertion**: every sample still arrives (200 rounds of two entities)
    /// and the failed draws do not stop the consumer.
    async fn run_flaky_upstream(&self, run: &mut Run) {
        info!("TRK-006: FlakyUpstream - 30% fetch failures, broken viewer");

        let entities = [EntityId(16), EntityId(55)];
        let source = Arc::new(
            CourseSource::new(self.seed, CourseShape::default(), &[(16, 200), (55, 200)])
                .with_failure_rate(0.3),
        );
        run.renderer = Arc::new(RecordingRenderer::new(run.context.clone()).failing());

        let Some(rounds) = self.run_to_completion(run, source, &entities, "flaky_upstream").await
        else {
            return;
        };

        run.verdict
            .expect(rounds.len() == 200, || format!("expected 200 rounds, got {}", rounds.len()));
        run.verdict.expect(rounds.iter().all(|r| r.drivers.len() == 2), || {
            "a round lost an entity".to_string()
        });
        run.verdict.expect(run.renderer.frames().is_empty(), || {
            "failing renderer recorded frames".to_string()
        });
    }
}
