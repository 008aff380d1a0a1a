//! Pipeline Controller - lifecycle and wiring of fetchers and consumer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    PipelineController                        │
//! │                                                              │
//! │  start(entities)                                             │
//! │    ├─ resolve session (UpstreamSource::fetch_sessions)       │
//! │    └─ JoinSet ──┬─ WindowedFetcher(e1) ─► queue(e1) ─┐       │
//! │                 ├─ WindowedFetcher(e2) ─► queue(e2) ─┼─► BarrierConsumer
//! │                 └─ ...                               ┘       │
//! │                                                 │            │
//! │                                                 ▼            │
//! │                                   Mutex<RoundLog> ─► Renderer│
//! │  stop()                                                      │
//! │    cancel ─► join all ─► flush RoundLog ─► release flag      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackviz_core::pipeline::{PipelineConfig, PipelineController};
//! use trackviz_env::{NullRenderer, TokioContext};
//!
//! let controller = PipelineController::new(
//!     TokioContext::shared(),
//!     Arc::new(source),
//!     Arc::new(NullRenderer),
//!     PipelineConfig::default(),
//! );
//!
//! controller.start(&[EntityId(44)]).await?;
//! controller.wait_finished().await;
//! let report = controller.stop().await;
//! ```

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::{Command, CommandResponse};
use crate::consumer::BarrierConsumer;
use crate::error::PipelineError;
use crate::fetcher::{FetcherState, WindowedFetcher};
use crate::reference_path::ReferencePath;
use crate::round_log::{RoundLog, RoundSummary};
use crate::scene;
use crate::trail::TRAIL_LENGTH;
use trackviz_env::{EntityId, Renderer, SessionFilter, TrackVizContext, UpstreamSource};

/// Configuration for a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Logical name (for logging)
    pub name: String,

    /// Capacity of each per-entity queue (default: 500)
    pub queue_capacity: usize,

    /// Fetchers only pull while their queue is below this fill ratio (default: 0.2)
    pub low_threshold: f64,

    /// Length of one upstream window (default: 30s)
    pub fetch_window: Duration,

    /// Fetcher tick period (default: 1s)
    pub tick_period: Duration,

    /// Samples kept per entity for the movement scene (default: 5)
    pub trail_length: usize,

    /// Pause after each round (default: 10ms)
    pub round_pause: Duration,

    /// Which session `start` resolves
    pub session_filter: SessionFilter,

    /// Where `stop` writes the round log
    pub round_log_dir: PathBuf,
    pub round_log_prefix: String,

    /// Reference path read by `draw_reference_track`
    pub reference_path_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "trackviz".to_string(),
            queue_capacity: 500,
            low_threshold: 0.2,
            fetch_window: Duration::from_secs(30),
            tick_period: Duration::from_secs(1),
            trail_length: TRAIL_LENGTH,
            round_pause: Duration::from_millis(10),
            session_filter: SessionFilter::default(),
            round_log_dir: PathBuf::from("."),
            round_log_prefix: "rounds".to_string(),
            reference_path_file: PathBuf::from("reference_track.json"),
        }
    }
}

impl PipelineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_low_threshold(mut self, threshold: f64) -> Self {
        self.low_threshold = threshold;
        self
    }

    pub fn with_fetch_window(mut self, window: Duration) -> Self {
        self.fetch_window = window;
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn with_trail_length(mut self, len: usize) -> Self {
        self.trail_length = len;
        self
    }

    pub fn with_round_pause(mut self, pause: Duration) -> Self {
        self.round_pause = pause;
        self
    }

    pub fn with_session_filter(mut self, filter: SessionFilter) -> Self {
        self.session_filter = filter;
        self
    }

    pub fn with_round_log(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.round_log_dir = dir.into();
        self.round_log_prefix = prefix.into();
        self
    }

    pub fn with_reference_path_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.reference_path_file = file.into();
        self
    }
}

/// Reply of a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub session_key: u32,
    pub entities: Vec<EntityId>,
}

/// Outcome of `stop`. A failed flush is reported, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub was_running: bool,
    pub rounds_flushed: usize,
    pub log_file: Option<PathBuf>,
    pub flush_error: Option<String>,
}

struct RunningPipeline {
    cancel: CancellationToken,
    tasks: JoinSet<()>,

    /// Cancelled once the consumer has returned
    finished: CancellationToken,
}

/// Owns the lifecycle of one fetch/consume pipeline.
///
/// Generic over the context, upstream and renderer implementations so the
/// same controller runs in production and in the simulator.
pub struct PipelineController<Ctx, Src, R>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
    R: Renderer + ?Sized,
{
    context: Arc<Ctx>,
    source: Arc<Src>,
    renderer: Arc<R>,
    config: PipelineConfig,

    /// Set by `start`, released by `stop` or a failed `start`
    started: AtomicBool,

    log: Arc<Mutex<RoundLog>>,
    reference: Option<Arc<ReferencePath>>,
    running: tokio::sync::Mutex<Option<RunningPipeline>>,
}

impl<Ctx, Src, R> PipelineController<Ctx, Src, R>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
    R: Renderer + ?Sized,
{
    pub fn new(context: Arc<Ctx>, source: Arc<Src>, renderer: Arc<R>, config: PipelineConfig) -> Self {
        Self {
            context,
            source,
            renderer,
            config,
            started: AtomicBool::new(false),
            log: Arc::new(Mutex::new(RoundLog::new())),
            reference: None,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Annotates every round entry with lap indices located on `path`.
    pub fn with_reference(mut self, path: Arc<ReferencePath>) -> Self {
        self.reference = Some(path);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// True between a successful `start` and the next `stop`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Snapshot of the rounds recorded since the last flush.
    pub fn rounds(&self) -> Vec<RoundSummary> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .to_vec()
    }

    /// Starts one fetcher per entity plus the consumer and returns at once.
    pub async fn start(&self, entities: &[EntityId]) -> Result<StartReport, PipelineError> {
        validate_entities(entities)?;

        // The flag and `running` only change together under this lock
        let mut running = self.running.lock().await;
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyStarted);
        }

        match self.launch(&mut running, entities).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                warn!("[{}] Start failed: {}", self.config.name, e);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        running: &mut Option<RunningPipeline>,
        entities: &[EntityId],
    ) -> Result<StartReport, PipelineError> {
        // Leftovers of a pipeline that finished on its own
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
            join_all(previous.tasks).await;
        }

        let filter = &self.config.session_filter;
        let session = self
            .source
            .fetch_sessions(filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::NoSessionFound {
                circuit_key: filter.circuit_key,
                session_name: filter.session_name.clone(),
                year: filter.year,
            })?;
        let start_time = session
            .start_time()
            .ok_or_else(|| PipelineError::SessionParseError(session.date_start.clone()))?;

        info!(
            "[{}] Using session {} starting at {}",
            self.config.name,
            session.session_key,
            start_time.to_rfc3339()
        );

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut streams = Vec::with_capacity(entities.len());

        for &entity in entities {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity);
            let state = FetcherState {
                session_key: session.session_key,
                entity,
                last_fetched: start_time,
            };
            let fetcher = WindowedFetcher::new(
                self.context.clone(),
                self.source.clone(),
                state,
                tx,
                &self.config,
            );
            tasks.spawn(fetcher.run(cancel.clone()));
            streams.push((entity, rx));
        }

        let consumer = BarrierConsumer::new(
            self.context.clone(),
            self.renderer.clone(),
            streams,
            self.log.clone(),
        )
        .with_reference(self.reference.clone())
        .with_trail_length(self.config.trail_length)
        .with_round_pause(self.config.round_pause);

        let done = finished.clone().drop_guard();
        let consumer_cancel = cancel.clone();
        tasks.spawn(async move {
            let _done = done;
            consumer.run(consumer_cancel).await;
        });

        *running = Some(RunningPipeline {
            cancel,
            tasks,
            finished,
        });

        info!(
            "[{}] Started {} fetchers and the consumer",
            self.config.name,
            entities.len()
        );
        Ok(StartReport {
            session_key: session.session_key,
            entities: entities.to_vec(),
        })
    }

    /// Resolves once the consumer of the current pipeline has returned.
    /// Returns immediately when nothing is running.
    pub async fn wait_finished(&self) {
        let finished = match self.running.lock().await.as_ref() {
            Some(pipeline) => pipeline.finished.clone(),
            None => return,
        };
        finished.cancelled().await;
    }

    /// Cancels all tasks, waits for them, flushes the round log and
    /// releases the started flag.
    pub async fn stop(&self) -> StopReport {
        let mut running = self.running.lock().await;

        let was_running = match running.take() {
            Some(pipeline) => {
                pipeline.cancel.cancel();
                join_all(pipeline.tasks).await;
                true
            }
            None => false,
        };

        let mut report = self.flush_log();
        report.was_running = was_running;

        self.started.store(false, Ordering::SeqCst);
        info!(
            "[{}] Stopped ({} rounds flushed)",
            self.config.name, report.rounds_flushed
        );
        report
    }

    fn flush_log(&self) -> StopReport {
        let at = DateTime::<Utc>::from(self.context.system_time());
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = log.len();

        match log.flush(&self.config.round_log_dir, &self.config.round_log_prefix, at) {
            Ok(log_file) => StopReport {
                rounds_flushed: if log_file.is_some() { pending } else { 0 },
                log_file,
                ..StopReport::default()
            },
            Err(e) => {
                error!("[{}] Failed to flush round log: {}", self.config.name, e);
                StopReport {
                    flush_error: Some(e.to_string()),
                    ..StopReport::default()
                }
            }
        }
    }

    /// Loads the persisted reference path and draws it.
    ///
    /// Returns the number of points in the path; a render failure is only
    /// logged.
    pub async fn draw_reference_track(&self) -> Result<usize, PipelineError> {
        let path = ReferencePath::load(&self.config.reference_path_file)?;
        match scene::draw_reference_track(self.renderer.as_ref(), &path) {
            Ok(count) => Ok(count),
            Err(e) => {
                error!("[{}] Failed to draw reference track: {}", self.config.name, e);
                Ok(path.points.len())
            }
        }
    }

    /// Dispatches a parsed command.
    pub async fn execute(&self, command: Command) -> Result<CommandResponse, PipelineError> {
        match command {
            Command::Start { entities } => {
                let report = self.start(&entities).await?;
                Ok(CommandResponse::Started {
                    session_key: report.session_key,
                    entities: report.entities,
                })
            }
            Command::Stop => {
                let report = self.stop().await;
                Ok(CommandResponse::Stopped {
                    was_running: report.was_running,
                    rounds_flushed: report.rounds_flushed,
                    log_file: report.log_file,
                    flush_error: report.flush_error,
                })
            }
            Command::DrawReferenceTrack => Ok(CommandResponse::ReferenceDrawn {
                points: self.draw_reference_track().await?,
            }),
        }
    }
}

fn validate_entities(entities: &[EntityId]) -> Result<(), PipelineError> {
    if entities.is_empty() {
        return Err(PipelineError::EmptyEntityList);
    }
    let mut seen = BTreeSet::new();
    for entity in entities {
        if !seen.insert(*entity) {
            return Err(PipelineError::InvalidEntityId(format!(
                "{} listed twice",
                entity.get()
            )));
        }
    }
    Ok(())
}

async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Pipeline task panicked: {}", e);
            }
        }
    }
}
