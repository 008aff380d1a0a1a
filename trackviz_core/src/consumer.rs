//! Barrier Consumer - merges N entity streams into synchronized rounds.
//!
//! Every round takes exactly one sample from each open stream, read strictly
//! in enumeration order. A stream that reports closed leaves the open set for
//! good; the consumer finishes once the open set is empty.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::locator::locate;
use crate::reference_path::ReferencePath;
use crate::round_log::{DriverStamp, RoundLog};
use crate::scene::{movement_scene, MOVEMENT_SCENE};
use crate::trail::TrailHistory;
use trackviz_env::{EntityId, Renderer, Sample, TrackVizContext};

/// Result of one call to [`BarrierConsumer::next_round`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Round with this number was recorded
    Complete(u64),

    /// Every stream is closed and drained
    Finished,

    Cancelled,
}

pub struct BarrierConsumer<Ctx, R>
where
    Ctx: TrackVizContext,
    R: Renderer + ?Sized,
{
    context: Arc<Ctx>,
    renderer: Arc<R>,

    /// Open streams in enumeration order
    streams: Vec<(EntityId, mpsc::Receiver<Sample>)>,

    trails: BTreeMap<EntityId, TrailHistory>,
    log: Arc<Mutex<RoundLog>>,

    /// When set, each round entry carries the located lap index
    reference: Option<Arc<ReferencePath>>,

    trail_length: usize,
    round_pause: Duration,
}

impl<Ctx, R> BarrierConsumer<Ctx, R>
where
    Ctx: TrackVizContext,
    R: Renderer + ?Sized,
{
    pub fn new(
        context: Arc<Ctx>,
        renderer: Arc<R>,
        streams: Vec<(EntityId, mpsc::Receiver<Sample>)>,
        log: Arc<Mutex<RoundLog>>,
    ) -> Self {
        Self {
            context,
            renderer,
            streams,
            trails: BTreeMap::new(),
            log,
            reference: None,
            trail_length: crate::trail::TRAIL_LENGTH,
            round_pause: Duration::from_millis(10),
        }
    }

    pub fn with_reference(mut self, reference: Option<Arc<ReferencePath>>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_trail_length(mut self, trail_length: usize) -> Self {
        self.trail_length = trail_length;
        self
    }

    pub fn with_round_pause(mut self, round_pause: Duration) -> Self {
        self.round_pause = round_pause;
        self
    }

    /// Entities whose streams are still open, in read order.
    pub fn open_streams(&self) -> Vec<EntityId> {
        self.streams.iter().map(|(entity, _)| *entity).collect()
    }

    pub fn trail(&self, entity: EntityId) -> Option<&TrailHistory> {
        self.trails.get(&entity)
    }

    /// Collects one round.
    pub async fn next_round(&mut self, cancel: &CancellationToken) -> RoundOutcome {
        let mut collected: Vec<(EntityId, Sample)> = Vec::with_capacity(self.streams.len());

        let mut i = 0;
        while i < self.streams.len() {
            let entity = self.streams[i].0;
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RoundOutcome::Cancelled,
                received = self.streams[i].1.recv() => received,
            };

            match received {
                Some(sample) => {
                    collected.push((entity, sample));
                    i += 1;
                }
                None => {
                    info!("Stream {} exhausted", entity);
                    self.streams.remove(i);
                }
            }
        }

        if collected.is_empty() {
            return RoundOutcome::Finished;
        }

        let round = self.record(&collected);

        let trail_length = self.trail_length;
        for (entity, sample) in collected {
            self.trails
                .entry(entity)
                .or_insert_with(|| TrailHistory::new(trail_length))
                .push(sample);
        }

        let points = movement_scene(self.trails.values());
        if let Err(e) = self.renderer.draw_scene(MOVEMENT_SCENE, &points) {
            error!("Failed to render round {}: {}", round, e);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = self.context.sleep(self.round_pause) => {}
        }

        RoundOutcome::Complete(round)
    }

    fn record(&self, collected: &[(EntityId, Sample)]) -> u64 {
        let timestamp = DateTime::<Utc>::from(self.context.system_time());
        let drivers = collected
            .iter()
            .map(|(entity, sample)| {
                let index = self.reference.as_deref().map(|path| locate(sample, path));
                (*entity, DriverStamp::from_sample(sample, index))
            })
            .collect();

        let round = self
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(timestamp, drivers);
        debug!("Round {} recorded with {} entities", round, collected.len());
        round
    }

    /// Consumes rounds until every stream is exhausted or `cancel` fires.
    ///
    /// Returns the number of rounds completed by this call.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        info!("Consumer started with {} streams", self.streams.len());

        let mut rounds = 0;
        loop {
            match self.next_round(&cancel).await {
                RoundOutcome::Complete(_) => rounds += 1,
                RoundOutcome::Finished => {
                    info!("All streams exhausted after {} rounds", rounds);
                    break;
                }
                RoundOutcome::Cancelled => {
                    info!("Consumer cancelled after {} rounds", rounds);
                    break;
                }
            }
        }
        rounds
    }
}
