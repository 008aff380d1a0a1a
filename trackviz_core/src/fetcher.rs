//! Windowed Fetcher - per-entity producer paced by a ticker and backpressure.
//!
//! ```text
//!            tick (1s)
//!               │
//!     fill < 20%? ── no ──► skip
//!               │ yes
//!     fetch [last, last + 30s)
//!               │
//!      empty? ── yes ──► close queue, stop
//!               │ no
//!     push each sample (waits while the queue is full)
//!     last = last sample + 1ms
//! ```
//!
//! The queue is a bounded `tokio::sync::mpsc` channel owned by exactly one
//! fetcher and drained by the barrier consumer. Dropping the sender is what
//! closes the stream.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineConfig;
use trackviz_env::{EntityId, Sample, TrackVizContext, UpstreamSource};

/// Mutable cursor of one entity's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherState {
    pub session_key: u32,
    pub entity: EntityId,

    /// Start of the next window to fetch (inclusive)
    pub last_fetched: DateTime<Utc>,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Queue too full, nothing fetched
    Skipped { fill: f64 },

    /// A batch was fetched and fully queued
    Delivered { count: usize },

    /// Upstream returned no data; the queue is now closed
    Exhausted,

    /// Fetch failed; state unchanged, retry next tick
    Failed,

    /// Consumer dropped its end of the queue
    Disconnected,

    /// Cancellation observed mid-tick
    Cancelled,
}

impl TickOutcome {
    /// Returns true if the fetch loop must stop after this tick.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TickOutcome::Exhausted | TickOutcome::Disconnected | TickOutcome::Cancelled
        )
    }
}

/// Queue fill ratio as seen from the producer side.
pub fn fill_ratio(tx: &mpsc::Sender<Sample>) -> f64 {
    let capacity = tx.max_capacity();
    let queued = capacity - tx.capacity();
    queued as f64 / capacity as f64
}

/// Producer for one entity's stream.
pub struct WindowedFetcher<Ctx, Src>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
{
    context: Arc<Ctx>,
    source: Arc<Src>,
    state: FetcherState,

    /// `None` once the stream is closed
    tx: Option<mpsc::Sender<Sample>>,

    window: chrono::Duration,
    tick_period: Duration,
    low_threshold: f64,
}

impl<Ctx, Src> WindowedFetcher<Ctx, Src>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
{
    pub fn new(
        context: Arc<Ctx>,
        source: Arc<Src>,
        state: FetcherState,
        tx: mpsc::Sender<Sample>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            context,
            source,
            state,
            tx: Some(tx),
            window: chrono::Duration::milliseconds(config.fetch_window.as_millis() as i64),
            tick_period: config.tick_period,
            low_threshold: config.low_threshold,
        }
    }

    pub fn state(&self) -> &FetcherState {
        &self.state
    }

    pub fn entity(&self) -> EntityId {
        self.state.entity
    }

    /// True until the stream has been closed.
    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Current fill ratio, 0 once closed.
    pub fn fill(&self) -> f64 {
        self.tx.as_ref().map(fill_ratio).unwrap_or(0.0)
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("Stream {} closed", self.state.entity);
        }
    }

    /// Runs one fetch cycle.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> TickOutcome {
        let Some(tx) = self.tx.clone() else {
            return TickOutcome::Exhausted;
        };

        let fill = fill_ratio(&tx);
        if fill >= self.low_threshold {
            return TickOutcome::Skipped { fill };
        }

        let start = self.state.last_fetched;
        let end = start
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TickOutcome::Cancelled,
            fetched = self.source.fetch_window(self.state.session_key, self.state.entity, start, end) => fetched,
        };

        let samples = match fetched {
            Ok(samples) => samples,
            Err(e) => {
                error!("Failed to fetch location data for {}: {}", self.state.entity, e);
                return TickOutcome::Failed;
            }
        };

        if samples.is_empty() {
            info!("No more location data for {}, closing stream", self.state.entity);
            self.close();
            return TickOutcome::Exhausted;
        }

        // +1ms so the boundary sample is not fetched again (the window start is inclusive)
        let next = samples
            .last()
            .and_then(Sample::timestamp)
            .and_then(|ts| ts.checked_add_signed(chrono::Duration::milliseconds(1)))
            .unwrap_or(end);

        let count = samples.len();
        for sample in samples {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return TickOutcome::Cancelled,
                sent = tx.send(sample) => {
                    if sent.is_err() {
                        warn!("Consumer gone, stopping fetcher for {}", self.state.entity);
                        self.close();
                        return TickOutcome::Disconnected;
                    }
                }
            }
        }

        self.state.last_fetched = next;
        debug!(
            "Fetched {} locations for {}, buffer level: {:.2}%",
            count,
            self.state.entity,
            fill * 100.0
        );
        TickOutcome::Delivered { count }
    }

    /// Fetch loop: one tick per period until exhausted or cancelled.
    ///
    /// Ticks run at a fixed rate measured on the context clock, so the time
    /// spent fetching and queueing does not stretch the period. Ticks missed
    /// while a slow tick was running are dropped. The queue is closed when
    /// this returns, whatever the reason.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Fetcher for {} started at {} (session {})",
            self.state.entity,
            self.state.last_fetched.to_rfc3339(),
            self.state.session_key
        );

        let mut deadline = self.context.now() + self.tick_period;
        loop {
            let wait = deadline.saturating_sub(self.context.now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Fetcher for {} cancelled", self.state.entity);
                    break;
                }
                _ = self.context.sleep(wait) => {}
            }

            let outcome = self.tick(&cancel).await;
            if outcome.is_terminal() {
                debug!("Fetcher for {} finished: {:?}", self.state.entity, outcome);
                break;
            }
            deadline = next_deadline(deadline, self.context.now(), self.tick_period);
        }

        self.close();
    }
}

/// First tick deadline after `deadline` that is not already in the past.
pub fn next_deadline(deadline: Duration, now: Duration, period: Duration) -> Duration {
    let next = deadline + period;
    if next >= now || period.is_zero() {
        return next;
    }
    let missed = (now - next).as_nanos().div_ceil(period.as_nanos());
    next + period * u32::try_from(missed).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use trackviz_env::{EnvError, SessionFilter, SessionInfo, TokioContext};

    const T0: &str = "2023-09-17T12:00:00Z";

    fn t0() -> DateTime<Utc> {
        trackviz_env::parse_timestamp(T0).unwrap()
    }

    fn sample_at(entity: u32, offset_ms: i64) -> Sample {
        let ts = t0() + chrono::Duration::milliseconds(offset_ms);
        Sample::new(entity.into(), ts.to_rfc3339(), offset_ms, 0, 0)
    }

    /// Serves a fixed recording, honouring the requested window.
    struct RecordedSource {
        samples: Vec<Sample>,
        failures_left: AtomicUsize,
        calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        call_times: Mutex<Vec<tokio::time::Instant>>,
        latency: Duration,
    }

    impl RecordedSource {
        fn new(samples: Vec<Sample>) -> Self {
            Self {
                samples,
                failures_left: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                call_times: Mutex::new(Vec::new()),
                latency: Duration::ZERO,
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn failing_first(self, n: usize) -> Self {
            self.failures_left.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl UpstreamSource for RecordedSource {
        async fn fetch_sessions(&self, _filter: &SessionFilter) -> Result<Vec<SessionInfo>, EnvError> {
            Ok(Vec::new())
        }

        async fn fetch_window(
            &self,
            _session_key: u32,
            _entity: EntityId,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Sample>, EnvError> {
            self.calls.lock().unwrap().push((start, end));
            self.call_times.lock().unwrap().push(tokio::time::Instant::now());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EnvError::upstream("503 Service Unavailable"));
            }
            Ok(self
                .samples
                .iter()
                .filter(|s| {
                    let ts = s.timestamp().unwrap_or(start);
                    ts >= start && ts < end
                })
                .cloned()
                .collect())
        }
    }

    fn fetcher(
        source: Arc<RecordedSource>,
        capacity: usize,
    ) -> (WindowedFetcher<TokioContext, RecordedSource>, mpsc::Receiver<Sample>) {
        let config = PipelineConfig::default().with_queue_capacity(capacity);
        let (tx, rx) = mpsc::channel(capacity);
        let state = FetcherState {
            session_key: 9161,
            entity: EntityId(44),
            last_fetched: t0(),
        };
        (
            WindowedFetcher::new(TokioContext::shared(), source, state, tx, &config),
            rx,
        )
    }

    #[tokio::test]
    async fn test_tick_delivers_and_advances_past_last_sample() {
        let source = Arc::new(RecordedSource::new(vec![
            sample_at(44, 0),
            sample_at(44, 400),
            sample_at(44, 30_200),
        ]));
        let (mut fetcher, mut rx) = fetcher(source.clone(), 100);
        let cancel = CancellationToken::new();

        assert_eq!(fetcher.tick(&cancel).await, TickOutcome::Delivered { count: 2 });
        assert_eq!(
            fetcher.state().last_fetched,
            t0() + chrono::Duration::milliseconds(401)
        );
        assert_eq!(rx.recv().await.unwrap().x, 0);
        assert_eq!(rx.recv().await.unwrap().x, 400);

        assert_eq!(fetcher.tick(&cancel).await, TickOutcome::Delivered { count: 1 });
        assert_eq!(rx.recv().await.unwrap().x, 30_200);
        assert_eq!(fetcher.tick(&cancel).await, TickOutcome::Exhausted);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_requested_window_spans_thirty_seconds() {
        let source = Arc::new(RecordedSource::new(vec![sample_at(44, 10)]));
        let (mut fetcher, _rx) = fetcher(source.clone(), 100);
        fetcher.tick(&CancellationToken::new()).await;

        let calls = source.calls.lock().unwrap();
        assert_eq!(calls[0].0, t0());
        assert_eq!(calls[0].1, t0() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_empty_window_closes_stream() {
        let source = Arc::new(RecordedSource::new(Vec::new()));
        let (mut fetcher, mut rx) = fetcher(source, 100);

        assert!(fetcher.is_open());
        assert_eq!(fetcher.tick(&CancellationToken::new()).await, TickOutcome::Exhausted);
        assert!(!fetcher.is_open());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_timestamp_advances_to_window_end() {
        let mut broken = sample_at(44, 500);
        broken.date = "garbage".to_string();
        let source = Arc::new(RecordedSource::new(vec![broken]));
        let (mut fetcher, _rx) = fetcher(source, 100);

        assert_eq!(
            fetcher.tick(&CancellationToken::new()).await,
            TickOutcome::Delivered { count: 1 }
        );
        assert_eq!(fetcher.state().last_fetched, t0() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_state() {
        let source = Arc::new(RecordedSource::new(vec![sample_at(44, 0)]).failing_first(1));
        let (mut fetcher, mut rx) = fetcher(source, 100);
        let cancel = CancellationToken::new();

        assert_eq!(fetcher.tick(&cancel).await, TickOutcome::Failed);
        assert_eq!(fetcher.state().last_fetched, t0());
        assert!(fetcher.is_open());

        assert_eq!(fetcher.tick(&cancel).await, TickOutcome::Delivered { count: 1 });
        assert_eq!(rx.recv().await.unwrap().x, 0);
    }

    #[tokio::test]
    async fn test_skips_while_queue_above_low_threshold() {
        let source = Arc::new(RecordedSource::new(vec![sample_at(44, 0)]));
        let (mut fetcher, mut rx) = fetcher(source.clone(), 10);

        // Pre-fill 2 of 10 slots: exactly the 20% threshold.
        let tx = fetcher.tx.clone().unwrap();
        tx.send(sample_at(44, -2)).await.unwrap();
        tx.send(sample_at(44, -1)).await.unwrap();
        drop(tx);

        let outcome = fetcher.tick(&CancellationToken::new()).await;
        assert!(matches!(outcome, TickOutcome::Skipped { fill } if (fill - 0.2).abs() < 1e-9));
        assert!(source.calls.lock().unwrap().is_empty());

        rx.recv().await.unwrap();
        assert!(fetcher.fill() < 0.2);
        assert_eq!(fetcher.tick(&CancellationToken::new()).await, TickOutcome::Delivered { count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_blocks_at_capacity() {
        let batch: Vec<Sample> = (0..25).map(|i| sample_at(44, i * 10)).collect();
        let source = Arc::new(RecordedSource::new(batch));
        let (fetcher, mut rx) = fetcher(source, 10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(fetcher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 10);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_blocked_push() {
        let batch: Vec<Sample> = (0..5).map(|i| sample_at(44, i)).collect();
        let source = Arc::new(RecordedSource::new(batch));
        let (fetcher, mut rx) = fetcher(source, 2);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(fetcher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("fetcher did not stop")
            .unwrap();

        // Whatever was queued drains, then the stream reports closed.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_recording_then_closes() {
        let batch: Vec<Sample> = (0..90).map(|i| sample_at(44, i * 1000)).collect();
        let source = Arc::new(RecordedSource::new(batch));
        let (fetcher, mut rx) = fetcher(source, 500);

        let handle = tokio::spawn(fetcher.run(CancellationToken::new()));
        let mut received = Vec::new();
        while let Some(sample) = rx.recv().await {
            received.push(sample.x);
        }
        handle.await.unwrap();

        assert_eq!(received.len(), 90);
        assert!(received.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetches_keep_fixed_tick_rate() {
        let source = Arc::new(
            RecordedSource::new(Vec::new())
                .failing_first(4)
                .with_latency(Duration::from_millis(400)),
        );
        let (fetcher, mut rx) = fetcher(source.clone(), 10);

        let handle = tokio::spawn(fetcher.run(CancellationToken::new()));
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();

        let times = source.call_times.lock().unwrap().clone();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(1));
        }
    }

    #[test]
    fn test_next_deadline_drops_missed_ticks() {
        let s = Duration::from_secs;
        let ms = Duration::from_millis;
        assert_eq!(next_deadline(s(1), ms(1400), s(1)), s(2));
        assert_eq!(next_deadline(s(1), s(2), s(1)), s(2));
        assert_eq!(next_deadline(s(1), ms(3500), s(1)), s(4));
        assert_eq!(next_deadline(s(1), s(9), Duration::ZERO), s(1));
    }
}
