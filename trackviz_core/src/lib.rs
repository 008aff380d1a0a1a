//! TrackViz Core - position stream ingestion and lap indexing
//!
//! This library covers three concerns:
//! 1. **Ingestion**: one windowed fetcher per entity, paced by a ticker and
//!    gated by its queue's fill level
//! 2. **Synchronization**: a barrier consumer that aligns N streams into
//!    rounds and tolerates streams ending at different times
//! 3. **Mapping**: a 144-point reference path built from one raw lap, and a
//!    locator that classifies positions against it

pub mod command;
pub mod consumer;
pub mod error;
pub mod fetcher;
pub mod geometry;
pub mod locator;
pub mod pipeline;
pub mod reference_path;
pub mod round_log;
pub mod scene;
pub mod trail;

// Re-export key types for convenience
pub use command::{Command, CommandResponse};
pub use consumer::{BarrierConsumer, RoundOutcome};
pub use error::{PathError, PipelineError, StoreError};
pub use fetcher::{FetcherState, TickOutcome, WindowedFetcher};
pub use locator::{locate, locate_all};
pub use pipeline::{PipelineConfig, PipelineController, StartReport, StopReport};
pub use reference_path::{ReferencePath, PATH_POINTS};
pub use round_log::{DriverStamp, RoundLog, RoundSummary};
pub use trail::TrailHistory;
