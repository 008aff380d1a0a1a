//! TrackViz Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the TrackViz pipeline run
//! against the live timing service in **Production** (tokio + HTTP) and
//! against synthetic courses in **Simulation** (virtual clock).
//!
//! # Core Concept: Everything External Is a Trait
//!
//! The pipeline never touches the outside world directly:
//! - Time (`now()`, `system_time()`, `sleep()`) via [`TrackVizContext`]
//! - Position data (`fetch_sessions()`, `fetch_window()`) via [`UpstreamSource`]
//! - Output (`draw_scene()`) via [`Renderer`]
//!
//! # Example
//!
//! ```ignore
//! use trackviz_env::{TrackVizContext, UpstreamSource};
//!
//! async fn poll<Ctx: TrackVizContext, Src: UpstreamSource>(ctx: &Ctx, src: &Src) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(1)).await;
//!         let batch = src.fetch_window(session, entity, from, to).await;
//!         // ...
//!     }
//! }
//! ```

mod context;
mod error;
mod render;
mod source;
mod tokio_impl;
mod types;

pub use context::TrackVizContext;
pub use error::EnvError;
pub use render::{NullRenderer, Renderer};
pub use source::UpstreamSource;
pub use tokio_impl::TokioContext;
pub use types::{
    parse_timestamp, Color, ColoredPoint, EntityId, Point3, Sample, SessionFilter, SessionInfo,
};
