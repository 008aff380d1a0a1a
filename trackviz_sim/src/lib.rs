//! TrackViz Deterministic Simulation Testing (DST) Harness
//!
//! Runs the real pipeline (fetchers, barrier consumer, controller, path
//! builder and locator) against a synthetic course, with every source of
//! non-determinism under control:
//! - **Time**: a virtual clock; `sleep` advances it and yields
//! - **Upstream**: recordings generated from a single 64-bit seed
//! - **Viewer**: a renderer that records every scene
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ current-thread runtime + SimContext (virtual clock)  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼─────────┐    ┌────────────────────┐    ┌─────────┐  │
//! │  │ CourseSource │───►│ PipelineController │───►│Recording│  │
//! │  │ (seeded)     │    │ fetchers+consumer  │    │Renderer │  │
//! │  └──────────────┘    └────────────────────┘    └─────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackviz_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Barrier);
//! assert!(result.passed);
//! ```

mod context;
mod course;
mod exporter;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use course::{CourseShape, CourseSource, SESSION_KEY, SESSION_START};
pub use exporter::{RecordingRenderer, SceneFrame, SimExport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
