//! Scene recording and JSON export.
//!
//! [`RecordingRenderer`] stands in for the 3D viewer: it keeps every scene
//! drawn during a run, stamped with the simulation clock. [`SimExport`]
//! writes those frames to JSON for offline inspection.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::SimContext;
use trackviz_env::{ColoredPoint, EnvError, Renderer, TrackVizContext};

/// A single drawn scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub scene: String,
    pub points: Vec<ColoredPoint>,
}

/// Renderer that records every scene.
pub struct RecordingRenderer {
    context: Arc<SimContext>,
    frames: Mutex<Vec<SceneFrame>>,

    /// Reject every draw, to exercise the error path
    failing: bool,
}

impl RecordingRenderer {
    pub fn new(context: Arc<SimContext>) -> Self {
        Self {
            context,
            frames: Mutex::new(Vec::new()),
            failing: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn frames(&self) -> Vec<SceneFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames of one scene, in draw order.
    pub fn scene(&self, name: &str) -> Vec<SceneFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| f.scene == name)
            .cloned()
            .collect()
    }
}

impl Renderer for RecordingRenderer {
    fn draw_scene(&self, name: &str, points: &[ColoredPoint]) -> Result<(), EnvError> {
        if self.failing {
            return Err(EnvError::render("viewer unavailable"));
        }
        let frame = SceneFrame {
            time_sec: self.context.now().as_secs_f64(),
            scene: name.to_string(),
            points: points.to_vec(),
        };
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SceneFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SceneFrame) {
        self.duration_sec = self.duration_sec.max(frame.time_sec);
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
