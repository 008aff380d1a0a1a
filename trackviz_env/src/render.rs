//! Renderer abstraction.

use crate::error::EnvError;
use crate::types::ColoredPoint;

/// Sink for named point-cloud scenes.
///
/// Drawing is fire-and-forget: callers log a returned error and carry on.
/// Each call replaces the previous content of the scene with the same name.
pub trait Renderer: Send + Sync + 'static {
    fn draw_scene(&self, name: &str, points: &[ColoredPoint]) -> Result<(), EnvError>;
}

/// Renderer that discards every scene.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn draw_scene(&self, _name: &str, _points: &[ColoredPoint]) -> Result<(), EnvError> {
        Ok(())
    }
}
