//! Scene composition for the renderer.
//!
//! | scene        | content                                   | colour                     |
//! |--------------|-------------------------------------------|----------------------------|
//! | `movement`   | every entity's trail, once per round      | red, fading to black       |
//! | `reference`  | the 144 reference path points             | blue (0) → red (143)       |
//! | `map`        | a raw capture, 100 units below the course | black                      |

use tracing::debug;

use crate::reference_path::ReferencePath;
use crate::trail::TrailHistory;
use trackviz_env::{Color, ColoredPoint, EnvError, Renderer, Sample};

pub const MOVEMENT_SCENE: &str = "movement";
pub const REFERENCE_SCENE: &str = "reference";
pub const MAP_SCENE: &str = "map";

/// Vertical offset of the map scene below the raw samples.
pub const MAP_DEPTH: f64 = 100.0;

/// Fade factor of position `pos` in a trail of `len` samples.
///
/// The newest sample is 1.0 and the oldest 0.0; a lone sample is 1.0.
pub fn fade_factor(pos: usize, len: usize) -> f64 {
    if len <= 1 {
        1.0
    } else {
        pos as f64 / (len - 1) as f64
    }
}

/// Points for one trail, oldest first.
pub fn trail_points(trail: &TrailHistory) -> Vec<ColoredPoint> {
    let len = trail.len();
    trail
        .iter()
        .enumerate()
        .map(|(pos, sample)| {
            let red = (255.0 * fade_factor(pos, len)) as u8;
            ColoredPoint::new(sample.position(), Color::rgb(red, 0, 0))
        })
        .collect()
}

/// The movement scene for a set of trails.
pub fn movement_scene<'a>(trails: impl IntoIterator<Item = &'a TrailHistory>) -> Vec<ColoredPoint> {
    trails.into_iter().flat_map(trail_points).collect()
}

/// Colour of reference index `i`.
pub fn reference_color(i: usize) -> Color {
    let red = (i * 255 / 143).min(255) as u8;
    Color::rgb(red, 0, 255 - red)
}

pub fn reference_scene(path: &ReferencePath) -> Vec<ColoredPoint> {
    path.points
        .iter()
        .enumerate()
        .map(|(i, point)| ColoredPoint::new(*point, reference_color(i)))
        .collect()
}

pub fn map_scene(samples: &[Sample]) -> Vec<ColoredPoint> {
    samples
        .iter()
        .map(|s| ColoredPoint::new(s.position().lowered(MAP_DEPTH), Color::BLACK))
        .collect()
}

/// Draws a reference path and returns the number of points sent.
pub fn draw_reference_track<R: Renderer + ?Sized>(
    renderer: &R,
    path: &ReferencePath,
) -> Result<usize, EnvError> {
    let points = reference_scene(path);
    renderer.draw_scene(REFERENCE_SCENE, &points)?;
    debug!("Reference track drawn with {} points", points.len());
    Ok(points.len())
}

/// Draws a raw capture as the map scene.
pub fn draw_map<R: Renderer + ?Sized>(renderer: &R, samples: &[Sample]) -> Result<usize, EnvError> {
    let points = map_scene(samples);
    renderer.draw_scene(MAP_SCENE, &points)?;
    Ok(points.len())
}
