//! Scene sink for the agent.
//!
//! Every scene is logged; with an output directory, the latest content of
//! each scene is also written to `{dir}/{scene}.json` so an external viewer
//! can poll it. Files are written on a blocking writer task fed through a
//! bounded queue, so drawing never waits on the disk.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use trackviz_env::{ColoredPoint, EnvError, Renderer};

/// Scenes waiting for the writer before `draw_scene` starts refusing.
const SCENE_QUEUE: usize = 16;

type SceneJob = (String, Vec<ColoredPoint>);

#[derive(Debug, Default)]
pub struct SceneFileRenderer {
    dir: Option<PathBuf>,
    queue: Mutex<Option<mpsc::Sender<SceneJob>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SceneFileRenderer {
    /// Must be called from within a tokio runtime when `dir` is set.
    pub fn new(dir: Option<PathBuf>) -> Self {
        let Some(out) = dir.clone() else {
            return Self::default();
        };

        let (tx, mut rx) = mpsc::channel::<SceneJob>(SCENE_QUEUE);
        let writer = tokio::task::spawn_blocking(move || {
            while let Some((name, points)) = rx.blocking_recv() {
                if let Err(e) = write_scene(&out, &name, &points) {
                    error!("Failed to write scene '{}' to {}: {}", name, out.display(), e);
                }
            }
        });

        Self {
            dir,
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn scene_file(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| scene_path(dir, name))
    }

    /// Writes out every queued scene and stops the writer. Later scenes are
    /// only logged.
    pub async fn finish(&self) {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Scene writer failed: {}", e);
            }
        }
    }
}

fn scene_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Write then rename so a poller never sees a half-written scene.
fn write_scene(dir: &Path, name: &str, points: &[ColoredPoint]) -> std::io::Result<()> {
    let file = scene_path(dir, name);
    let tmp = file.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(points)?)?;
    std::fs::rename(&tmp, &file)
}

impl Renderer for SceneFileRenderer {
    fn draw_scene(&self, name: &str, points: &[ColoredPoint]) -> Result<(), EnvError> {
        debug!("scene '{}': {} points", name, points.len());

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = queue.as_ref() else {
            return Ok(());
        };
        tx.try_send((name.to_string(), points.to_vec()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    EnvError::render(format!("scene writer busy, dropped '{}'", name))
                }
                TrySendError::Closed(_) => EnvError::render("scene writer stopped"),
            })
    }
}
