//! TrackViz Agent - live position pipeline over the OpenF1 API
//!
//! Two modes:
//! - `serve` (default): reads JSON-lines commands on stdin and drives one
//!   pipeline (`start`, `stop`, `draw_reference_track`)
//! - `capture-reference`: builds and saves a reference path from the start
//!   of the configured session

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trackviz_core::{PipelineConfig, PipelineController, ReferencePath};
use trackviz_env::{EntityId, Point3, SessionFilter, TokioContext};

mod capture;
mod control;
mod openf1;
mod renderer;

use capture::{capture_reference, CaptureOptions};
use openf1::{OpenF1Source, DEFAULT_BASE_URL};
use renderer::SceneFileRenderer;

#[derive(Parser, Debug)]
#[command(name = "trackviz-agent")]
#[command(about = "Stream vehicle positions from OpenF1 into a 3D viewer", long_about = None)]
struct Cli {
    #[command(flatten)]
    upstream: UpstreamArgs,

    #[command(flatten)]
    serve: ServeArgs,

    /// Write the latest content of every scene to DIR/<scene>.json
    #[arg(long, env = "TRACKVIZ_SCENE_DIR", global = true)]
    scene_dir: Option<PathBuf>,

    /// Reference path file
    #[arg(long, env = "TRACKVIZ_REFERENCE_FILE", default_value = "reference_track.json", global = true)]
    reference_file: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Args, Debug)]
struct UpstreamArgs {
    /// OpenF1 API base URL
    #[arg(long, env = "TRACKVIZ_API_URL", default_value = DEFAULT_BASE_URL, global = true)]
    api_url: String,

    /// HTTP timeout in seconds
    #[arg(long, env = "TRACKVIZ_HTTP_TIMEOUT", default_value = "10", global = true)]
    http_timeout: u64,

    #[arg(long, env = "TRACKVIZ_CIRCUIT_KEY", default_value = "9", global = true)]
    circuit_key: u32,

    #[arg(long, env = "TRACKVIZ_SESSION_NAME", default_value = "Race", global = true)]
    session_name: String,

    #[arg(long, env = "TRACKVIZ_YEAR", default_value = "2023", global = true)]
    year: i32,
}

impl UpstreamArgs {
    fn filter(&self) -> SessionFilter {
        SessionFilter {
            circuit_key: self.circuit_key,
            session_name: self.session_name.clone(),
            year: self.year,
        }
    }

    fn source(&self) -> Result<OpenF1Source> {
        OpenF1Source::new(&self.api_url, Duration::from_secs(self.http_timeout))
    }
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve JSON-lines commands on stdin (default)
    Serve,

    /// Capture a reference path from the start of the session
    CaptureReference(CaptureArgs),
}

/// Pipeline options; accepted with or without the `serve` subcommand.
#[derive(Args, Debug)]
struct ServeArgs {
    /// Directory for round logs written on stop
    #[arg(long, env = "TRACKVIZ_ROUND_LOG_DIR", default_value = ".", global = true)]
    round_log_dir: PathBuf,

    /// Per-entity queue capacity
    #[arg(long, env = "TRACKVIZ_QUEUE_CAPACITY", default_value = "500", global = true)]
    queue_capacity: usize,

    /// Annotate rounds with lap indices from the reference file, if present
    #[arg(long, global = true)]
    annotate: bool,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Driver number to capture
    #[arg(long, default_value = "44")]
    driver: u32,

    /// Capture length in minutes from the session start
    #[arg(long, default_value = "5")]
    minutes: i64,

    /// Loop anchor as X,Y,Z (defaults to the first captured position)
    #[arg(long, value_parser = parse_point)]
    start_point: Option<Point3>,
}

fn parse_point(raw: &str) -> Result<Point3, String> {
    let coords: Vec<f64> = raw
        .split(',')
        .map(|c| c.trim().parse::<f64>().map_err(|e| format!("{}: {}", c, e)))
        .collect::<Result<_, _>>()?;
    match coords.as_slice() {
        [x, y, z] => Ok(Point3::new(*x, *y, *z)),
        _ => Err(format!("expected X,Y,Z, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command replies
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("TrackViz Agent v{}", env!("CARGO_PKG_VERSION"));

    if let Some(dir) = &cli.scene_dir {
        std::fs::create_dir_all(dir)?;
    }
    let renderer = Arc::new(SceneFileRenderer::new(cli.scene_dir.clone()));
    let source = Arc::new(cli.upstream.source()?);

    let outcome = match cli.mode {
        Some(Mode::CaptureReference(args)) => {
            let options = CaptureOptions {
                filter: cli.upstream.filter(),
                entity: EntityId(args.driver),
                duration: chrono::Duration::minutes(args.minutes),
                start_point: args.start_point,
                output: cli.reference_file,
            };
            capture_reference(source.as_ref(), renderer.as_ref(), &options)
                .await
                .map(|report| {
                    info!(
                        "Reference path from session {}: {} samples, {} laps",
                        report.session_key, report.samples, report.laps
                    );
                })
        }
        Some(Mode::Serve) | None => {
            serve(&cli.upstream, cli.reference_file, cli.serve, source, renderer.clone()).await
        }
    };

    // Pending scene files are written before exit
    renderer.finish().await;
    outcome
}

async fn serve(
    upstream: &UpstreamArgs,
    reference_file: PathBuf,
    args: ServeArgs,
    source: Arc<OpenF1Source>,
    renderer: Arc<SceneFileRenderer>,
) -> Result<()> {
    let config = PipelineConfig::default()
        .with_name("agent")
        .with_queue_capacity(args.queue_capacity)
        .with_session_filter(upstream.filter())
        .with_round_log(args.round_log_dir, "rounds")
        .with_reference_path_file(reference_file.clone());

    let mut controller = PipelineController::new(TokioContext::shared(), source, renderer, config);
    if args.annotate {
        match ReferencePath::load(&reference_file) {
            Ok(path) => controller = controller.with_reference(Arc::new(path)),
            Err(e) => warn!("Rounds will not be annotated: {}", e),
        }
    }

    info!("Reading commands from stdin");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    control::run_control_loop(
        &controller,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("-641, -922,1303").unwrap(), Point3::new(-641.0, -922.0, 1303.0));
        assert!(parse_point("1,2").is_err());
        assert!(parse_point("a,b,c").is_err());
    }

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["trackviz-agent"]).unwrap();
        assert!(cli.mode.is_none());
        assert_eq!(cli.upstream.filter(), SessionFilter::default());
        assert_eq!(cli.serve.queue_capacity, 500);
        assert!(!cli.serve.annotate);
    }

    #[test]
    fn test_serve_options_apply_without_subcommand() {
        std::env::set_var("TRACKVIZ_ROUND_LOG_DIR", "/var/log/trackviz");
        let implicit = Cli::try_parse_from(["trackviz-agent", "--annotate", "--queue-capacity", "50"]);
        let explicit = Cli::try_parse_from(["trackviz-agent", "serve", "--annotate"]);
        std::env::remove_var("TRACKVIZ_ROUND_LOG_DIR");

        let implicit = implicit.unwrap();
        assert!(implicit.mode.is_none());
        assert_eq!(implicit.serve.round_log_dir, PathBuf::from("/var/log/trackviz"));
        assert_eq!(implicit.serve.queue_capacity, 50);
        assert!(implicit.serve.annotate);

        let explicit = explicit.unwrap();
        assert!(matches!(explicit.mode, Some(Mode::Serve)));
        assert_eq!(explicit.serve.round_log_dir, PathBuf::from("/var/log/trackviz"));
        assert!(explicit.serve.annotate);
    }

    #[test]
    fn test_capture_args() {
        let cli = Cli::try_parse_from([
            "trackviz-agent",
            "capture-reference",
            "--driver",
            "1",
            "--start-point",
            "-641,-922,1303",
        ])
        .unwrap();
        match cli.mode {
            Some(Mode::CaptureReference(args)) => {
                assert_eq!(args.driver, 1);
                assert_eq!(args.minutes, 5);
                assert_eq!(args.start_point, Some(Point3::new(-641.0, -922.0, 1303.0)));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }
}
