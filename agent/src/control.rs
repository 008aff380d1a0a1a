//! JSON-lines control loop.
//!
//! Each input line is one command object (`{"start": [44, 1]}`,
//! `{"stop": null}`, `{"draw_reference_track": null}`). Each command gets
//! exactly one reply line:
//!
//! ```text
//! {"ok":true,"result":{"status":"started","session_key":9161,"entities":[44,1]}}
//! {"ok":false,"error":"Unknown command: bogus","input_error":true}
//! ```
//!
//! On end of input, shutdown or an I/O error the pipeline is stopped so its
//! round log is flushed; a running pipeline produces one final reply for
//! that stop unless the output itself failed.

use anyhow::Result;
use serde_json::{json, Value};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use trackviz_core::{Command, CommandResponse, PipelineController, PipelineError};
use trackviz_env::{Renderer, TrackVizContext, UpstreamSource};

fn reply(outcome: &Result<CommandResponse, PipelineError>) -> Value {
    match outcome {
        Ok(response) => json!({ "ok": true, "result": response }),
        Err(e) => json!({
            "ok": false,
            "error": e.to_string(),
            "input_error": e.is_input_error(),
        }),
    }
}

/// Parses and executes one line. Blank lines yield no reply.
pub async fn handle_line<Ctx, Src, R>(
    controller: &PipelineController<Ctx, Src, R>,
    line: &str,
) -> Option<Value>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
    R: Renderer + ?Sized,
{
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let outcome = match Command::from_str_json(line) {
        Ok(command) => {
            info!("Executing '{}'", command.name());
            controller.execute(command).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &outcome {
        warn!("Command failed: {}", e);
    }
    Some(reply(&outcome))
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Serves commands from `reader` until it ends or `shutdown` resolves.
pub async fn run_control_loop<Ctx, Src, R, In, Out, F>(
    controller: &PipelineController<Ctx, Src, R>,
    reader: In,
    mut writer: Out,
    shutdown: F,
) -> Result<()>
where
    Ctx: TrackVizContext,
    Src: UpstreamSource,
    R: Renderer + ?Sized,
    In: AsyncBufRead + Unpin,
    Out: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = reader.lines();
    tokio::pin!(shutdown);

    // An I/O failure ends the loop but never skips the final stop
    let mut failure: Option<anyhow::Error> = None;
    let mut writer_broken = false;
    loop {
        let line = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Control input closed");
                break;
            }
            Err(e) => {
                error!("Failed to read control input: {}", e);
                failure = Some(e.into());
                break;
            }
        };
        if let Some(value) = handle_line(controller, &line).await {
            if let Err(e) = write_reply(&mut writer, &value).await {
                error!("Failed to write reply: {}", e);
                failure = Some(e);
                writer_broken = true;
                break;
            }
        }
    }

    let report = controller.stop().await;
    if report.was_running && !writer_broken {
        let response = CommandResponse::Stopped {
            was_running: report.was_running,
            rounds_flushed: report.rounds_flushed,
            log_file: report.log_file,
            flush_error: report.flush_error,
        };
        if let Err(e) = write_reply(&mut writer, &reply(&Ok(response))).await {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::StaticSource;
    use std::sync::Arc;
    use std::time::Duration;
    use trackviz_core::PipelineConfig;
    use trackviz_env::{EntityId, NullRenderer, TokioContext};

    type TestController = PipelineController<TokioContext, StaticSource, NullRenderer>;

    fn controller(dir: &std::path::Path) -> TestController {
        let config = PipelineConfig::default()
            .with_name("control-test")
            .with_tick_period(Duration::from_millis(5))
            .with_round_pause(Duration::from_millis(1))
            .with_round_log(dir, "rounds")
            .with_reference_path_file(dir.join("reference_track.json"));
        PipelineController::new(
            TokioContext::shared(),
            Arc::new(StaticSource::circle(1.0)),
            Arc::new(NullRenderer),
            config,
        )
    }

    fn replies(out: &[u8]) -> Vec<Value> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_errors_get_reply_lines() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let input: &[u8] = b"{\"bogus\": 1}\n\nnot json\n{\"stop\": null}\n";
        let mut out = Vec::new();

        run_control_loop(&controller, input, &mut out, std::future::pending())
            .await
            .unwrap();

        let replies = replies(&out);
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["ok"], false);
        assert_eq!(replies[0]["input_error"], true);
        assert_eq!(replies[1]["ok"], false);
        assert_eq!(replies[2]["ok"], true);
        assert_eq!(replies[2]["result"]["status"], "stopped");
        assert_eq!(replies[2]["result"]["was_running"], false);
    }

    #[tokio::test]
    async fn test_end_of_input_stops_running_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let input: &[u8] = b"{\"start\": [44]}\n";
        let mut out = Vec::new();

        run_control_loop(&controller, input, &mut out, std::future::pending())
            .await
            .unwrap();

        let replies = replies(&out);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["result"]["status"], "started");
        assert_eq!(replies[0]["result"]["session_key"], 9161);
        assert_eq!(replies[1]["result"]["status"], "stopped");
        assert_eq!(replies[1]["result"]["was_running"], true);
        assert!(!controller.is_started());
    }

    #[tokio::test]
    async fn test_unreadable_input_still_flushes_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        controller.start(&[EntityId(44)]).await.unwrap();
        controller.wait_finished().await;
        assert_eq!(controller.rounds().len(), 300);

        let input: &[u8] = b"\xff\xfe\n{\"stop\": null}\n";
        let mut out = Vec::new();
        let result = run_control_loop(&controller, input, &mut out, std::future::pending()).await;

        assert!(result.is_err());
        assert!(!controller.is_started());
        assert!(controller.rounds().is_empty());
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("rounds_"))
            .collect();
        assert_eq!(files.len(), 1);

        let replies = replies(&out);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["result"]["status"], "stopped");
        assert_eq!(replies[0]["result"]["rounds_flushed"], 300);
    }

    #[tokio::test]
    async fn test_failed_write_still_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let input: &[u8] = b"{\"start\": [44]}\n";

        let result = run_control_loop(&controller, input, BrokenWriter, std::future::pending()).await;

        assert!(result.is_err());
        assert!(!controller.is_started());
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_missing_reference_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        let value = handle_line(&controller, r#"{"draw_reference_track": null}"#)
            .await
            .unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["input_error"], false);
        assert!(handle_line(&controller, "   ").await.is_none());
    }
}
