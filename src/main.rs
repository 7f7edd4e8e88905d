use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use runtail::{ClientCfg, ConnectionState, FrameFormat, MonitorEvent, RunDetail, RunMonitor, StopOutcome};

#[derive(Parser)]
#[command(name = "runtail", about = "Follow the live telemetry of a remote run")]
struct Cli {
    /// YAML client config; defaults plus RUNTAIL_* env vars when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Stream endpoint speaks one JSON object per line instead of `data:` records.
    #[arg(long, global = true)]
    json_lines: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print logs and stage progress until the run finishes.
    Watch { run_id: String },
    /// Ask the server to stop a run.
    Stop {
        run_id: String,
        /// Keep following the stream until the stop shows up as a terminal status.
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("runtail=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => ClientCfg::load(path).await.with_context(|| format!("loading {}", path.display()))?,
        None => ClientCfg::from_env()?,
    };
    if let Some(url) = cli.base_url {
        cfg.base_url = url;
    }
    if cli.json_lines {
        cfg.frame_format = FrameFormat::JsonLines;
    }

    match cli.cmd {
        Command::Watch { run_id } => watch(&cfg, &run_id).await,
        Command::Stop { run_id, wait } => stop(&cfg, &run_id, wait).await,
    }
}

async fn watch(cfg: &ClientCfg, run_id: &str) -> Result<()> {
    let monitor = RunMonitor::open(cfg, run_id).await.context("resolving run")?;
    let mut rx = monitor.subscribe();
    monitor.start();
    follow(&monitor, &mut rx).await
}

async fn stop(cfg: &ClientCfg, run_id: &str, wait: bool) -> Result<()> {
    let monitor = RunMonitor::open(cfg, run_id).await.context("resolving run")?;
    let mut rx = monitor.subscribe();
    monitor.start();

    // the run status is only known once the first snapshot arrived
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(MonitorEvent::Updated { frame_type }) if frame_type == "initial" => return Ok(()),
                Ok(MonitorEvent::Terminal(e)) => return Err(e),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    })
    .await
    .context("timed out waiting for the run snapshot")??;

    match monitor.stop_run().await? {
        StopOutcome::Sent => println!("stop requested for {run_id}"),
        StopOutcome::AlreadyPending => println!("a stop request is already pending for {run_id}"),
    }
    if wait {
        follow(&monitor, &mut rx).await?;
    }
    Ok(())
}

async fn follow(monitor: &RunMonitor, rx: &mut tokio::sync::broadcast::Receiver<MonitorEvent>) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template("{prefix:>14} [{bar:40}] {pos:>3}% {msg}")?.progress_chars("=> "));
    let mut last_log: Option<i64> = None;
    render(&bar, &monitor.snapshot(), &mut last_log);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                monitor.disconnect();
                bar.abandon_with_message("interrupted");
                return Ok(());
            }
            ev = rx.recv() => ev,
        };
        match event {
            Ok(MonitorEvent::Updated { .. }) => render(&bar, &monitor.snapshot(), &mut last_log),
            Ok(MonitorEvent::Connected { .. }) => bar.set_message("connected"),
            Ok(MonitorEvent::ReconnectScheduled { attempt, delay_ms }) => {
                bar.set_message(format!("reconnecting (#{attempt}) in {delay_ms}ms"))
            }
            Ok(MonitorEvent::StreamError(e)) | Ok(MonitorEvent::ActionFailed(e)) => bar.println(format!("! {e}")),
            Ok(MonitorEvent::Completed { status }) => {
                render(&bar, &monitor.snapshot(), &mut last_log);
                bar.finish_with_message(format!("run {status:?}"));
                return Ok(());
            }
            Ok(MonitorEvent::Terminal(e)) => {
                bar.abandon_with_message("gave up");
                return Err(e.into());
            }
            Ok(MonitorEvent::Disconnected) => {
                if monitor.connection_state() != ConnectionState::Idle {
                    continue;
                }
                let detail = monitor.snapshot();
                if detail.is_terminal() {
                    bar.finish_with_message(format!("run {:?}", detail.status()));
                    return Ok(());
                }
                bar.abandon_with_message("stream closed");
                bail!("stream closed before the run finished");
            }
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "display fell behind; re-rendering from the aggregate");
                render(&bar, &monitor.snapshot(), &mut last_log);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn render(bar: &ProgressBar, detail: &RunDetail, last_log: &mut Option<i64>) {
    let fresh: Vec<_> = detail
        .logs
        .iter()
        .take_while(|l| last_log.map_or(true, |seen| l.id > seen))
        .collect();
    for log in fresh.iter().rev() {
        bar.println(format!("[{}] {}", log.level, log.message));
    }
    if let Some(newest) = fresh.first() {
        *last_log = Some(newest.id);
    }

    if let Some(stage) = detail.current_stage() {
        bar.set_prefix(stage.stage.clone());
        bar.set_position((stage.clamped_progress() * 100.0).round() as u64);
        bar.set_message(format!(
            "iter {}/{}  good {}  buggy {}{}",
            stage.iteration,
            stage.max_iterations,
            stage.good_nodes,
            stage.buggy_nodes,
            stage.best_metric.as_deref().map(|m| format!("  best {m}")).unwrap_or_default(),
        ));
    }
}
