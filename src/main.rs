use clap::Parser;
use frame_bus::frame::FrameLayout;
use tokio_util::sync::CancellationToken;

mod cli;
mod config;

use cli::{Cli, Command};
use config::AppConfig;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// Runs on a blocking thread; returns once the job has finalized its files.
fn execute(cli: Cli, config: AppConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Command::Split(args) => {
            let split = config.split_config(&args, cli.hardware);
            let report = frame_bus::job::split(&args.input, &split, cancel)?;
            log::info!(
                "split {} into {} segments, frames: {}, rejected: {}, fps: {:.2}",
                args.input,
                report.segments.segments,
                report.segments.frames,
                report.segments.rejected,
                report.fps
            );
        }
        Command::Record(args) => {
            let record = config.record_config(&args, cli.hardware);
            let layout = FrameLayout::rgb24(args.width, args.height);
            let report =
                frame_bus::job::record_raw(&args.input, layout, &args.output, &record, cancel)?;
            log::info!(
                "recorded {}, frames: {}, dropped: {}",
                args.output.display(),
                report.accepted,
                report.dropped
            );
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    frame_bus::init()?;
    let config = AppConfig::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    let job_cancel = cancel.clone();
    let mut job = tokio::task::spawn_blocking(move || execute(cli, config, job_cancel));

    loop {
        tokio::select! {
            res = &mut job => {
                return res.map_err(|e| anyhow::anyhow!("job task: {}", e))?;
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                log::info!("interrupted, finishing open files");
                cancel.cancel();
            },
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
