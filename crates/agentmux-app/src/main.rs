mod bootstrap;
mod runtime;
mod watcher;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use agentmux_config::AgentmuxConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = agentmux_config::load_from_env()?;
    let cli = parse_cli_flags()?;
    if let Some(interval_secs) = cli.sync_interval_secs {
        config.sync.interval_secs = interval_secs;
    }

    init_file_logging(&config)?;
    install_panic_hook();

    let mut app = bootstrap::build(&config)?;
    tracing::info!(
        workspaces = config.workspaces.len(),
        sync_interval_secs = config.sync.interval_secs,
        "agentmux core started"
    );

    tokio::select! {
        () = app.runtime.run() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                tracing::warn!(error = %error, "failed to listen for ctrl-c");
            }
        }
    }

    app.supervisor.stop().await;
    tracing::info!("agentmux core stopped");
    Ok(())
}

fn init_file_logging(config: &AgentmuxConfig) -> Result<()> {
    let log_path = log_file_path(&config.data_dir());
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

fn log_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agentmux.log")
}

/// Panics anywhere in the process are logged with a backtrace before the
/// command/worker wrappers convert them into error events.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(panic = %info, backtrace = %backtrace, "panic captured");
        default_hook(info);
    }));
}

#[derive(Debug, Default)]
struct CliFlags {
    sync_interval_secs: Option<u64>,
}

fn parse_cli_flags() -> Result<CliFlags> {
    let mut flags = CliFlags::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync-interval" => {
                let value = args.next().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Missing value after --sync-interval. Use --sync-interval <seconds>."
                    )
                })?;
                flags.sync_interval_secs = Some(parse_interval_secs(&value)?);
            }
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            unknown => {
                return Err(anyhow::anyhow!(
                    "Unknown argument '{unknown}'. Run with --help for valid flags."
                ));
            }
        }
    }

    Ok(flags)
}

fn parse_interval_secs(value: &str) -> Result<u64> {
    let parsed = value
        .trim()
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("Invalid --sync-interval value '{value}'."))?;
    if parsed == 0 {
        return Err(anyhow::anyhow!("--sync-interval must be greater than 0."));
    }
    if Duration::from_secs(parsed) > Duration::from_secs(3_600) {
        return Err(anyhow::anyhow!(
            "--sync-interval must be at most 3600 seconds."
        ));
    }
    Ok(parsed)
}

fn print_cli_help() {
    println!("Usage: agentmux [--sync-interval <seconds>]");
    println!();
    println!("  --sync-interval <seconds>   Override the session sync tick interval");
    println!("  --help                      Show this help message");
}
