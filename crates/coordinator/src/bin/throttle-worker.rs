// throttle-worker
//
// Joins a shared schedule and submits each id as work that appends the
// capitalized id to an output file, then waits for the schedule to drain.
//
// Design Decision: Use clap derive with env fallbacks, matching the library's env names.
// Design Decision: Log to stderr so stdout stays free for scripting.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use throttle_coordinator::{Coordinator, CoordinatorConfig, FileRendezvous};
use throttle_dispatch::DispatcherConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "throttle-worker")]
#[command(about = "Submit work to a rate-limited schedule shared between processes")]
#[command(version)]
struct Cli {
    /// Shared schedule name
    #[arg(long, env = "THROTTLE_NAME", default_value = "throttle-queue")]
    name: String,

    /// Directory holding rendezvous records (default: system temp dir)
    #[arg(long, env = "THROTTLE_RENDEZVOUS_DIR")]
    rendezvous_dir: Option<PathBuf>,

    /// Interface to bind if this process becomes leader
    #[arg(long, env = "THROTTLE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Dispatches per second if this process becomes leader
    #[arg(long, env = "THROTTLE_RATE", default_value_t = 10.0)]
    rate: f64,

    /// File the work appends to
    #[arg(long, short)]
    output: PathBuf,

    /// Submit at foreground priority, one id at a time
    #[arg(long)]
    foreground: bool,

    /// Shut the shared schedule down before exiting
    #[arg(long)]
    shutdown: bool,

    /// Give up waiting for the schedule to drain after this many seconds
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Identifiers to submit
    ids: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "throttle_coordinator=info,throttle_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = CoordinatorConfig::new(&cli.name)
        .with_host(&cli.host)
        .with_dispatcher(DispatcherConfig::new(cli.rate).with_name(&cli.name));
    let rendezvous = match &cli.rendezvous_dir {
        Some(dir) => FileRendezvous::new(dir),
        None => FileRendezvous::from_env(),
    };

    let coordinator = Coordinator::<String>::join(config, Arc::new(rendezvous))
        .context("Failed to join shared schedule")?;
    tracing::info!(
        name = %coordinator.name(),
        leader = coordinator.is_leader(),
        endpoint = %coordinator.endpoint(),
        "Joined shared schedule"
    );

    for id in cli.ids {
        let output = cli.output.clone();
        let work = move |id: &String| append_line(&output, &capitalize(id));

        if cli.foreground {
            coordinator
                .foreground(id.clone(), work)
                .with_context(|| format!("Foreground work {id:?} failed"))?;
        } else if !coordinator.background(id.clone(), work)? {
            tracing::info!(id = %id, "Already queued, skipped");
        }
    }

    if !coordinator.wait(Some(Duration::from_secs(cli.timeout))) {
        tracing::warn!(timeout_secs = cli.timeout, "Schedule did not drain in time");
    }

    if cli.shutdown {
        coordinator.shutdown();
    }
    Ok(())
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
