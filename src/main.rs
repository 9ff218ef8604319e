//! wayafk-supervisor - Runs the wayafknext idle monitor and reports idle changes.
//!
//! Fetches the monitor on first use, keeps it running while the daemon is up,
//! and tears it down on SIGINT/SIGTERM/SIGQUIT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use wayafk_supervisor::Config;
use wayafk_supervisor::Event;
use wayafk_supervisor::EventSink;
use wayafk_supervisor::IdleTracker;
use wayafk_supervisor::Supervisor;
use wayafk_supervisor::SupervisorError;
use wayafk_supervisor::signals::shutdown_signal;

/// How often to check that the monitor is still alive.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// First restart delay after the monitor dies.
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

/// Restart delay cap.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// Idle monitor supervisor.
///
/// Downloads, runs and talks to the wayafknext idle monitor.
#[derive(Parser, Debug)]
#[command(name = "wayafk-supervisor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print monitor events to stdout as JSON lines.
    #[arg(long)]
    print_events: bool,

    /// Minutes without input before the status goes idle.
    #[arg(long)]
    status_timeout: Option<u32>,

    /// Minutes without input before notifications go AFK (0 = same as status).
    #[arg(long)]
    notifs_timeout: Option<u32>,

    /// Download and verify the monitor, print its path, then exit.
    #[arg(long)]
    fetch_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    let level = if config.debug && args.log_level == "info" {
        "debug"
    } else {
        args.log_level.as_str()
    };
    init_logging(level)?;

    info!("wayafk-supervisor v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(minutes) = args.status_timeout {
        config.status_idle_timeout_minutes = minutes;
    }
    if let Some(minutes) = args.notifs_timeout {
        config.notifications_idle_timeout_minutes = minutes;
    }

    info!(
        "Configuration loaded (detection={}, status={} min, notifications={} min)",
        config.enable_detection,
        config.status_idle_timeout_minutes,
        config.notifications_idle_timeout_minutes
    );

    let tracker = Arc::new(IdleTracker::new());
    let sink = event_sink(tracker.clone(), args.print_events);
    let supervisor = Supervisor::new(&config, sink).context("Failed to initialize supervisor")?;

    if args.fetch_only {
        let path = supervisor
            .acquire()
            .await
            .context("Failed to acquire monitor")?;
        println!("{}", path.display());
        return Ok(());
    }

    if !config.enable_detection {
        info!("Idle detection disabled, nothing to do");
        return Ok(());
    }

    let result = run_daemon(&supervisor, &config).await;
    supervisor.kill().await;

    info!(
        "Shut down (status idle: {}, notifications idle: {})",
        tracker.is_status_idle(),
        tracker.is_notifs_idle()
    );
    result
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("wayafk_supervisor={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Forward events to the tracker, echoing them when asked.
fn event_sink(tracker: Arc<IdleTracker>, print_events: bool) -> Arc<dyn EventSink> {
    Arc::new(move |event: Event| -> Result<()> {
        if print_events {
            println!("{}", event.to_json());
        }
        tracker.handle_event(event)
    })
}

/// Start the monitor, then keep it alive until a shutdown signal.
async fn run_daemon(supervisor: &Supervisor, config: &Config) -> Result<()> {
    supervisor
        .start()
        .await
        .context("Failed to start monitor")?;
    configure(supervisor, config).await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut health_timer = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut backoff = RESTART_BACKOFF;

    info!("Supervisor running, waiting for idle events...");

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                let name = signal.context("Failed to listen for shutdown signals")?;
                info!("Received {}, shutting down", name);
                return Ok(());
            }

            _ = health_timer.tick() => {
                let state = supervisor.state();
                if !state.accepts_start() {
                    continue;
                }

                warn!("Monitor not running ({}), restarting in {:?}", state, backoff);
                tokio::select! {
                    signal = &mut shutdown => {
                        let name = signal.context("Failed to listen for shutdown signals")?;
                        info!("Received {}, shutting down", name);
                        return Ok(());
                    }
                    () = tokio::time::sleep(backoff) => {}
                }

                match supervisor.start().await {
                    Ok(()) => {
                        configure(supervisor, config).await?;
                        backoff = RESTART_BACKOFF;
                    }
                    Err(e) if e.is_fatal() => {
                        return Err(e).context("Monitor cannot be restarted");
                    }
                    Err(e) => {
                        error!("Restart failed: {}", e);
                        backoff = std::cmp::min(backoff * 2, MAX_RESTART_BACKOFF);
                    }
                }
            }
        }
    }
}

/// Send the configured watch timeouts.
async fn configure(supervisor: &Supervisor, config: &Config) -> Result<()> {
    let watch = config.watch();
    match supervisor
        .reconfigure_watch(watch.status_timeout_minutes(), watch.notifs_timeout_minutes())
        .await
    {
        Ok(()) => Ok(()),
        Err(e @ SupervisorError::InvalidTimeout) => {
            Err(e).context("Invalid status_idle_timeout_minutes")
        }
        Err(e) => {
            // The health check restarts it
            debug!("Watch not configured: {}", e);
            Ok(())
        }
    }
}
