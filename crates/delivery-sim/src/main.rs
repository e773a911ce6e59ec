//! Delivery Fleet Simulator CLI
//!
//! Populates jobs and drones, runs the fleet for a number of ticks while a
//! promoter releases held jobs and a reporter renders frames.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use delivery_domain::{DroneState, JobState};
use delivery_sim::{Fleet, FleetConfig, FrameReporter, TickReport, self_check};
use delivery_store::{Database, HoldPromoter, MatchStrategy, StoreConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Redis,
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "delivery-sim")]
#[command(about = "Simulate a drone delivery fleet")]
struct Args {
    /// Backing store
    #[arg(long, value_enum, default_value_t = Backend::Redis)]
    store: Backend,

    /// Number of jobs
    #[arg(short, long, default_value = "200")]
    jobs: usize,

    /// Number of drones
    #[arg(short, long, default_value = "20")]
    drones: usize,

    /// Total run length in ticks
    #[arg(long, default_value = "600")]
    ticks: u32,

    /// Tick interval in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Initial job search radius in degrees
    #[arg(long, default_value = "0.02")]
    radius: f64,

    /// Match jobs by scanning instead of the geo index
    #[arg(long)]
    brute_force: bool,

    /// Keep existing records instead of clearing on start
    #[arg(long)]
    keep: bool,

    /// Run the store self-check and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("delivery_sim=info,delivery_store=info")),
        )
        .init();

    let args = Args::parse();
    let config = StoreConfig::from_env();

    let db = match args.store {
        Backend::Redis => Database::connect(config)
            .await
            .context("Unable to connect to the store")?,
        Backend::Memory => Database::in_memory(&config).await,
    };
    let db = Arc::new(db);

    if args.check {
        self_check(&db).await?;
        close(db);
        return Ok(());
    }

    if args.keep {
        db.rebuild().await?;
    } else {
        db.clear().await?;
    }

    let fleet_config = FleetConfig {
        search_radius: args.radius,
        strategy: if args.brute_force {
            MatchStrategy::BruteForce
        } else {
            MatchStrategy::Indexed
        },
        ..FleetConfig::default()
    };
    let mut fleet = Fleet::populate(Arc::clone(&db), args.jobs, args.drones, fleet_config).await?;

    let tick = Duration::from_millis(args.tick_ms.max(1));
    let promoter = HoldPromoter::spawn(Arc::clone(db.jobs()), tick * 5);
    let (stop_frames, frames_stopped) = watch::channel(false);
    let reporter = tokio::spawn(render_frames(FrameReporter::new(Arc::clone(&db)), frames_stopped));

    info!(
        "Starting delivery simulation: {} jobs, {} drones, {} ticks of {}ms",
        args.jobs, args.drones, args.ticks, args.tick_ms
    );

    let mut interval = tokio::time::interval(tick);
    let mut total = TickReport::default();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut was_connected = true;
    for n in 1..=args.ticks {
        tokio::select! {
            _ = interval.tick() => {}
            () = &mut shutdown => break,
        }
        let connected = db.is_connected();
        if connected != was_connected {
            if connected {
                info!("Store reconnected; resuming");
            } else {
                warn!("Store disconnected; skipping ticks until it is back");
            }
            was_connected = connected;
        }
        if !connected {
            continue;
        }
        total.absorb(&fleet.tick().await);

        if n % 50 == 0 {
            info!(
                "Tick {}/{} | Waiting: {} | InProcess: {} | OnHold: {} | Drones en route: {} | Deliveries: {}",
                n,
                args.ticks,
                db.jobs().count(JobState::Waiting),
                db.jobs().count(JobState::InProcess),
                db.jobs().count(JobState::OnHold),
                db.drones().count(DroneState::EnRoute) + db.drones().count(DroneState::Delivering),
                total.deliveries
            );
        }
    }

    fleet.stand_down().await;
    drop(fleet);
    let released = promoter.stop().await;
    let _ = stop_frames.send(true);
    let frames = reporter.await.unwrap_or_default();

    info!("Simulation complete!");
    info!(
        claims = total.claims,
        lost_races = total.lost_races,
        deliveries = total.deliveries,
        released,
        frames,
        "Summary"
    );

    close(db);
    Ok(())
}

/// Render frames until told to stop; returns how many were rendered.
async fn render_frames(mut reporter: FrameReporter, mut stopped: watch::Receiver<bool>) -> u64 {
    loop {
        tokio::select! {
            frame = reporter.render() => {
                if let Some(frame) = frame {
                    if frame.number % u64::from(delivery_sim::frame::MAX_FRAMES_PER_SECOND) == 0 {
                        info!("{frame}");
                    }
                }
            }
            _ = stopped.changed() => break,
        }
    }
    reporter.frames()
}

fn close(db: Arc<Database>) {
    match Arc::try_unwrap(db) {
        Ok(db) => {
            db.close();
        }
        Err(_) => warn!("Database still in use at exit"),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
