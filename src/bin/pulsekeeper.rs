use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use pulsekeeper::db::services as pg;
use pulsekeeper::scheduler::queue::{JobQueue, QueueName};
use pulsekeeper::server::app::App;
use pulsekeeper::server::config::ServerConfig;
use pulsekeeper::server::init_logging;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Keep every store and queue in process memory, ignoring `database_url`
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Heartbeat endpoint, scheduler and both worker pools in one process
    Serve,
    /// Periodic sweep that enqueues new and overdue monitors
    Scheduler {
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Run one sweep and exit
    CheckDue,
    /// Check worker pool
    Worker {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Notification worker pool
    NotificationWorker {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Report queue sizes, reclaim stale reservations and optionally prune
    QueueHealth {
        #[arg(long)]
        max_pending: Option<usize>,
        #[arg(long)]
        prune: bool,
    },
    /// Send a test alert to one channel
    TestChannel {
        channel_id: i32,
        #[arg(long)]
        message: Option<String>,
    },
    /// Apply the bundled PostgreSQL schema
    Migrate,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested; draining."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C."),
        }
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn serve(app: App) -> Result<(), BoxError> {
    let shutdown = shutdown_signal();
    let listener = tokio::net::TcpListener::bind(&app.config.listen_address).await?;
    info!(address = %app.config.listen_address, "Heartbeat endpoint listening.");

    let router = app.router();
    let http_shutdown = wait_for(shutdown.clone());
    let http = async move { axum::serve(listener, router).with_graceful_shutdown(http_shutdown).await };
    let check_workers = app.check_workers(None);
    let notification_workers = app.notification_workers(None);
    let poll_interval = app.config.poll_interval();

    let (http_result, _, _, _) = tokio::join!(
        http,
        app.scheduler.run(poll_interval, shutdown.clone()),
        check_workers.run(shutdown.clone()),
        notification_workers.run(shutdown),
    );
    http_result?;
    Ok(())
}

async fn queue_health(app: &App, max_pending: Option<usize>, prune: bool) -> Result<(), BoxError> {
    let now = Utc::now();
    let reclaimed = app
        .queue
        .reclaim_stale(now, Duration::seconds(app.config.job_reservation_timeout_seconds))
        .await?;
    if reclaimed > 0 {
        warn!(reclaimed, "Reclaimed stale job reservations.");
    }

    for queue in [QueueName::Checks, QueueName::Notifications] {
        let stats = app.queue.stats(queue, now).await?;
        println!(
            "{}: priority={} regular={} delayed={} reserved={} failed={}",
            queue.as_str(),
            stats.priority_ready,
            stats.regular_ready,
            stats.delayed,
            stats.reserved,
            stats.failed
        );
    }
    println!("reclaimed stale reservations: {reclaimed}");

    if prune {
        let max_pending = max_pending.unwrap_or(app.config.queue_soft_cap);
        let report = app.queue.prune(QueueName::Checks, max_pending).await?;
        println!(
            "pruned: duplicates={} trimmed={}",
            report.duplicates_removed, report.trimmed
        );
    }
    Ok(())
}

async fn migrate(config: &ServerConfig) -> Result<(), BoxError> {
    let url = config
        .database_url
        .as_deref()
        .ok_or("DATABASE_URL is required for migrate")?;
    let pool = pg::connect(url, config.database_max_connections).await?;
    pg::apply_schema(&pool).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(&config.log_dir);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting pulsekeeper.");

    if let Command::Migrate = args.command {
        return migrate(&config).await;
    }

    let app = App::build(config, args.in_memory).await.map_err(|e| {
        error!(error = %e, "Failed to start.");
        e
    })?;

    match args.command {
        Command::Serve => serve(app).await?,
        Command::Scheduler { poll_interval } => {
            let interval = poll_interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| app.config.poll_interval());
            app.scheduler.run(interval, shutdown_signal()).await;
        }
        Command::CheckDue => {
            let report = app.scheduler.sweep(Utc::now()).await?;
            println!(
                "enqueued={} inline={} failed={}",
                report.enqueued, report.inline, report.failed
            );
        }
        Command::Worker { concurrency } => {
            let pool = app.check_workers(concurrency);
            pool.run(shutdown_signal()).await;
        }
        Command::NotificationWorker { concurrency } => {
            let pool = app.notification_workers(concurrency);
            pool.run(shutdown_signal()).await;
        }
        Command::QueueHealth { max_pending, prune } => queue_health(&app, max_pending, prune).await?,
        Command::TestChannel { channel_id, message } => {
            app.dispatcher.test_channel(channel_id, message.as_deref()).await?;
            println!("Test notification delivered to channel {channel_id}.");
        }
        Command::Migrate => {}
    }
    Ok(())
}
