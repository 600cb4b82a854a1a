use clap::Parser;
use distributed_pipeline::client::run_client;
use distributed_pipeline::config::*;
use distributed_pipeline::fault::FailureInjector;
use distributed_pipeline::gateway::run_gateway;
use distributed_pipeline::router::broker::queue_depths;
use distributed_pipeline::router::handlers::broker_routes;
use distributed_pipeline::router::{Broker, MessageRouter, RemoteRouter};
use distributed_pipeline::waker::{DockerRestarter, Waker, serve_health};
use distributed_pipeline::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

const ROUTER_CONNECT_ATTEMPTS: usize = 10;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let failures = FailureInjector::random(cli.failure_probability);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Termination signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    match cli.role {
        Role::Broker(args) => run_broker(args, shutdown_rx).await,
        Role::Worker(args) => run_worker(args, failures, shutdown_rx).await,
        Role::Gateway(args) => run_gateway_role(args, failures, shutdown_rx).await,
        Role::Waker(args) => run_waker(args, shutdown_rx).await,
        Role::Client(args) => {
            let written = run_client(args.client_config()?).await?;
            for path in written {
                tracing::info!("Results written to {}", path.display());
            }
            Ok(())
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn wait_until_stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_broker(args: BrokerArgs, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let broker = Broker::with_lease(Duration::from_secs(args.lease_secs));
    tokio::spawn(broker.clone().reaper_loop());

    let stats = broker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let depths = queue_depths(&stats);
            let backlog: usize = depths.values().map(|(ready, unacked)| ready + unacked).sum();
            tracing::info!(
                "Router: {} queue(s), {} message(s) pending, {} published",
                depths.len(),
                backlog,
                stats.published_count()
            );
            for (queue, (ready, unacked)) in depths {
                tracing::debug!("  {}: {} ready, {} unacked", queue, ready, unacked);
            }
        }
    });

    let app = broker_routes(broker);
    let listener = TcpListener::bind(&args.bind_addr).await?;
    tracing::info!("Router listening on {}", args.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_until_stopped(shutdown))
        .await?;
    Ok(())
}

/// Answers healthchecks on `port` while the returned flag is set.
async fn spawn_health(
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Arc<AtomicBool>> {
    let alive = Arc::new(AtomicBool::new(true));
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    let flag = alive.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(socket, flag, shutdown).await {
            tracing::error!("Health responder failed: {}", e);
        }
    });
    Ok(alive)
}

async fn run_worker(
    args: WorkerArgs,
    failures: FailureInjector,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let config = args.worker_config()?;
    let alive = spawn_health(args.health_port, shutdown.clone()).await?;

    let router: Arc<dyn MessageRouter> =
        Arc::new(RemoteRouter::connect(&args.router_addr, ROUTER_CONNECT_ATTEMPTS).await?);
    let worker = Worker::start(config, router, failures).await?;
    let result = worker.run(shutdown).await;
    if result.is_err() {
        alive.store(false, Ordering::SeqCst);
    }
    result
}

async fn run_gateway_role(
    args: GatewayArgs,
    failures: FailureInjector,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let config = args.gateway_config()?;
    let alive = spawn_health(args.health_port, shutdown.clone()).await?;

    let router: Arc<dyn MessageRouter> =
        Arc::new(RemoteRouter::connect(&args.router_addr, ROUTER_CONNECT_ATTEMPTS).await?);
    let clients = TcpListener::bind(("0.0.0.0", args.server_port)).await?;
    let results = TcpListener::bind(("0.0.0.0", args.results_port)).await?;

    let result = run_gateway(config, router, clients, results, failures, shutdown).await;
    if result.is_err() {
        alive.store(false, Ordering::SeqCst);
    }
    result
}

async fn run_waker(args: WakerArgs, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let config = args.waker_config();
    let socket = UdpSocket::bind(("0.0.0.0", args.waker_port)).await?;
    Waker::new(config, socket, Arc::new(DockerRestarter))
        .run(shutdown)
        .await
}
