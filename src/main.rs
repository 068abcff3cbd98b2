use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use slotkeeper::compactor::run_compactor;
use slotkeeper::config::Config;
use slotkeeper::engine::Scheduler;
use slotkeeper::notify::TracingNotifier;
use slotkeeper::observability;
use slotkeeper::store::WalStore;
use slotkeeper::wire::{self, SlotkeeperFactory};

const COMPACT_CHECK_EVERY: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port);

    let tls_acceptor =
        slotkeeper::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(&config.wal_path())?);
    info!("replayed WAL: {} providers", store.provider_count());

    tokio::spawn(run_compactor(
        store.clone(),
        config.compact_threshold,
        COMPACT_CHECK_EVERY,
    ));

    let scheduler = Arc::new(
        Scheduler::new(store)
            .with_notifier(Arc::new(TracingNotifier))
            .with_policy(config.policy),
    );
    let factory = Arc::new(SlotkeeperFactory::new(scheduler, config.password.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotkeeper listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  reopen_slot_on_cancel: {}", config.policy.reopen_slot_on_cancel);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    serve(listener, factory, tls_acceptor, semaphore.clone()).await?;
    drain(&semaphore, max_connections).await;

    info!("slotkeeper stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Accept until shutdown. Connections beyond the semaphore's permits are dropped at once.
async fn serve(
    listener: TcpListener,
    factory: Arc<SlotkeeperFactory>,
    tls: Option<TlsAcceptor>,
    semaphore: Arc<Semaphore>,
) -> std::io::Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
            signalled = &mut shutdown => {
                signalled?;
                info!("shutdown signal received, stopping accept loop");
                return Ok(());
            }
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        debug!("connection from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let factory = factory.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = wire::process_connection(socket, factory, tls).await {
                warn!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }
}

/// Wait for in-flight connections to release their permits, up to [`DRAIN_TIMEOUT`].
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while semaphore.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let remaining = max_connections - semaphore.available_permits();
            warn!("drain timeout, {remaining} connections still open");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("all connections drained");
}
