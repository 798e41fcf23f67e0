use crate::config::Config;
use crate::handler::{ClientHandler, ProxySettings};
use crate::telemetry::{install_exporter, spawn_cache_reporter};
use cloudgate_core::PreparedStatementCache;
use cloudgate_protocol::{DefaultCodec, FrameCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

pub async fn run(config: Config) -> anyhow::Result<()> {
    install_exporter(&config.metrics.listen_addr).await?;

    let shutdown = CancellationToken::new();
    let cache = Arc::new(PreparedStatementCache::new());
    spawn_cache_reporter(
        cache.clone(),
        Duration::from_millis(config.metrics.report_interval_ms),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.proxy.listen_addr).await?;
    info!("cloudgate proxy listening on {}", config.proxy.listen_addr);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_shutdown.cancel();
        }
    });

    let settings = ProxySettings {
        origin_contact_point: config.origin.contact_point.clone(),
        target_contact_point: config.target.contact_point.clone(),
        target_credentials: config.target.credentials(),
        max_auth_rounds: config.handshake.max_auth_rounds,
    };
    serve(listener, settings, config.proxy.max_connections, cache, shutdown).await
}

/// Accepts client connections on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    settings: ProxySettings,
    max_connections: usize,
    cache: Arc<PreparedStatementCache>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let codec: Arc<dyn FrameCodec> = Arc::new(DefaultCodec);
    let permits = Arc::new(Semaphore::new(max_connections));
    loop {
        let (socket, client_addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("rejecting client {client_addr}: connection limit {max_connections} reached");
            continue;
        };
        let _ = socket.set_nodelay(true);
        let settings = settings.clone();
        let cache = cache.clone();
        let codec = codec.clone();
        let shutdown = shutdown.clone();
        let span = tracing::info_span!("client", conn_id = %uuid::Uuid::new_v4(), addr = %client_addr);
        tokio::spawn(
            async move {
                info!("accepted client connection");
                if let Err(err) =
                    ClientHandler::serve(socket, client_addr, settings, cache, codec, shutdown).await
                {
                    error!("client connection failed: {err}");
                }
                drop(permit);
            }
            .instrument(span),
        );
    }
    info!("proxy stopped accepting connections");
    Ok(())
}
