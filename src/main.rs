use std::{net::SocketAddr, sync::Arc};

use mediadrop::{
    AppState, ArtifactStore, Config, Error, Result,
    encoder::{AudioEncoder, Ffmpeg},
    event_log::{Event, EventSink, EventType, JsonlEventLog},
    extractor::YtDlp,
    router,
    sweeper::Sweeper,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mediadrop=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        error!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let store = Arc::new(ArtifactStore::open(&config.download_dir).await?);
    let events: Arc<dyn EventSink> = Arc::new(JsonlEventLog::new(&config.event_log_path));
    let extractor = Arc::new(YtDlp::new(&config.yt_dlp_bin, config.yt_dlp_timeout));
    let encoder = Arc::new(Ffmpeg::new(&config.ffmpeg_bin, config.ffmpeg_timeout));

    let ffmpeg_available = encoder.available();
    if !ffmpeg_available {
        warn!("FFmpeg no encontrado ({:?}). La conversion a MP3 estara deshabilitada.", config.ffmpeg_bin);
    }
    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: se usara la IP del socket en el registro de eventos.");
    }

    events
        .record(Event::success(EventType::ApplicationStart).details(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": "yt-dlp",
            "ffmpeg_available": ffmpeg_available,
        })))
        .await;

    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::new(
        store.clone(),
        events.clone(),
        config.artifact_max_age,
        config.sweep_interval,
    );
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.child_token()));

    let state = AppState::new(
        store,
        extractor,
        encoder,
        events,
        config.max_concurrent_downloads,
    )
    .trust_proxy_headers(config.trust_proxy_headers);

    let app = router(state).layer(config.cors_layer()?);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        Error::Config(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    info!("Backend listo en http://{}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .map_err(|error| Error::Storage(format!("Error del servidor HTTP: {error}")));

    shutdown.cancel();
    if let Err(error) = sweeper_task.await {
        warn!("La tarea de limpieza termino con error: {error}");
    }

    served
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("No se pudo escuchar Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("No se pudo escuchar SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Apagando el servidor");
}
