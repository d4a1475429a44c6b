use anyhow::Result;
use std::sync::Arc;
use sysdoctor_daemon::{
    bridge::QueryBridge,
    collector::LinuxCollector,
    config::Config,
    detector::IncidentDetector,
    protocol::Response,
    sampler::Sampler,
    snapshot::unix_now,
    socket::{handle_client, SocketServer},
    window::{WindowReader, WindowStore},
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Evaluates incidents after each window change, from a single read of the
/// window, and pushes each opened incident to connected clients. Appends
/// that land while an evaluation is running are coalesced into one pass
/// over the newest window.
async fn evaluation_loop(
    window: WindowReader,
    detector: Arc<Mutex<IncidentDetector>>,
    broadcast_tx: broadcast::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut generation = window.subscribe();

    loop {
        tokio::select! {
            changed = generation.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }

        let snapshots = window.all();
        let events = detector.lock().await.evaluate(&snapshots, unix_now());

        for event in events {
            let message = Response::Incident { data: event };
            match serde_json::to_string(&message) {
                Ok(json) => {
                    // No subscribers is fine
                    let _ = broadcast_tx.send(json);
                }
                Err(e) => error!("Failed to encode incident: {}", e),
            }
        }
    }
    info!("Evaluation loop stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("sysdoctor daemon starting...");

    // Load configuration
    let config_path = Config::config_path();
    let config = if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    let capacity = config.sampling.window_capacity();
    let (writer, reader) = WindowStore::with_capacity(capacity);
    info!(
        "Window holds {} snapshots at {} Hz",
        capacity, config.sampling.rate_hz
    );

    let detector = Arc::new(Mutex::new(IncidentDetector::new(config.detection.clone())));
    let collector = Arc::new(LinuxCollector::new());
    let bridge = Arc::new(
        QueryBridge::new(reader.clone(), Arc::clone(&detector), &config)
            .with_collector(collector.clone()),
    );

    let socket_path = SocketServer::socket_path();
    let server = SocketServer::bind(&socket_path).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = Sampler::new(collector, writer, &config.sampling);
    let sampler_task = tokio::spawn(sampler.run(shutdown_rx.clone()));

    tokio::spawn(evaluation_loop(
        reader,
        Arc::clone(&detector),
        server.broadcast_sender(),
        shutdown_rx,
    ));

    info!("Daemon ready, listening for connections...");

    // Accept client connections
    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let bridge = Arc::clone(&bridge);
                    let broadcast_rx = server.broadcast_sender().subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, broadcast_rx, bridge).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sampler_task.await {
        error!("Sampler task failed: {}", e);
    }
    Ok(())
}
