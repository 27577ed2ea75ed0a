use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use openair_studio::audio::{AssetPlayer, MixerConfig, MixerGraph};
use openair_studio::calls::{CallDirector, DirectorConfig, InMemoryEpisodeStore, Reconciler, ReconcilerConfig};
use openair_studio::fabric::{ConferencingFabric, LocalFabric};
use openair_studio::http::{create_router, AppState};
use openair_studio::notify::{NatsNotifier, Notifier, NullNotifier};
use openair_studio::rooms::{RoomManager, RoomManagerConfig};
use openair_studio::Config;

#[derive(Parser, Debug)]
#[command(name = "openair-studio", about = "Live call-in broadcast studio core")]
struct Args {
    /// Path to the configuration file (without extension)
    #[arg(short, long, default_value = "config/openair-studio")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Config load failed ({}), using defaults", e);
            Config::default()
        }
    };

    info!("{} starting", cfg.service.name);

    // Conferencing fabric and rooms.
    let fabric = Arc::new(LocalFabric::new());
    fabric.start();
    let fabric_dyn: Arc<dyn ConferencingFabric> = fabric.clone();

    let rooms = Arc::new(RoomManager::new(
        fabric_dyn.clone(),
        RoomManagerConfig {
            token_secret: cfg.rooms.token_secret.clone(),
            token_ttl_secs: cfg.rooms.token_ttl_secs,
            ..RoomManagerConfig::default()
        },
    ));
    tokio::spawn(Arc::clone(&rooms).run_membership_events());

    // Session notifier; the studio runs fine without NATS.
    let notifier: Arc<dyn Notifier> = match &cfg.notify.nats_url {
        Some(url) => match NatsNotifier::connect(url).await {
            Ok(n) => Arc::new(n),
            Err(e) => {
                warn!("NATS unavailable ({}), events will not be published", e);
                Arc::new(NullNotifier)
            }
        },
        None => Arc::new(NullNotifier),
    };

    // Audio graph: frame loop plus the host microphone.
    let mixer = Arc::new(MixerGraph::new(MixerConfig::default()));
    mixer.start();
    if let Err(e) = mixer.attach_microphone("host-mic") {
        warn!("Host microphone unavailable: {}", e);
    }

    let assets = Arc::new(AssetPlayer::new(Arc::clone(&mixer)));

    // Lifecycle state machine.
    let episodes = Arc::new(InMemoryEpisodeStore::new());
    let (director, bridge_events) = CallDirector::new(
        episodes.clone(),
        Arc::clone(&rooms),
        fabric_dyn.clone(),
        notifier,
        Arc::clone(&mixer),
        DirectorConfig {
            admit_timeout: std::time::Duration::from_secs(cfg.telephony.admit_timeout_secs),
            ..DirectorConfig::default()
        },
    );
    tokio::spawn(Arc::clone(&rooms).run_bridge_events(bridge_events));

    // Startup recovery scan: the in-memory store has nothing persisted, so
    // this is a no-op here; a persistence collaborator feeds real records.
    director.recover(Vec::new()).await;

    // Drift repair sweep.
    let reconciler = Reconciler::new(
        Arc::clone(&director),
        Arc::clone(&rooms),
        fabric_dyn.clone(),
        ReconcilerConfig {
            interval: std::time::Duration::from_secs(cfg.reconcile.interval_secs),
            alert_after_failures: cfg.reconcile.alert_after_failures,
        },
    );
    tokio::spawn(reconciler.run());

    // HTTP boundary.
    let state = AppState::new(
        Arc::clone(&director),
        Arc::clone(&mixer),
        assets,
        Arc::clone(&rooms),
        fabric_dyn,
        episodes,
        cfg.telephony.webhook_secret.clone(),
    );
    let router = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let server = std::future::IntoFuture::into_future(axum::serve(listener, router));
    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Release every owned session before exit.
    director.shutdown().await;
    mixer.stop();
    fabric.stop();
    info!("{} stopped", cfg.service.name);

    Ok(())
}
