use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};

use glm_warmd::clock::SystemClock;
use glm_warmd::config::ConfigStore;
use glm_warmd::events::BroadcastEmitter;
use glm_warmd::file_logger::FileLogger;
use glm_warmd::models::AppConfig;
use glm_warmd::App;

#[tokio::main]
async fn main() {
    let _ = env_logger::builder().is_test(false).try_init();

    let store = match ConfigStore::at_default_location() {
        Ok(store) => store,
        Err(err) => {
            error!("cannot resolve config path: {err}");
            std::process::exit(1);
        }
    };

    let initial_config = match store.load().await {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load persisted config, using defaults: {err}");
            AppConfig::default()
        }
    };

    let log_dir = initial_config
        .log_directory
        .clone()
        .map(PathBuf::from)
        .or_else(|| store.path().parent().map(|parent| parent.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let wire_log = Arc::new(FileLogger::new(log_dir));
    wire_log.prune(initial_config.max_log_days).await;

    let emitter = Arc::new(BroadcastEmitter::default());
    let mut event_rx = emitter.subscribe();

    let app = App::new(store, Arc::new(SystemClock), emitter, wire_log);

    if let Err(err) = app.load_settings().await {
        warn!("could not load settings: {err}");
    }

    // Keep a headless run observable: mirror events into the process log.
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        debug!("event: {line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event log fell behind, skipped {skipped} event(s)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Monitoring auto-starts on launch.
    if let Err(err) = app.start_monitoring().await {
        warn!("auto-start monitoring failed: {err}");
    } else {
        info!("monitoring auto-started on launch");
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
    info!("shutdown requested");

    if let Err(err) = app.stop_monitoring().await {
        warn!("shutdown stop failed: {err}");
    }
}
