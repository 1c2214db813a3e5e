//! Keep-warm daemon core for GLM coding-plan credentials: per-slot
//! dual-loop schedulers (wake scheduler + quota poller) behind a typed
//! command surface, with the clock, HTTP client, event sink, and wire
//! log injected by the shell.

pub mod api_client;
pub mod clock;
pub mod config;
pub mod decider;
pub mod events;
pub mod file_logger;
pub mod models;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::api_client::{ApiClient, QuotaApi};
use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::events::EventSink;
use crate::file_logger::LogSink;
use crate::models::{AppConfig, RuntimeStatus, SlotStats};
use crate::scheduler::SchedulerManager;

/// The command surface the front-end talks to. One instance per process;
/// every method is a typed request/response.
pub struct App {
    store: ConfigStore,
    config: Arc<RwLock<AppConfig>>,
    scheduler: Arc<Mutex<SchedulerManager>>,
    wire_log: Arc<dyn LogSink>,
}

impl App {
    pub fn new(
        store: ConfigStore,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        wire_log: Arc<dyn LogSink>,
    ) -> Self {
        let scheduler = Arc::new(Mutex::new(SchedulerManager::new(clock, events)));
        Self {
            store,
            config: Arc::new(RwLock::new(AppConfig::default())),
            scheduler,
            wire_log,
        }
    }

    fn build_client(&self, config: &AppConfig) -> Result<Arc<ApiClient>, String> {
        ApiClient::from_config(config, self.wire_log.clone())
            .map(Arc::new)
            .map_err(|err| err.to_string())
    }

    pub async fn load_settings(&self) -> Result<AppConfig, String> {
        info!("loading settings from disk");
        let loaded = self.store.load().await?;
        {
            let mut guard = self.config.write().await;
            *guard = loaded.clone();
        }
        let enabled = loaded.slots.iter().filter(|s| s.enabled).count();
        info!("settings loaded: {enabled} slot(s) enabled");
        Ok(loaded)
    }

    /// Persists a normalized copy of the settings and hot-reloads the
    /// scheduler when it is running.
    pub async fn save_settings(&self, settings: AppConfig) -> Result<AppConfig, String> {
        let saved = self.store.save(settings).await?;
        info!("settings saved to disk");

        {
            let mut guard = self.config.write().await;
            *guard = saved.clone();
        }

        let api = self.build_client(&saved)?;
        let mut scheduler = self.scheduler.lock().await;
        scheduler.reload_if_running(api, &saved).await;

        Ok(saved)
    }

    pub async fn start_monitoring(&self) -> Result<(), String> {
        info!("starting monitoring");
        let settings = self.config.read().await.clone();
        let enabled = settings
            .slots
            .iter()
            .filter(|s| s.enabled && !s.api_key.trim().is_empty())
            .count();
        info!("monitoring {enabled} enabled slot(s)");

        let api = self.build_client(&settings)?;
        let mut scheduler = self.scheduler.lock().await;
        scheduler.start(api, &settings).await;
        Ok(())
    }

    pub async fn stop_monitoring(&self) -> Result<(), String> {
        info!("stopping monitoring");
        let mut scheduler = self.scheduler.lock().await;
        scheduler.stop().await;
        Ok(())
    }

    pub async fn get_runtime_status(&self) -> RuntimeStatus {
        let config = self.config.read().await.clone();
        let scheduler = self.scheduler.lock().await;
        scheduler.snapshot(&config).await
    }

    /// Manual warmup for one slot (1-based index). Routed to the running
    /// scheduler when possible so requests coalesce; otherwise a direct
    /// one-shot wake POST.
    pub async fn warmup_slot(&self, slot: usize) -> Result<(), String> {
        let config = self.config.read().await.clone();
        let slot_cfg = config
            .slots
            .iter()
            .find(|s| s.slot == slot)
            .ok_or_else(|| format!("slot {slot} not found"))?;
        if slot_cfg.api_key.trim().is_empty() {
            return Err("no API key configured".into());
        }

        {
            let scheduler = self.scheduler.lock().await;
            if scheduler.is_running() && scheduler.warmup_slot(slot - 1) {
                return Ok(());
            }
        }

        info!("warming up slot {slot} directly");
        let api = self.build_client(&config)?;
        api.send_wake(slot_cfg).await.map_err(|err| err.to_string())
    }

    pub async fn warmup_all(&self) -> Result<(), String> {
        info!("warmup all keys requested");
        let config = self.config.read().await.clone();

        {
            let scheduler = self.scheduler.lock().await;
            if scheduler.is_running() {
                scheduler.warmup_all();
                return Ok(());
            }
        }

        let api = self.build_client(&config)?;
        for slot_cfg in &config.slots {
            if !slot_cfg.enabled || slot_cfg.api_key.trim().is_empty() {
                continue;
            }
            match api.send_wake(slot_cfg).await {
                Ok(()) => info!("warmup slot {} succeeded", slot_cfg.slot),
                Err(err) => warn!("warmup slot {} failed: {err}", slot_cfg.slot),
            }
        }

        info!("warmup all keys completed");
        Ok(())
    }

    /// On-demand 24h stats for one slot (1-based index).
    pub async fn fetch_slot_stats(&self, slot: usize) -> Result<SlotStats, String> {
        let config = self.config.read().await.clone();
        let slot_cfg = config
            .slots
            .iter()
            .find(|s| s.slot == slot)
            .ok_or_else(|| format!("slot {slot} not found"))?;
        if slot_cfg.api_key.trim().is_empty() {
            return Err("no API key configured".into());
        }

        let api = self.build_client(&config)?;
        api.fetch_slot_stats(slot_cfg)
            .await
            .map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::BroadcastEmitter;
    use crate::file_logger::NullSink;

    fn test_app(dir: &std::path::Path) -> App {
        App::new(
            ConfigStore::at_path(dir.join("settings.json")),
            Arc::new(SystemClock),
            Arc::new(BroadcastEmitter::default()),
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn save_settings_returns_the_normalized_value() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path());

        let mut cfg = AppConfig::default();
        cfg.slots[0].name = "  padded  ".into();
        cfg.slots[0].poll_interval_minutes = 0;

        let saved = app.save_settings(cfg).await.unwrap();
        assert_eq!(saved.slots[0].name, "padded");
        assert_eq!(saved.slots[0].poll_interval_minutes, 1);

        let loaded = app.load_settings().await.unwrap();
        assert_eq!(loaded.slots[0].name, "padded");
    }

    #[tokio::test]
    async fn monitoring_lifecycle_with_no_ready_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path());

        app.start_monitoring().await.unwrap();
        let status = app.get_runtime_status().await;
        assert!(status.monitoring);
        assert!(status.slots.iter().all(|s| !s.enabled));

        app.stop_monitoring().await.unwrap();
        let status = app.get_runtime_status().await;
        assert!(!status.monitoring);
    }

    #[tokio::test]
    async fn warmup_rejects_unknown_and_keyless_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path());

        assert!(app.warmup_slot(9).await.is_err());
        // default slots have no key configured
        assert!(app.warmup_slot(1).await.is_err());
        assert!(app.fetch_slot_stats(1).await.is_err());
    }
}
