use std::path::PathBuf;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::fs;

use crate::models::{AppConfig, KeySlotConfig, CURRENT_CONFIG_VERSION, MAX_SLOTS};

const CONFIG_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "glm-warmd";

/// Old v2 slot config format (for migration): one wake mode selected by an
/// enum instead of three independent policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SlotConfigV2 {
    slot: usize,
    name: String,
    enabled: bool,
    api_key: String,
    quota_url: String,
    request_url: Option<String>,
    wake_enabled: bool,
    wake_mode: String,
    wake_interval_minutes: u64,
    wake_times: Vec<String>,
    wake_after_reset_minutes: u64,
    poll_interval_minutes: u64,
    logging: bool,
}

impl Default for SlotConfigV2 {
    fn default() -> Self {
        let current = KeySlotConfig::default();
        Self {
            slot: current.slot,
            name: current.name,
            enabled: current.enabled,
            api_key: current.api_key,
            quota_url: current.quota_url,
            request_url: current.request_url,
            wake_enabled: false,
            wake_mode: "after_reset".to_string(),
            wake_interval_minutes: current.schedule_interval_minutes,
            wake_times: Vec::new(),
            wake_after_reset_minutes: current.schedule_after_reset_minutes,
            poll_interval_minutes: current.poll_interval_minutes,
            logging: current.logging,
        }
    }
}

/// Old v2 config format (for migration)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AppConfigV2 {
    slots: Vec<SlotConfigV2>,
    theme: String,
    config_version: u32,
}

impl Default for AppConfigV2 {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            theme: "glm".to_string(),
            config_version: 2,
        }
    }
}

impl From<SlotConfigV2> for KeySlotConfig {
    fn from(old: SlotConfigV2) -> Self {
        let mode = old.wake_mode.as_str();
        Self {
            slot: old.slot,
            name: old.name,
            enabled: old.enabled,
            api_key: old.api_key,
            quota_url: old.quota_url,
            request_url: old.request_url,
            schedule_interval_enabled: old.wake_enabled && mode == "interval",
            schedule_times_enabled: old.wake_enabled && mode == "times",
            schedule_after_reset_enabled: old.wake_enabled && mode == "after_reset",
            schedule_interval_minutes: old.wake_interval_minutes,
            schedule_times: old.wake_times,
            schedule_after_reset_minutes: old.wake_after_reset_minutes,
            poll_interval_minutes: old.poll_interval_minutes,
            logging: old.logging,
        }
    }
}

impl From<AppConfigV2> for AppConfig {
    fn from(old: AppConfigV2) -> Self {
        Self {
            slots: old.slots.into_iter().map(Into::into).collect(),
            theme: old.theme,
            config_version: old.config_version,
            ..AppConfig::default()
        }
    }
}

/// Apply forward migrations from the persisted version to the current one.
fn migrate(raw_json: &str) -> Result<AppConfig, String> {
    if let Ok(cfg) = serde_json::from_str::<AppConfig>(raw_json) {
        if cfg.config_version >= CURRENT_CONFIG_VERSION {
            return Ok(cfg);
        }
    }

    let mut cfg: AppConfig = if let Ok(v2) = serde_json::from_str::<AppConfigV2>(raw_json) {
        v2.into()
    } else {
        serde_json::from_str::<AppConfig>(raw_json)
            .map_err(|err| format!("invalid config JSON: {err}"))?
    };

    let from = cfg.config_version;

    // version 2 → 3: single wake_mode becomes three independent policies
    if from < 3 {
        info!("migrating config v{from} → v3 (independent wake policies)");
        cfg.config_version = 3;
    }

    Ok(cfg)
}

/// https:// always; http:// only when debug mode points at a mock.
fn is_valid_url(url: &str, debug: bool) -> bool {
    if url.starts_with("https://") {
        return true;
    }
    debug && url.starts_with("http://")
}

/// Clamp, trim, and sanitise every field so the rest of the app can trust
/// it. Normalization is idempotent: validate(validate(x)) == validate(x).
fn validate(mut cfg: AppConfig) -> AppConfig {
    let debug = cfg.debug;

    let global_quota = cfg.global_quota_url.trim().to_string();
    let global_request = cfg.global_request_url.trim().to_string();

    if global_quota.is_empty() || !is_valid_url(&global_quota, debug) {
        warn!(
            "config: invalid global_quota_url '{}', resetting to default",
            cfg.global_quota_url
        );
        cfg.global_quota_url = KeySlotConfig::default().quota_url;
    } else {
        cfg.global_quota_url = global_quota;
    }

    if global_request.is_empty() || !is_valid_url(&global_request, debug) {
        warn!(
            "config: invalid global_request_url '{}', resetting to default",
            cfg.global_request_url
        );
        cfg.global_request_url = KeySlotConfig::default().request_url.unwrap_or_default();
    } else {
        cfg.global_request_url = global_request;
    }

    cfg.mock_url = cfg.mock_url.and_then(|url| {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    });

    cfg.log_directory = cfg.log_directory.and_then(|path| {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    });
    cfg.max_log_days = cfg.max_log_days.clamp(1, 365);
    cfg.wake_quota_retry_window_minutes = cfg.wake_quota_retry_window_minutes.clamp(1, 1_440);
    cfg.max_consecutive_errors = cfg.max_consecutive_errors.clamp(1, 1_000);
    cfg.quota_poll_backoff_cap_minutes = cfg.quota_poll_backoff_cap_minutes.clamp(1, 1_440);

    // -- slot count --
    if cfg.slots.len() > MAX_SLOTS {
        warn!("config: truncating {} slots → {MAX_SLOTS}", cfg.slots.len());
        cfg.slots.truncate(MAX_SLOTS);
    }
    while cfg.slots.len() < MAX_SLOTS {
        cfg.slots.push(KeySlotConfig::default());
    }

    for (idx, slot) in cfg.slots.iter_mut().enumerate() {
        slot.slot = idx + 1;

        // -- name: trim, cap at 32 chars --
        slot.name = slot.name.trim().chars().take(32).collect();

        // -- api_key: trim whitespace (no length cap, keys vary by platform) --
        slot.api_key = slot.api_key.trim().to_string();

        // -- URLs fall back to the globals when blank or invalid --
        if !is_valid_url(&slot.quota_url, debug) {
            if !slot.quota_url.trim().is_empty() {
                warn!(
                    "slot {}: invalid quota_url '{}', resetting to default",
                    slot.slot, slot.quota_url
                );
            }
            slot.quota_url = cfg.global_quota_url.clone();
        }
        match &slot.request_url {
            Some(url) if is_valid_url(url, debug) => {}
            Some(url) => {
                warn!(
                    "slot {}: invalid request_url '{}', resetting to default",
                    slot.slot, url
                );
                slot.request_url = Some(cfg.global_request_url.clone());
            }
            None => slot.request_url = Some(cfg.global_request_url.clone()),
        }

        // -- interval bounds (min 1, max 1440 = 24 h) --
        slot.poll_interval_minutes = slot.poll_interval_minutes.clamp(1, 1440);
        slot.schedule_interval_minutes = slot.schedule_interval_minutes.clamp(1, 1440);
        slot.schedule_after_reset_minutes = slot.schedule_after_reset_minutes.clamp(1, 1440);

        // -- schedule_times: max 5 entries, trim, drop blanks, validate HH:MM --
        if slot.schedule_times.len() > 5 {
            slot.schedule_times.truncate(5);
        }
        slot.schedule_times = slot
            .schedule_times
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| {
                if value.is_empty() {
                    return false;
                }
                // accept HH:MM (00:00 – 23:59)
                let valid = value.len() == 5
                    && value.as_bytes()[2] == b':'
                    && value[..2].parse::<u8>().map_or(false, |h| h < 24)
                    && value[3..].parse::<u8>().map_or(false, |m| m < 60);
                if !valid {
                    warn!("slot {}: dropping invalid schedule_time '{value}'", slot.slot);
                }
                valid
            })
            .collect();

        // -- if key is blank, disable polling for safety --
        if slot.api_key.is_empty() && slot.enabled {
            warn!("slot {}: no API key, force-disabling", slot.slot);
            slot.enabled = false;
        }
    }

    // stamp current version
    cfg.config_version = CURRENT_CONFIG_VERSION;
    cfg
}

/// Persistence for the settings document. The core never touches the file
/// directly; it goes through the store's load/save.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// `<platform config dir>/glm-warmd/settings.json`
    pub fn at_default_location() -> Result<Self, String> {
        let mut base = dirs::config_dir()
            .ok_or_else(|| "failed to resolve platform config directory".to_string())?;
        base.push(APP_DIR_NAME);
        base.push(CONFIG_FILE_NAME);
        Ok(Self { path: base })
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn load(&self) -> Result<AppConfig, String> {
        if !self.path.exists() {
            info!("no config file at {}, using defaults", self.path.display());
            return Ok(validate(AppConfig::default()));
        }

        debug!("loading config from {}", self.path.display());

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|err| format!("failed to read config: {err}"))?;

        let migrated = migrate(&content)?;
        let validated = validate(migrated);

        // Always persist after load so the file reflects the latest schema.
        let serialized = serde_json::to_string_pretty(&validated)
            .map_err(|err| format!("failed to serialize config: {err}"))?;
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = fs::write(&self.path, serialized).await;

        Ok(validated)
    }

    pub async fn save(&self, input: AppConfig) -> Result<AppConfig, String> {
        let validated = validate(input);

        info!("saving config to {}", self.path.display());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("failed to create config directory: {err}"))?;
        }

        let serialized = serde_json::to_string_pretty(&validated)
            .map_err(|err| format!("failed to serialize config: {err}"))?;

        fs::write(&self.path, serialized)
            .await
            .map_err(|err| format!("failed to write config: {err}"))?;

        Ok(validated)
    }
}
