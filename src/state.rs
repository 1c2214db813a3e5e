use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::{KeySlotConfig, SlotRuntimeStatus};

/// Mutable runtime record for one slot. Both of the slot's tasks and the
/// snapshot reader hold it through [`SharedSlotState`]; critical sections
/// are field writes only, never HTTP.
#[derive(Debug, Clone)]
pub struct SlotState {
    // observed quota
    pub percentage: Option<u8>,
    pub next_reset_epoch_ms: Option<i64>,
    pub next_reset_hms: Option<String>,

    // 5h usage snapshot
    pub model_calls_5h: u64,
    pub tokens_5h: u64,
    pub quota_last_updated: Option<String>,

    // wake deduplication markers, one per policy
    pub last_interval_fire: Instant,
    pub last_times_marker: Option<String>,
    pub last_reset_marker: Option<i64>,

    // wake confirmation
    pub wake_pending: bool,
    pub wake_snapshot_next_reset: Option<i64>,
    pub wake_retry_window_deadline: Option<Instant>,
    pub wake_forced_retry_fired: bool,

    // error counters and disable latches
    pub quota_consecutive_errors: u32,
    pub wake_consecutive_errors: u32,
    pub auto_disabled: bool,
    pub wake_auto_disabled: bool,
    pub last_error: Option<String>,
}

impl SlotState {
    pub fn new(now: Instant) -> Self {
        Self {
            percentage: None,
            next_reset_epoch_ms: None,
            next_reset_hms: None,
            model_calls_5h: 0,
            tokens_5h: 0,
            quota_last_updated: None,
            last_interval_fire: now,
            last_times_marker: None,
            last_reset_marker: None,
            wake_pending: false,
            wake_snapshot_next_reset: None,
            wake_retry_window_deadline: None,
            wake_forced_retry_fired: false,
            quota_consecutive_errors: 0,
            wake_consecutive_errors: 0,
            auto_disabled: false,
            wake_auto_disabled: false,
            last_error: None,
        }
    }

    /// The key is warm while a reset timestamp exists and lies in the future.
    pub fn timer_active(&self, now_wall_ms: i64) -> bool {
        self.next_reset_epoch_ms.map_or(false, |ts| ts > now_wall_ms)
    }

    pub fn runtime_view(&self, cfg: &KeySlotConfig, now_wall_ms: i64) -> SlotRuntimeStatus {
        SlotRuntimeStatus {
            slot: cfg.slot,
            name: cfg.name.clone(),
            enabled: cfg.enabled,
            timer_active: self.timer_active(now_wall_ms),
            percentage: self.percentage,
            next_reset_hms: self.next_reset_hms.clone(),
            next_reset_epoch_ms: self.next_reset_epoch_ms,
            model_calls_5h: self.model_calls_5h,
            tokens_5h: self.tokens_5h,
            quota_last_updated: self.quota_last_updated.clone(),
            last_error: self.last_error.clone(),
            wake_pending: self.wake_pending,
            quota_consecutive_errors: self.quota_consecutive_errors,
            wake_consecutive_errors: self.wake_consecutive_errors,
            consecutive_errors: self
                .quota_consecutive_errors
                .saturating_add(self.wake_consecutive_errors),
            auto_disabled: self.auto_disabled,
            wake_auto_disabled: self.wake_auto_disabled,
        }
    }
}

pub type SharedSlotState = Arc<Mutex<SlotState>>;

pub fn shared_state(now: Instant) -> SharedSlotState {
    Arc::new(Mutex::new(SlotState::new(now)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_active_requires_future_reset() {
        let mut state = SlotState::new(Instant::now());
        assert!(!state.timer_active(1_000));

        state.next_reset_epoch_ms = Some(2_000);
        assert!(state.timer_active(1_000));
        assert!(!state.timer_active(2_000));
        assert!(!state.timer_active(3_000));
    }

    #[test]
    fn runtime_view_sums_the_legacy_counter() {
        let mut state = SlotState::new(Instant::now());
        state.quota_consecutive_errors = 3;
        state.wake_consecutive_errors = 2;

        let cfg = KeySlotConfig {
            slot: 2,
            name: "spare".into(),
            enabled: true,
            ..Default::default()
        };

        let view = state.runtime_view(&cfg, 0);
        assert_eq!(view.slot, 2);
        assert_eq!(view.name, "spare");
        assert_eq!(view.quota_consecutive_errors, 3);
        assert_eq!(view.wake_consecutive_errors, 2);
        assert_eq!(view.consecutive_errors, 5);
    }
}
