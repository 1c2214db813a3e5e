use std::fmt;

use chrono::{DateTime, Local, Timelike};
use tokio::time::{Duration, Instant};

use crate::models::KeySlotConfig;
use crate::state::SlotState;

/// Which policy asked for a wake. Carries the trigger instance so the log
/// and the dedup marker agree on what fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    AfterReset(i64),
    Times(String),
    Interval,
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterReset(reset) => write!(f, "after-reset (observed reset {reset})"),
            Self::Times(hhmm) => write!(f, "times (matched {hhmm})"),
            Self::Interval => write!(f, "interval"),
        }
    }
}

fn times_marker(now_wall: DateTime<Local>) -> String {
    now_wall.format("%Y-%m-%d %H:%M").to_string()
}

/// Pure wake decision. All three policies are evaluated every tick; the
/// most specific match wins (AfterReset, then Times, then Interval).
/// Precision is one caller tick (±60 s); the per-policy markers make each
/// trigger instance fire at most once.
pub fn wake_due(
    cfg: &KeySlotConfig,
    state: &SlotState,
    now_mono: Instant,
    now_wall: DateTime<Local>,
) -> Option<WakeReason> {
    if cfg.schedule_after_reset_enabled {
        // Inert until a reset timestamp has been observed (cold key).
        if let Some(next_reset) = state.next_reset_epoch_ms {
            let offset_ms = cfg.schedule_after_reset_minutes.max(1) as i64 * 60_000;
            let due = now_wall.timestamp_millis() >= next_reset + offset_ms;
            if due && state.last_reset_marker != Some(next_reset) {
                return Some(WakeReason::AfterReset(next_reset));
            }
        }
    }

    if cfg.schedule_times_enabled {
        let current_hm = format!("{:02}:{:02}", now_wall.hour(), now_wall.minute());
        if cfg.schedule_times.iter().any(|value| value == &current_hm)
            && state.last_times_marker.as_deref() != Some(times_marker(now_wall).as_str())
        {
            return Some(WakeReason::Times(current_hm));
        }
    }

    if cfg.schedule_interval_enabled {
        let interval = Duration::from_secs(cfg.schedule_interval_minutes.max(1) * 60);
        if now_mono.duration_since(state.last_interval_fire) >= interval {
            return Some(WakeReason::Interval);
        }
    }

    None
}

/// Records the dedup marker for a wake that was actually sent.
pub fn mark_fired(
    state: &mut SlotState,
    reason: &WakeReason,
    now_mono: Instant,
    now_wall: DateTime<Local>,
) {
    match reason {
        WakeReason::AfterReset(reset) => state.last_reset_marker = Some(*reset),
        WakeReason::Times(_) => state.last_times_marker = Some(times_marker(now_wall)),
        WakeReason::Interval => state.last_interval_fire = now_mono,
    }
}
