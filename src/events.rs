use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events pushed to the front-end. Fire-and-forget; a slow or absent
/// subscriber never blocks a scheduler task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppEvent {
    QuotaUpdated {
        slot: usize,
        percentage: Option<u8>,
        timer_active: bool,
        next_reset_epoch_ms: Option<i64>,
        next_reset_hms: Option<String>,
        model_calls_5h: u64,
        tokens_5h: u64,
        quota_last_updated: Option<String>,
    },
    MonitoringChanged {
        monitoring: bool,
    },
    WakeConfirmed {
        slot: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AppEvent);
}

/// Broadcast-backed emitter. Front-ends subscribe and render; the core
/// only ever sends.
pub struct BroadcastEmitter {
    tx: broadcast::Sender<AppEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEmitter {
    fn emit(&self, event: AppEvent) {
        // Err just means nobody is listening right now.
        if self.tx.send(event).is_err() {
            debug!("event dropped: no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = AppEvent::MonitoringChanged { monitoring: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "monitoring-changed");

        let event = AppEvent::WakeConfirmed { slot: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "wake-confirmed");
        assert_eq!(json["slot"], 2);
    }

    #[tokio::test]
    async fn broadcast_emitter_delivers_to_subscriber() {
        let emitter = BroadcastEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(AppEvent::MonitoringChanged { monitoring: false });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            AppEvent::MonitoringChanged { monitoring: false }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let emitter = BroadcastEmitter::new(8);
        emitter.emit(AppEvent::WakeConfirmed { slot: 1 });
    }
}
