use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::api_client::QuotaApi;
use crate::clock::Clock;
use crate::decider::{self, WakeReason};
use crate::events::{AppEvent, EventSink};
use crate::models::{
    AppConfig, KeySlotConfig, QuotaSnapshot, RuntimeStatus, SlotRuntimeStatus, UsageWindow,
    MAX_SLOTS,
};
use crate::state::{shared_state, SharedSlotState};

/// Wake scheduler tick; also the confirmation-poll cadence.
const TICK_SECONDS: u64 = 60;

/// Per-slot configuration bundled with the global tuning knobs, so a
/// reload reaches both tasks in a single watch send.
#[derive(Debug, Clone)]
struct TaskConfig {
    cfg: KeySlotConfig,
    retry_window_minutes: u64,
    max_consecutive_errors: u32,
    backoff_cap_minutes: u64,
}

impl TaskConfig {
    fn new(cfg: KeySlotConfig, app: &AppConfig) -> Self {
        Self {
            cfg,
            retry_window_minutes: app.wake_quota_retry_window_minutes,
            max_consecutive_errors: app.max_consecutive_errors,
            backoff_cap_minutes: app.quota_poll_backoff_cap_minutes,
        }
    }
}

/// Handles and signals for a single slot's task pair.
struct SlotTaskControl {
    stop_tx: watch::Sender<bool>,
    config_tx: watch::Sender<TaskConfig>,
    warmup: Arc<Notify>,
    state: SharedSlotState,
    wake_handle: JoinHandle<()>,
    poll_handle: JoinHandle<()>,
}

/// Collaborators shared by both tasks of one slot.
#[derive(Clone)]
struct SlotTaskCtx {
    idx: usize,
    api: Arc<dyn QuotaApi>,
    clock: Arc<dyn Clock>,
    state: SharedSlotState,
    poll_now: Arc<Notify>,
}

pub struct SchedulerManager {
    slot_tasks: HashMap<usize, SlotTaskControl>,
    running: bool,
    api: Option<Arc<dyn QuotaApi>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl SchedulerManager {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            slot_tasks: HashMap::new(),
            running: false,
            api: None,
            clock,
            events,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn slot_ready(cfg: &KeySlotConfig) -> bool {
        cfg.enabled && !cfg.api_key.trim().is_empty()
    }

    pub async fn start(&mut self, api: Arc<dyn QuotaApi>, config: &AppConfig) {
        self.stop().await;

        info!("scheduler starting");
        self.api = Some(api);
        self.running = true;

        for (idx, slot_cfg) in config.slots.iter().enumerate() {
            if !Self::slot_ready(slot_cfg) {
                continue;
            }
            self.spawn_slot(idx, TaskConfig::new(slot_cfg.clone(), config));
        }

        self.events
            .emit(AppEvent::MonitoringChanged { monitoring: true });
    }

    fn spawn_slot(&mut self, idx: usize, task_cfg: TaskConfig) {
        let Some(api) = self.api.clone() else {
            return;
        };

        info!("slot {} starting task pair", idx + 1);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (config_tx, config_rx) = watch::channel(task_cfg);
        let poll_now = Arc::new(Notify::new());
        let warmup = Arc::new(Notify::new());
        let state = shared_state(self.clock.monotonic());

        let ctx = SlotTaskCtx {
            idx,
            api,
            clock: self.clock.clone(),
            state: state.clone(),
            poll_now,
        };

        let wake_handle = tokio::spawn(wake_scheduler_task(
            ctx.clone(),
            warmup.clone(),
            config_rx.clone(),
            stop_rx.clone(),
        ));
        let poll_handle = tokio::spawn(quota_poller_task(
            ctx,
            self.events.clone(),
            config_rx,
            stop_rx,
        ));

        self.slot_tasks.insert(
            idx,
            SlotTaskControl {
                stop_tx,
                config_tx,
                warmup,
                state,
                wake_handle,
                poll_handle,
            },
        );
    }

    async fn stop_slot(&mut self, idx: usize) {
        if let Some(task) = self.slot_tasks.remove(&idx) {
            let _ = task.stop_tx.send(true);
            let _ = task.wake_handle.await;
            let _ = task.poll_handle.await;
            info!("slot {} task pair stopped", idx + 1);
        }
    }

    /// Idempotent; awaits both tasks of every slot before returning.
    pub async fn stop(&mut self) {
        if self.slot_tasks.is_empty() {
            if self.running {
                self.running = false;
                self.events
                    .emit(AppEvent::MonitoringChanged { monitoring: false });
            }
            return;
        }

        info!("scheduler stopping {} slot task pair(s)", self.slot_tasks.len());

        for task in self.slot_tasks.values() {
            let _ = task.stop_tx.send(true);
        }

        let tasks = std::mem::take(&mut self.slot_tasks);
        for (_, task) in tasks {
            let _ = task.wake_handle.await;
            let _ = task.poll_handle.await;
        }

        self.running = false;
        self.events
            .emit(AppEvent::MonitoringChanged { monitoring: false });
        info!("scheduler stopped");
    }

    /// Diffs the new configuration against the running slots: spawns pairs
    /// for newly-enabled slots, stops pairs for newly-disabled ones, and
    /// pushes updated config to surviving pairs without restarting them.
    pub async fn reload_if_running(&mut self, api: Arc<dyn QuotaApi>, config: &AppConfig) {
        if !self.running {
            return;
        }

        info!("scheduler reloading configuration");
        self.api = Some(api);

        for idx in 0..MAX_SLOTS {
            let ready_cfg = config
                .slots
                .get(idx)
                .filter(|slot_cfg| Self::slot_ready(slot_cfg));

            match (self.slot_tasks.contains_key(&idx), ready_cfg) {
                (true, Some(slot_cfg)) => {
                    if let Some(control) = self.slot_tasks.get(&idx) {
                        let _ = control
                            .config_tx
                            .send(TaskConfig::new(slot_cfg.clone(), config));
                        debug!("slot {} config updated", idx + 1);
                    }
                }
                (true, None) => {
                    info!("slot {} disabled by reload", idx + 1);
                    self.stop_slot(idx).await;
                }
                (false, Some(slot_cfg)) => {
                    info!("slot {} enabled by reload", idx + 1);
                    self.spawn_slot(idx, TaskConfig::new(slot_cfg.clone(), config));
                }
                (false, None) => {}
            }
        }
    }

    /// Queues a one-shot manual wake. Repeated requests while the slot's
    /// scheduler is busy coalesce into a single pending wake.
    pub fn warmup_slot(&self, idx: usize) -> bool {
        match self.slot_tasks.get(&idx) {
            Some(control) => {
                control.warmup.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn warmup_all(&self) {
        for control in self.slot_tasks.values() {
            control.warmup.notify_one();
        }
    }

    pub async fn snapshot(&self, config: &AppConfig) -> RuntimeStatus {
        let now_wall_ms = self.clock.wall_epoch_ms();
        let mut slots = Vec::with_capacity(MAX_SLOTS);

        for idx in 0..MAX_SLOTS {
            let row = match (self.slot_tasks.get(&idx), config.slots.get(idx)) {
                (Some(control), Some(slot_cfg)) => {
                    control.state.lock().await.runtime_view(slot_cfg, now_wall_ms)
                }
                (_, slot_cfg) => SlotRuntimeStatus {
                    slot: idx + 1,
                    name: slot_cfg.map(|c| c.name.clone()).unwrap_or_default(),
                    ..Default::default()
                },
            };
            slots.push(row);
        }

        RuntimeStatus {
            monitoring: self.running,
            slots,
        }
    }
}

/// `base × 2^k` minutes, capped. k = 0 is the plain poll interval.
fn backoff_minutes(base: u64, errors: u32, cap: u64) -> u64 {
    let base = base.max(1);
    if errors == 0 {
        return base;
    }
    base.saturating_mul(1u64 << errors.min(16)).min(cap.max(1))
}

/// Ticks every minute: runs the forced-retry path, consults the decider,
/// fires wakes, and services manual warmup requests.
async fn wake_scheduler_task(
    ctx: SlotTaskCtx,
    warmup: Arc<Notify>,
    mut config_rx: watch::Receiver<TaskConfig>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let slot_no = ctx.idx + 1;
    info!("slot {slot_no} wake scheduler started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let tc = config_rx.borrow().clone();
        if !tc.cfg.enabled {
            break;
        }

        // Forced retry: one extra POST when the confirmation window has
        // elapsed without an observed quota advance.
        let forced_due = {
            let mut st = ctx.state.lock().await;
            let due = st.wake_pending
                && !st.wake_forced_retry_fired
                && st
                    .wake_retry_window_deadline
                    .map_or(false, |deadline| ctx.clock.monotonic() >= deadline);
            if due {
                st.wake_forced_retry_fired = true;
            }
            due
        };
        if forced_due {
            warn!("slot {slot_no} wake unconfirmed at window end, sending forced retry");
            match ctx.api.send_wake(&tc.cfg).await {
                Ok(()) => ctx.poll_now.notify_one(),
                Err(err) => register_wake_error(&ctx, &tc, &err.to_string()).await,
            }
        }

        // Regular policy evaluation. The wake-side latch stops scheduled
        // fires but leaves the task ticking so polling and manual warmups
        // keep working.
        let wake_disabled = ctx.state.lock().await.wake_auto_disabled;
        if !wake_disabled {
            let reason = {
                let st = ctx.state.lock().await;
                decider::wake_due(&tc.cfg, &st, ctx.clock.monotonic(), ctx.clock.wall())
            };
            if let Some(reason) = reason {
                info!("slot {slot_no} wake condition met: {reason}");
                fire_wake(&ctx, &tc, Some(&reason)).await;
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            _ = config_rx.changed() => {
                debug!("slot {slot_no} wake scheduler picked up config change");
            }
            _ = warmup.notified() => {
                info!("slot {slot_no} manual warmup requested");
                let tc = config_rx.borrow().clone();
                fire_wake(&ctx, &tc, None).await;
            }
            _ = ctx.clock.sleep(Duration::from_secs(TICK_SECONDS)) => {}
        }
    }

    info!("slot {slot_no} wake scheduler stopped");
}

/// Shared by policy fires, manual warmups, and the cold-start wake:
/// record the pre-send observation, POST, then arm confirmation and the
/// policy's dedup marker.
async fn fire_wake(ctx: &SlotTaskCtx, tc: &TaskConfig, reason: Option<&WakeReason>) {
    let slot_no = ctx.idx + 1;
    let snapshot = ctx.state.lock().await.next_reset_epoch_ms;

    match ctx.api.send_wake(&tc.cfg).await {
        Ok(()) => {
            info!("slot {slot_no} wake request accepted");
            {
                let mut st = ctx.state.lock().await;
                st.wake_pending = true;
                st.wake_snapshot_next_reset = snapshot;
                st.wake_retry_window_deadline = Some(
                    ctx.clock.monotonic()
                        + Duration::from_secs(tc.retry_window_minutes.max(1) * 60),
                );
                st.wake_forced_retry_fired = false;
                if let Some(reason) = reason {
                    decider::mark_fired(&mut st, reason, ctx.clock.monotonic(), ctx.clock.wall());
                }
            }
            ctx.poll_now.notify_one();
        }
        Err(err) => {
            warn!("slot {slot_no} wake request failed: {err}");
            register_wake_error(ctx, tc, &err.to_string()).await;
        }
    }
}

async fn register_wake_error(ctx: &SlotTaskCtx, tc: &TaskConfig, message: &str) {
    let mut st = ctx.state.lock().await;
    st.wake_consecutive_errors += 1;
    st.last_error = Some(message.to_string());
    if st.wake_consecutive_errors >= tc.max_consecutive_errors && !st.wake_auto_disabled {
        st.wake_auto_disabled = true;
        error!(
            "slot {} wake scheduling auto-disabled after {} consecutive wake errors",
            ctx.idx + 1,
            st.wake_consecutive_errors
        );
    }
}

/// Polls quota and 5h usage on the backoff cadence, confirms pending
/// wakes on a one-minute cadence, and emits runtime events.
async fn quota_poller_task(
    ctx: SlotTaskCtx,
    events: Arc<dyn EventSink>,
    mut config_rx: watch::Receiver<TaskConfig>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let slot_no = ctx.idx + 1;
    info!("slot {slot_no} quota poller started");

    // First start: probe the key and wake it immediately when cold. The
    // probe is fail-open; its failure counts toward no error counter.
    {
        let tc = config_rx.borrow().clone();
        let cold = match ctx.api.fetch_quota(&tc.cfg).await {
            Ok(snapshot) => {
                apply_quota_observation(&ctx, &snapshot).await;
                snapshot.cold_key
            }
            Err(err) => {
                warn!("slot {slot_no} initial quota probe failed, assuming cold key: {err}");
                true
            }
        };
        if cold {
            info!("slot {slot_no} key is cold, sending initial wake");
            fire_wake(&ctx, &tc, None).await;
        }
        emit_quota_updated(&ctx, &events).await;
    }

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let tc = config_rx.borrow().clone();
        if !tc.cfg.enabled {
            break;
        }

        // While a wake awaits confirmation the backoff schedule is
        // suspended in favour of the fast one-minute cadence.
        let sleep_duration = {
            let st = ctx.state.lock().await;
            if st.wake_pending {
                Duration::from_secs(TICK_SECONDS)
            } else {
                let minutes = backoff_minutes(
                    tc.cfg.poll_interval_minutes,
                    st.quota_consecutive_errors,
                    tc.backoff_cap_minutes,
                );
                if st.quota_consecutive_errors > 0 {
                    info!("slot {slot_no} backing off: next poll in {minutes} min");
                }
                Duration::from_secs(minutes * 60)
            }
        };

        let proceed = tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
                false
            }
            _ = config_rx.changed() => {
                debug!("slot {slot_no} quota poller picked up config change");
                false
            }
            _ = ctx.poll_now.notified() => {
                debug!("slot {slot_no} polling immediately on wake signal");
                true
            }
            _ = ctx.clock.sleep(sleep_duration) => true,
        };
        if !proceed {
            continue;
        }

        let tc = config_rx.borrow().clone();
        if !tc.cfg.enabled {
            break;
        }
        if ctx.state.lock().await.auto_disabled {
            debug!("slot {slot_no} auto-disabled, skipping quota fetch");
            continue;
        }

        poll_once(&ctx, &events, &tc).await;
    }

    info!("slot {slot_no} quota poller stopped");
}

async fn poll_once(ctx: &SlotTaskCtx, events: &Arc<dyn EventSink>, tc: &TaskConfig) {
    let slot_no = ctx.idx + 1;

    match ctx.api.fetch_quota(&tc.cfg).await {
        Ok(snapshot) => {
            apply_quota_observation(ctx, &snapshot).await;
            info!(
                "slot {slot_no} quota refreshed (next_reset: {:?})",
                snapshot.next_reset_epoch_ms
            );
        }
        Err(err) => {
            let mut st = ctx.state.lock().await;
            st.quota_consecutive_errors += 1;
            st.last_error = Some(err.to_string());
            warn!(
                "slot {slot_no} quota poll failed ({}/{} consecutive): {err}",
                st.quota_consecutive_errors, tc.max_consecutive_errors
            );
            if st.quota_consecutive_errors >= tc.max_consecutive_errors && !st.auto_disabled {
                st.auto_disabled = true;
                error!(
                    "slot {slot_no} quota polling auto-disabled after {} consecutive errors",
                    st.quota_consecutive_errors
                );
            }
        }
    }

    refresh_usage(ctx, tc).await;
    run_confirmation(ctx, events, tc).await;
    emit_quota_updated(ctx, events).await;
}

async fn apply_quota_observation(ctx: &SlotTaskCtx, snapshot: &QuotaSnapshot) {
    let mut st = ctx.state.lock().await;
    if st.quota_consecutive_errors > 0 {
        info!(
            "slot {} recovered after {} consecutive error(s)",
            ctx.idx + 1,
            st.quota_consecutive_errors
        );
    }
    st.percentage = Some(snapshot.percentage);
    st.next_reset_epoch_ms = snapshot.next_reset_epoch_ms;
    st.next_reset_hms = snapshot.next_reset_hms.clone();
    st.quota_consecutive_errors = 0;
    // Clearing the latch on success is explicit policy, not an accident
    // of counter resets.
    st.auto_disabled = false;
    st.last_error = None;
}

/// 5h usage is display data: failures keep the previous numbers and do
/// not count as quota errors.
async fn refresh_usage(ctx: &SlotTaskCtx, tc: &TaskConfig) {
    match ctx.api.fetch_model_usage(&tc.cfg, UsageWindow::FiveHours).await {
        Ok((calls, tokens)) => {
            let mut st = ctx.state.lock().await;
            st.model_calls_5h = calls;
            st.tokens_5h = tokens;
            st.quota_last_updated =
                Some(ctx.clock.wall().format("%Y-%m-%d %H:%M:%S").to_string());
        }
        Err(err) => {
            debug!("slot {} model-usage fetch failed: {err}", ctx.idx + 1);
        }
    }
}

/// Confirmation rules: an observed reset strictly later than the pre-send
/// snapshot (or newly appearing) proves the wake took effect. A window
/// that elapses after the forced retry counts one wake error.
async fn run_confirmation(ctx: &SlotTaskCtx, events: &Arc<dyn EventSink>, tc: &TaskConfig) {
    let slot_no = ctx.idx + 1;
    let confirmed = {
        let mut st = ctx.state.lock().await;
        if !st.wake_pending {
            return;
        }

        let advanced = match (st.next_reset_epoch_ms, st.wake_snapshot_next_reset) {
            (Some(_), None) => true,
            (Some(current), Some(before)) => current > before,
            (None, _) => false,
        };

        if advanced {
            st.wake_pending = false;
            st.wake_retry_window_deadline = None;
            st.wake_consecutive_errors = 0;
            st.wake_auto_disabled = false;
            true
        } else {
            let window_elapsed = st
                .wake_retry_window_deadline
                .map_or(false, |deadline| ctx.clock.monotonic() > deadline);
            if window_elapsed && st.wake_forced_retry_fired {
                st.wake_pending = false;
                st.wake_retry_window_deadline = None;
                st.wake_consecutive_errors += 1;
                warn!(
                    "slot {slot_no} wake never confirmed, counting wake error ({}/{})",
                    st.wake_consecutive_errors, tc.max_consecutive_errors
                );
                if st.wake_consecutive_errors >= tc.max_consecutive_errors
                    && !st.wake_auto_disabled
                {
                    st.wake_auto_disabled = true;
                    error!(
                        "slot {slot_no} wake scheduling auto-disabled after {} consecutive wake errors",
                        st.wake_consecutive_errors
                    );
                }
            }
            false
        }
    };

    if confirmed {
        info!("slot {slot_no} wake confirmed: quota timer advanced");
        events.emit(AppEvent::WakeConfirmed { slot: slot_no });
    }
}

async fn emit_quota_updated(ctx: &SlotTaskCtx, events: &Arc<dyn EventSink>) {
    let now_wall_ms = ctx.clock.wall_epoch_ms();
    let payload = {
        let st = ctx.state.lock().await;
        AppEvent::QuotaUpdated {
            slot: ctx.idx + 1,
            percentage: st.percentage,
            timer_active: st.timer_active(now_wall_ms),
            next_reset_epoch_ms: st.next_reset_epoch_ms,
            next_reset_hms: st.next_reset_hms.clone(),
            model_calls_5h: st.model_calls_5h,
            tokens_5h: st.tokens_5h,
            quota_last_updated: st.quota_last_updated.clone(),
        }
    };
    events.emit(payload);
}
