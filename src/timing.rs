//! Timing service - synchronized single-shot performance starts
//!
//! The timing service turns a civil "start at HH:MM:SS.mmm" wish into a fire
//! on the unix axis, keeps that fire honest while the network clock drifts,
//! and reports everything a UI needs to show about synchronization quality.
//!
//! The target of a schedule is continuously recomputed as
//! `base_unix + (rtt_min + manual_compensation + ntp_delta) / 1000`; whenever
//! a background resync moves the result by more than the adjust threshold,
//! the armed fire is cancelled and re-armed at the new target. Multiple
//! machines that point their schedules at the same civil time and sync
//! against the same servers start within the jitter bound of
//! `rtt_min + manual + local chain latency`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{Datelike, Local, TimeZone};
use tracing::{debug, error, info, warn};

use crate::clock::{unix_now, Clock, FireHandle, LocalClock, NetworkClock};

/// Drift magnitudes at or above this are treated as measurement garbage
///
/// The clock itself is still adopted; only the delta term is ignored.
const DRIFT_ANOMALY_MS: f64 = 5.0e6;

/// Schedules closer to now than this are left to fire instead of re-arming
const IMMINENT_FIRE_WINDOW: f64 = 0.050;

/// Targets closer than this (or already past) are rejected at creation
const MIN_SCHEDULE_LEAD: f64 = 0.050;

/// Callback invoked when a schedule fires; returns whether playback started
pub type PlayFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Public snapshot of one pending schedule
#[derive(Clone, Debug)]
pub struct ScheduleRecord {
    /// Short identifier handed back to the caller
    pub id: String,

    /// Instrument or profile the fire will start
    pub instrument: String,

    /// Requested civil time as (hour, minute, second, millisecond)
    pub when: (u32, u32, u32, u32),

    /// Unix seconds of the requested civil time today
    pub base_unix: f64,

    /// Compensated target the fire is currently armed at
    pub schedule_unix: f64,

    /// Round-trip estimate folded into the target, milliseconds
    pub auto_latency_ms: f64,

    /// User compensation folded into the target, milliseconds
    pub manual_compensation_ms: f64,

    /// Tempo multiplier the fire will start playback with
    pub tempo: f64,

    /// Set once [TimingService::cancel_schedule] ran
    pub cancelled: bool,

    /// Set just before the play callback runs
    pub fired: bool,
}

/// A record together with its live fire handle and callback
struct ScheduleEntry {
    /// Status snapshot, kept current on every re-arm
    record: ScheduleRecord,

    /// Handle of the armed fire, replaced on re-arm
    handle: Option<FireHandle>,

    /// Fire body, shared so a re-arm can reuse it
    fire: Arc<dyn Fn() + Send + Sync>,
}

/// Resync tuning, adjustable at runtime
#[derive(Clone, Copy, Debug)]
struct ResyncSettings {
    /// Seconds between background syncs, clamped to 0.2..=10
    interval_sec: f64,

    /// Re-arm when the recomputed target moves by more than this
    adjust_threshold_ms: f64,

    /// Whether the NTP-vs-system delta joins the compensated target
    include_delta: bool,
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            interval_sec: 1.0,
            adjust_threshold_ms: 5.0,
            include_delta: true,
        }
    }
}

/// Latest latency measurements
#[derive(Clone, Copy, Debug, Default)]
struct LatencyStats {
    /// Minimum round trip to the NTP server, milliseconds
    rtt_min_ms: f64,

    /// NTP minus system clock, milliseconds
    sys_delta_ms: f64,

    /// Local timer-chain overhead, milliseconds
    local_chain_ms: f64,
}

/// Everything the service and its background thread share
struct TimingInner {
    /// Network clock; swapped wholesale when servers change
    clock: RwLock<Arc<NetworkClock>>,

    /// Whether background sync and delta compensation run at all
    ntp_enabled: AtomicBool,

    /// Resync tuning
    settings: Mutex<ResyncSettings>,

    /// User compensation in milliseconds
    manual_compensation_ms: Mutex<f64>,

    /// Latest measurements
    latency: Mutex<LatencyStats>,

    /// Pending schedules by id
    schedules: Mutex<HashMap<String, ScheduleEntry>>,

    /// Interrupt pair for the resync thread; bool flips true on shutdown
    resync_stop: Arc<(Mutex<bool>, Condvar)>,

    /// Whether the resync thread is running
    resync_running: AtomicBool,
}

/// Status summary for UIs and logs
#[derive(Clone, Debug)]
pub struct TimingStatus {
    /// `"NTP"` after a successful sync, `"Local"` otherwise
    pub provider: &'static str,

    /// Offset between unix and monotonic axes, milliseconds
    pub offset_ms: f64,

    /// Minimum round trip, milliseconds
    pub rtt_ms: f64,

    /// NTP minus system clock, milliseconds
    pub sys_delta_ms: f64,

    /// User compensation, milliseconds
    pub manual_compensation_ms: f64,

    /// Net shift applied to schedule targets, milliseconds
    pub net_shift_ms: f64,

    /// Local timer-chain overhead, milliseconds
    pub local_chain_ms: f64,

    /// Whether the delta term participates in the shift
    pub include_ntp_delta: bool,
}

/// Synchronized scheduling of performance starts
pub struct TimingService {
    /// Shared state, also owned by the resync thread
    inner: Arc<TimingInner>,
}

impl TimingService {
    /// Create a service around the given NTP servers
    ///
    /// No network traffic happens here; the first sync runs either on demand
    /// or when the first schedule is created, so application startup never
    /// stalls on a slow resolver.
    pub fn new(servers: Vec<String>, timeout: Duration, max_tries: usize) -> Self {
        let clock = Arc::new(NetworkClock::new(servers, timeout, max_tries));
        Self {
            inner: Arc::new(TimingInner {
                clock: RwLock::new(clock),
                ntp_enabled: AtomicBool::new(true),
                settings: Mutex::new(ResyncSettings::default()),
                manual_compensation_ms: Mutex::new(0.0),
                latency: Mutex::new(LatencyStats::default()),
                schedules: Mutex::new(HashMap::new()),
                resync_stop: Arc::new((Mutex::new(false), Condvar::new())),
                resync_running: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the server list and immediately attempt a sync
    pub fn set_ntp_servers(&self, servers: Vec<String>, timeout: Duration, max_tries: usize) -> bool {
        let clock = Arc::new(NetworkClock::new(servers, timeout, max_tries));
        *self.inner.clock.write().unwrap() = clock;
        self.inner.ntp_enabled.store(true, Ordering::SeqCst);
        self.sync_now()
    }

    /// Tune resync cadence and re-arm threshold
    pub fn set_resync_settings(&self, interval_sec: f64, adjust_threshold_ms: f64) {
        let mut settings = self.inner.settings.lock().unwrap();
        settings.interval_sec = interval_sec.clamp(0.2, 10.0);
        settings.adjust_threshold_ms = adjust_threshold_ms.max(0.0);
        debug!(
            "resync settings: interval={}s threshold={}ms",
            settings.interval_sec, settings.adjust_threshold_ms
        );
    }

    /// Choose whether the NTP-vs-system delta joins the schedule target
    pub fn set_include_delta(&self, include: bool) {
        self.inner.settings.lock().unwrap().include_delta = include;
    }

    /// Set the user compensation in milliseconds
    pub fn set_manual_compensation(&self, ms: f64) {
        *self.inner.manual_compensation_ms.lock().unwrap() = ms;
        debug!("manual compensation set to {ms}ms");
    }

    /// Stop consulting the network; schedules fall back to the system clock
    pub fn use_local(&self) {
        self.inner.ntp_enabled.store(false, Ordering::SeqCst);
        info!("timing switched to the local clock");
    }

    /// Block on one sync plus a latency refresh
    pub fn sync_now(&self) -> bool {
        let clock = self.inner.clock.read().unwrap().clone();
        let ok = clock.sync();
        if ok {
            self.refresh_latency(&clock);
        }
        let state = clock.state();
        info!(
            "manual sync {}: offset={:.3}ms drift={:.2}ms",
            if ok { "ok" } else { "failed" },
            state.last_offset * 1000.0,
            state.last_sys_drift_ms,
        );
        ok
    }

    /// Current synchronization summary
    pub fn status(&self) -> TimingStatus {
        let clock = self.inner.clock.read().unwrap().clone();
        let state = clock.state();
        let latency = *self.inner.latency.lock().unwrap();
        let manual = *self.inner.manual_compensation_ms.lock().unwrap();
        let settings = *self.inner.settings.lock().unwrap();
        let mut net_shift = latency.rtt_min_ms + manual;
        if settings.include_delta {
            net_shift += latency.sys_delta_ms;
        }
        TimingStatus {
            provider: if state.last_sync_ok { "NTP" } else { "Local" },
            offset_ms: state.last_offset * 1000.0,
            rtt_ms: latency.rtt_min_ms,
            sys_delta_ms: latency.sys_delta_ms,
            manual_compensation_ms: manual,
            net_shift_ms: net_shift,
            local_chain_ms: latency.local_chain_ms,
            include_ntp_delta: settings.include_delta,
        }
    }

    /// Create a single-shot start at today's HH:MM:SS.mmm
    ///
    /// Returns the schedule id, or an empty string when the compensated
    /// target is already in the past (closer than 50 ms counts as past).
    pub fn schedule_play(
        &self,
        instrument: &str,
        when: (u32, u32, u32, u32),
        tempo: f64,
        play: PlayFn,
    ) -> String {
        let clock = self.inner.clock.read().unwrap().clone();
        let now_net = if clock.state().last_sync_ok {
            clock.now()
        } else {
            unix_now()
        };
        let (hh, mm, ss, ms) = when;
        let base_unix = today_target_unix(now_net, hh, mm, ss, ms);
        self.schedule_play_at(instrument, when, base_unix, tempo, play)
    }

    /// Create a single-shot start at an explicit base unix time
    pub fn schedule_play_at(
        &self,
        instrument: &str,
        when: (u32, u32, u32, u32),
        base_unix: f64,
        tempo: f64,
        play: PlayFn,
    ) -> String {
        // Front-load one sync and latency probe so the first target is
        // already compensated and the UI has fresh numbers to show.
        let clock = self.inner.clock.read().unwrap().clone();
        if self.inner.ntp_enabled.load(Ordering::SeqCst) {
            clock.sync();
            self.refresh_latency(&clock);
        }
        self.measure_local_chain();

        let schedule_unix = base_unix + self.net_shift_seconds();
        let now_s = unix_now();
        if schedule_unix - now_s < MIN_SCHEDULE_LEAD {
            error!(
                "schedule rejected, target already past: inst={instrument} \
                 base={base_unix:.3} now={now_s:.3} -> at={schedule_unix:.3}"
            );
            return String::new();
        }

        let id = short_id();
        let latency = *self.inner.latency.lock().unwrap();
        let manual = *self.inner.manual_compensation_ms.lock().unwrap();
        info!(
            "schedule created id={id} inst={instrument} base={base_unix:.3} \
             +auto={:.1}ms +manual={manual:.1}ms -> at={schedule_unix:.3}",
            latency.rtt_min_ms
        );

        let fire: Arc<dyn Fn() + Send + Sync> = {
            let inner = Arc::downgrade(&self.inner);
            let id = id.clone();
            let instrument = instrument.to_string();
            Arc::new(move || fire_schedule(&inner, &id, &instrument, &play))
        };

        let handle = {
            let fire = fire.clone();
            clock
                .schedule_at(schedule_unix, Box::new(move || fire()))
                .map_err(|error| error!("failed to arm schedule {id}: {error}"))
                .ok()
        };

        let record = ScheduleRecord {
            id: id.clone(),
            instrument: instrument.to_string(),
            when,
            base_unix,
            schedule_unix,
            auto_latency_ms: latency.rtt_min_ms,
            manual_compensation_ms: manual,
            tempo,
            cancelled: false,
            fired: false,
        };
        self.inner.schedules.lock().unwrap().insert(
            id.clone(),
            ScheduleEntry {
                record,
                handle,
                fire,
            },
        );

        self.ensure_background_resync();
        id
    }

    /// Cancel a pending schedule; `false` when unknown or already fired
    pub fn cancel_schedule(&self, id: &str) -> bool {
        let entry = self.inner.schedules.lock().unwrap().remove(id);
        match entry {
            Some(mut entry) => {
                entry.record.cancelled = true;
                if let Some(handle) = entry.handle.take() {
                    handle.cancel();
                }
                info!("schedule cancelled id={id}");
                true
            }
            None => false,
        }
    }

    /// Status snapshot of one schedule
    pub fn get_schedule(&self, id: &str) -> Option<ScheduleRecord> {
        self.inner
            .schedules
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.record.clone())
    }

    /// Ids of all pending schedules
    pub fn pending_schedules(&self) -> Vec<ScheduleRecord> {
        self.inner
            .schedules
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Start the resync daemon unless it already runs
    pub fn ensure_background_resync(&self) {
        if self.inner.resync_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("pianola-resync".to_string())
            .spawn(move || resync_loop(inner));
        if let Err(error) = spawned {
            self.inner.resync_running.store(false, Ordering::SeqCst);
            error!("failed to start resync thread: {error}");
        }
    }

    /// Stop the daemon and cancel every pending schedule
    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.inner.resync_stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        let ids: Vec<String> = self
            .inner
            .schedules
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.cancel_schedule(&id);
        }
    }

    /// Current compensated shift in seconds
    fn net_shift_seconds(&self) -> f64 {
        let latency = *self.inner.latency.lock().unwrap();
        let manual = *self.inner.manual_compensation_ms.lock().unwrap();
        let include_delta = self.inner.settings.lock().unwrap().include_delta;
        let mut shift_ms = latency.rtt_min_ms + manual;
        if include_delta {
            shift_ms += latency.sys_delta_ms;
        }
        shift_ms / 1000.0
    }

    /// Refresh rtt/delta from a probe burst, filtering anomalous drift
    fn refresh_latency(&self, clock: &NetworkClock) {
        if let Some(estimate) = clock.measure_latency() {
            let mut latency = self.inner.latency.lock().unwrap();
            latency.rtt_min_ms = estimate.rtt_ms;
            if estimate.sys_delta_ms.abs() >= DRIFT_ANOMALY_MS {
                warn!(
                    "ignoring anomalous ntp delta {:.0}ms from {}",
                    estimate.sys_delta_ms, estimate.server
                );
            } else {
                latency.sys_delta_ms = estimate.sys_delta_ms;
            }
            debug!(
                "latency estimate: rtt_min={:.2}ms delta={:.2}ms server={}",
                latency.rtt_min_ms, latency.sys_delta_ms, estimate.server
            );
        }
    }

    /// Measure how long a zero-delay timer takes to come back
    fn measure_local_chain(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        let started = std::time::Instant::now();
        let armed = LocalClock.schedule_at(
            unix_now(),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        if armed.is_ok() && rx.recv_timeout(Duration::from_millis(500)).is_ok() {
            let chain_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.inner.latency.lock().unwrap().local_chain_ms = chain_ms;
        }
    }
}

impl Drop for TimingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the play callback of a schedule and retire its record
///
/// A record that was cancelled (or already retired) between the timer wakeup
/// and this call must not start playback.
fn fire_schedule(inner: &Weak<TimingInner>, id: &str, instrument: &str, play: &PlayFn) {
    let t_now = unix_now();
    let Some(inner) = inner.upgrade() else {
        return;
    };
    {
        let mut schedules = inner.schedules.lock().unwrap();
        let live = match schedules.get_mut(id) {
            Some(entry) if !entry.record.cancelled => {
                entry.record.fired = true;
                let err_ms = (t_now - entry.record.schedule_unix) * 1000.0;
                info!(
                    "schedule fired id={id} inst={instrument} at={:.3} now={t_now:.3} err={err_ms:.2}ms",
                    entry.record.schedule_unix
                );
                true
            }
            _ => false,
        };
        if !live {
            return;
        }
        schedules.remove(id);
    }
    let ok = play(instrument);
    info!(
        "scheduled playback {} inst={instrument}",
        if ok { "started" } else { "failed" }
    );
}

/// Background loop: sync, refresh latency, re-arm drifted schedules
fn resync_loop(inner: Weak<TimingInner>) {
    info!("background resync started");
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let interval = strong.settings.lock().unwrap().interval_sec;
        let (lock, cvar) = &*strong.resync_stop;
        {
            let guard = lock.lock().unwrap();
            let (guard, _) = cvar
                .wait_timeout_while(guard, Duration::from_secs_f64(interval), |stop| !*stop)
                .unwrap();
            if *guard {
                debug!("background resync stopping");
                return;
            }
        }
        if !strong.ntp_enabled.load(Ordering::SeqCst) {
            continue;
        }

        let clock = strong.clock.read().unwrap().clone();
        let synced = clock.sync();
        if synced {
            if let Some(estimate) = clock.measure_latency() {
                let mut latency = strong.latency.lock().unwrap();
                latency.rtt_min_ms = estimate.rtt_ms;
                if estimate.sys_delta_ms.abs() < DRIFT_ANOMALY_MS {
                    latency.sys_delta_ms = estimate.sys_delta_ms;
                }
            }
        }

        rearm_drifted_schedules(&strong, clock.as_ref());
    }
}

/// Recompute every pending target and re-arm those past the threshold
fn rearm_drifted_schedules(inner: &Arc<TimingInner>, clock: &NetworkClock) {
    let latency = *inner.latency.lock().unwrap();
    let manual = *inner.manual_compensation_ms.lock().unwrap();
    let settings = *inner.settings.lock().unwrap();
    let mut shift_ms = latency.rtt_min_ms + manual;
    if settings.include_delta {
        shift_ms += latency.sys_delta_ms;
    }

    let mut schedules = inner.schedules.lock().unwrap();
    for entry in schedules.values_mut() {
        if entry.record.cancelled || entry.record.fired {
            continue;
        }
        let new_schedule_unix = entry.record.base_unix + shift_ms / 1000.0;
        let now_s = unix_now();
        if new_schedule_unix <= now_s {
            // Already past on the new axis; the armed fire handles it.
            continue;
        }
        let diff_ms = (new_schedule_unix - entry.record.schedule_unix).abs() * 1000.0;
        if diff_ms <= settings.adjust_threshold_ms {
            continue;
        }
        if let Some(handle) = entry.handle.take() {
            handle.cancel();
        }
        // A new target inside the imminent window re-arms with zero delay,
        // which fires it right away instead of waiting out the stale target.
        let imminent = new_schedule_unix - now_s <= IMMINENT_FIRE_WINDOW;
        let fire = entry.fire.clone();
        match clock.schedule_at(new_schedule_unix, Box::new(move || fire())) {
            Ok(handle) => {
                info!(
                    "schedule re-armed id={} old={:.3} -> new={new_schedule_unix:.3} \
                     (drift {diff_ms:.2}ms{})",
                    entry.record.id,
                    entry.record.schedule_unix,
                    if imminent { ", firing now" } else { "" },
                );
                entry.record.schedule_unix = new_schedule_unix;
                entry.record.auto_latency_ms = latency.rtt_min_ms;
                entry.record.manual_compensation_ms = manual;
                entry.handle = Some(handle);
            }
            Err(error) => error!("re-arm failed for {}: {error}", entry.record.id),
        }
    }
}

/// Unix seconds of today's HH:MM:SS.mmm on the civil axis of `now_unix`
fn today_target_unix(now_unix: f64, hh: u32, mm: u32, ss: u32, ms: u32) -> f64 {
    let now = Local
        .timestamp_opt(now_unix.floor() as i64, 0)
        .single()
        .unwrap_or_else(Local::now);
    let day_start = Local
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_else(|| now_unix.floor());
    day_start + hh as f64 * 3600.0 + mm as f64 * 60.0 + ss as f64 + ms as f64 / 1000.0
}

/// Ten hex chars of a fresh v4 uuid
fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..10].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Service that never touches the network
    fn offline_service() -> TimingService {
        let service = TimingService::new(
            vec!["127.0.0.1:9".to_string()],
            Duration::from_millis(10),
            1,
        );
        service.use_local();
        service
    }

    /// Play callback counting invocations
    fn counting_play(counter: Arc<AtomicUsize>) -> PlayFn {
        Arc::new(move |_instrument| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    #[test]
    fn near_future_schedule_fires() {
        let service = offline_service();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = service.schedule_play_at(
            "piano",
            (0, 0, 0, 0),
            unix_now() + 0.08,
            1.0,
            counting_play(fired.clone()),
        );
        assert!(!id.is_empty());
        assert!(service.get_schedule(&id).is_some());

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Fired schedules leave the table.
        assert!(service.get_schedule(&id).is_none());
        assert!(!service.cancel_schedule(&id));
    }

    #[test]
    fn past_schedule_is_rejected_with_empty_id() {
        let service = offline_service();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = service.schedule_play_at(
            "piano",
            (0, 0, 0, 0),
            unix_now() - 0.010,
            1.0,
            counting_play(fired.clone()),
        );
        assert!(id.is_empty());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent_and_stops_the_fire() {
        let service = offline_service();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = service.schedule_play_at(
            "piano",
            (0, 0, 0, 0),
            unix_now() + 0.3,
            1.0,
            counting_play(fired.clone()),
        );
        assert!(service.cancel_schedule(&id));
        assert!(!service.cancel_schedule(&id));
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn today_target_lands_on_the_requested_wall_time() {
        let now = unix_now();
        let target = today_target_unix(now, 13, 30, 5, 250);
        let day_start = today_target_unix(now, 0, 0, 0, 0);
        let offset = target - day_start;
        assert!((offset - (13.0 * 3600.0 + 30.0 * 60.0 + 5.25)).abs() < 1e-6);
    }

    #[test]
    fn status_reports_local_provider_before_any_sync() {
        let service = offline_service();
        let status = service.status();
        assert_eq!(status.provider, "Local");
        assert!(status.include_ntp_delta);
        assert_eq!(status.manual_compensation_ms, 0.0);

        service.set_manual_compensation(12.0);
        service.set_include_delta(false);
        let status = service.status();
        assert_eq!(status.manual_compensation_ms, 12.0);
        assert!(!status.include_ntp_delta);
        assert_eq!(status.net_shift_ms, status.rtt_ms + 12.0);
    }

    #[test]
    fn resync_settings_are_clamped() {
        let service = offline_service();
        service.set_resync_settings(0.01, -3.0);
        let settings = *service.inner.settings.lock().unwrap();
        assert_eq!(settings.interval_sec, 0.2);
        assert_eq!(settings.adjust_threshold_ms, 0.0);
        service.set_resync_settings(99.0, 7.5);
        let settings = *service.inner.settings.lock().unwrap();
        assert_eq!(settings.interval_sec, 10.0);
        assert_eq!(settings.adjust_threshold_ms, 7.5);
    }
}
