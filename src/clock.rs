//! Clock providers - monotonic time, SNTP synchronization, single-shot fires
//!
//! Everything that needs a notion of "now" goes through the [Clock] trait so
//! that the scheduler and the timing service never care whether they run
//! against the local monotonic clock or a network-disciplined one.
//!
//! [LocalClock] is the plain monotonic axis. [NetworkClock] couples that axis
//! to wall-clock unix seconds through SNTP: a successful sync records
//! `offset = t_ntp - monotonic()`, and `now()` returns `monotonic() + offset`
//! from then on. When every server fails the state keeps its previous offset
//! but reports `last_sync_ok = false`, and `now()` degrades to the plain
//! monotonic axis.
//!
//! Single-shot fires are armed on their own named thread and wait on a
//! `(Mutex<bool>, Condvar)` pair, so a cancel wakes the timer immediately
//! instead of letting it sleep to the target.

use std::net::UdpSocket;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970)
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

/// NTP servers asked when the user configures none
pub const DEFAULT_NTP_SERVERS: [&str; 4] = [
    "pool.ntp.org",
    "time.apple.com",
    "time.cloudflare.com",
    "time.google.com",
];

/// Process-wide origin of the monotonic axis
static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the first call in this process
pub fn monotonic() -> f64 {
    MONOTONIC_EPOCH.elapsed().as_secs_f64()
}

/// System wall clock as unix seconds
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Errors from arming a single-shot fire
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The timer thread could not be spawned
    #[error("failed to spawn timer thread: {0}")]
    Spawn(std::io::Error),
}

/// Cancellation handle for an armed single-shot fire
///
/// Dropping the handle does *not* cancel the fire; the timer thread keeps
/// its own clone of the interrupt pair.
pub struct FireHandle {
    /// Interrupt pair shared with the timer thread
    cancel: Arc<(Mutex<bool>, Condvar)>,
}

impl FireHandle {
    /// Cancel the fire; a no-op when the timer already fired
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.cancel;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

/// Shared notion of time plus the ability to arm a single-shot callback
pub trait Clock: Send + Sync {
    /// Current time in seconds; unix-aligned when a network sync succeeded
    fn now(&self) -> f64;

    /// Arm `cb` to run once at `target_unix` (system unix seconds)
    ///
    /// Never blocks. A target already in the past fires almost immediately;
    /// rejecting stale targets is the caller's policy, not the clock's.
    fn schedule_at(
        &self,
        target_unix: f64,
        cb: Box<dyn FnOnce() + Send>,
    ) -> Result<FireHandle, ScheduleError>;

    /// Cancel a previously armed fire
    fn cancel(&self, handle: &FireHandle) {
        handle.cancel();
    }
}

/// Arm a detached timer thread that fires `cb` at `target_unix`
///
/// The thread waits on the interrupt pair with the remaining delay as the
/// timeout, so cancellation latency is bounded by the condvar wakeup, not by
/// the delay itself. The post-fire error against the target is logged.
fn arm_single_shot(
    target_unix: f64,
    cb: Box<dyn FnOnce() + Send>,
) -> Result<FireHandle, ScheduleError> {
    let cancel = Arc::new((Mutex::new(false), Condvar::new()));
    let thread_cancel = cancel.clone();

    std::thread::Builder::new()
        .name("pianola-fire".to_string())
        .spawn(move || {
            let delay = (target_unix - unix_now()).max(0.0);
            let (lock, cvar) = &*thread_cancel;
            let guard = lock.lock().unwrap();
            let (cancelled, _) = cvar
                .wait_timeout_while(guard, Duration::from_secs_f64(delay), |cancelled| {
                    !*cancelled
                })
                .unwrap();
            if *cancelled {
                debug!("single-shot fire at {target_unix:.3} cancelled");
                return;
            }
            drop(cancelled);
            let err_ms = (unix_now() - target_unix) * 1000.0;
            debug!("single-shot fire at {target_unix:.3}, post error {err_ms:.2}ms");
            cb();
        })
        .map_err(ScheduleError::Spawn)?;

    Ok(FireHandle { cancel })
}

/// Plain local clock on the monotonic axis
#[derive(Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> f64 {
        monotonic()
    }

    fn schedule_at(
        &self,
        target_unix: f64,
        cb: Box<dyn FnOnce() + Send>,
    ) -> Result<FireHandle, ScheduleError> {
        arm_single_shot(target_unix, cb)
    }
}

/// Result of the last synchronization attempt
#[derive(Clone, Copy, Debug, Default)]
pub struct ClockState {
    /// Offset between unix seconds and the monotonic axis
    pub last_offset: f64,

    /// NTP minus system clock at the last sync, in milliseconds
    ///
    /// Positive means the network clock runs ahead of the system clock.
    pub last_sys_drift_ms: f64,

    /// Whether the most recent sync attempt reached any server
    pub last_sync_ok: bool,

    /// Monotonic seconds at the moment of the last successful sync
    pub last_sync_monotonic: f64,
}

/// Minimum round-trip estimate from [NetworkClock::measure_latency]
#[derive(Clone, Debug)]
pub struct LatencyEstimate {
    /// Smallest round trip observed over the probe burst, in milliseconds
    pub rtt_ms: f64,

    /// NTP minus system clock from the most recent probe, in milliseconds
    pub sys_delta_ms: f64,

    /// Server that answered the probes
    pub server: String,
}

/// SNTP-disciplined clock
///
/// Servers are asked in order until one answers or `max_tries` attempts were
/// burned. All socket work is blocking with a per-server timeout; callers
/// that must not stall run [NetworkClock::sync] from a background thread.
pub struct NetworkClock {
    /// Servers in preference order, either host names or `host:port`
    servers: Vec<String>,

    /// Receive timeout applied per server
    timeout: Duration,

    /// Upper bound on servers asked during one sync
    max_tries: usize,

    /// Result of the last sync attempt
    state: Mutex<ClockState>,
}

impl NetworkClock {
    /// Create an unsynced clock; call [NetworkClock::sync] to discipline it
    pub fn new(servers: Vec<String>, timeout: Duration, max_tries: usize) -> Self {
        let servers = if servers.is_empty() {
            DEFAULT_NTP_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            servers
        };
        Self {
            servers,
            timeout,
            max_tries: max_tries.max(1),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Snapshot of the sync state
    pub fn state(&self) -> ClockState {
        *self.state.lock().unwrap()
    }

    /// Ask servers in order for the current unix time
    ///
    /// Updates the offset on the first answer and returns `true`. When every
    /// attempt fails only `last_sync_ok` flips to `false`; the previous
    /// offset is kept so a later consumer can still inspect it.
    pub fn sync(&self) -> bool {
        let mut tries = 0;
        for host in &self.servers {
            if tries >= self.max_tries {
                break;
            }
            tries += 1;
            let Some(t_ntp) = self.query_server(host) else {
                continue;
            };
            let now_mono = monotonic();
            let drift_ms = (t_ntp - unix_now()) * 1000.0;
            let mut state = self.state.lock().unwrap();
            *state = ClockState {
                last_offset: t_ntp - now_mono,
                last_sys_drift_ms: drift_ms,
                last_sync_ok: true,
                last_sync_monotonic: now_mono,
            };
            debug!(
                "ntp sync ok via {host}: offset={:.6}s drift={drift_ms:.2}ms",
                state.last_offset
            );
            return true;
        }
        self.state.lock().unwrap().last_sync_ok = false;
        warn!("ntp sync failed, all servers unreachable; staying on the monotonic clock");
        false
    }

    /// Probe the first responsive server a few times and keep the minimum RTT
    ///
    /// Also records the NTP-vs-system delta at the moment of the last
    /// answer. Returns `None` when nothing answered.
    pub fn measure_latency(&self) -> Option<LatencyEstimate> {
        const PROBES: usize = 3;

        for host in self.servers.iter().take(self.max_tries) {
            let mut rtt_min: Option<f64> = None;
            let mut sys_delta_ms = 0.0;
            for _ in 0..PROBES {
                let sent = Instant::now();
                let Some(t_ntp) = self.query_server(host) else {
                    continue;
                };
                let rtt = sent.elapsed().as_secs_f64() * 1000.0;
                rtt_min = Some(rtt_min.map_or(rtt, |m: f64| m.min(rtt)));
                sys_delta_ms = (t_ntp - unix_now()) * 1000.0;
            }
            if let Some(rtt_ms) = rtt_min {
                return Some(LatencyEstimate {
                    rtt_ms,
                    sys_delta_ms,
                    server: host.clone(),
                });
            }
        }
        None
    }

    /// One SNTP round trip; `None` on any socket, DNS or format problem
    fn query_server(&self, host: &str) -> Option<f64> {
        // 48-byte client packet: LI=0, VN=4, Mode=3
        let mut packet = [0u8; 48];
        packet[0] = 0x23;

        let target: String = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:123")
        };

        let result = (|| -> std::io::Result<Option<f64>> {
            let socket = UdpSocket::bind(("0.0.0.0", 0))?;
            socket.set_read_timeout(Some(self.timeout))?;
            socket.send_to(&packet, target.as_str())?;
            let mut response = [0u8; 512];
            let (len, _) = socket.recv_from(&mut response)?;
            Ok(parse_transmit_timestamp(&response[..len]))
        })();

        match result {
            Ok(Some(unix)) => Some(unix),
            Ok(None) => {
                debug!("ntp response from {host} too short or malformed");
                None
            }
            Err(error) => {
                debug!("ntp query to {host} failed: {error}");
                None
            }
        }
    }
}

/// Extract the transmit timestamp (bytes 40..48) as unix seconds
fn parse_transmit_timestamp(response: &[u8]) -> Option<f64> {
    if response.len() < 48 {
        return None;
    }
    let seconds = u32::from_be_bytes(response[40..44].try_into().ok()?);
    let fraction = u32::from_be_bytes(response[44..48].try_into().ok()?);
    let ntp_seconds = seconds as f64 + fraction as f64 / (1u64 << 32) as f64;
    Some(ntp_seconds - NTP_UNIX_EPOCH_OFFSET as f64)
}

impl Clock for NetworkClock {
    fn now(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.last_sync_ok {
            monotonic() + state.last_offset
        } else {
            monotonic()
        }
    }

    fn schedule_at(
        &self,
        target_unix: f64,
        cb: Box<dyn FnOnce() + Send>,
    ) -> Result<FireHandle, ScheduleError> {
        arm_single_shot(target_unix, cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Answer one SNTP request on a loopback socket with the given unix time
    fn spawn_ntp_responder(unix_seconds: f64) -> String {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            if let Ok((_, remote)) = socket.recv_from(&mut buf) {
                let mut response = [0u8; 48];
                let ntp = unix_seconds + NTP_UNIX_EPOCH_OFFSET as f64;
                let secs = ntp.trunc() as u64 as u32;
                let frac = (ntp.fract() * (1u64 << 32) as f64) as u32;
                response[40..44].copy_from_slice(&secs.to_be_bytes());
                response[44..48].copy_from_slice(&frac.to_be_bytes());
                let _ = socket.send_to(&response, remote);
            }
        });
        addr.to_string()
    }

    #[test]
    fn transmit_timestamp_parses_and_rejects_short_packets() {
        let mut response = [0u8; 48];
        let unix = 1_700_000_000.5f64;
        let ntp = unix + NTP_UNIX_EPOCH_OFFSET as f64;
        response[40..44].copy_from_slice(&(ntp.trunc() as u64 as u32).to_be_bytes());
        response[44..48].copy_from_slice(&((ntp.fract() * (1u64 << 32) as f64) as u32).to_be_bytes());

        let parsed = parse_transmit_timestamp(&response).unwrap();
        assert!((parsed - unix).abs() < 1e-3);
        assert_eq!(parse_transmit_timestamp(&response[..47]), None);
    }

    #[test]
    fn sync_against_loopback_server_aligns_now() {
        let pretend_unix = unix_now() + 5.0;
        let server = spawn_ntp_responder(pretend_unix);
        let clock = NetworkClock::new(vec![server], Duration::from_millis(500), 3);

        assert!(clock.sync());
        let state = clock.state();
        assert!(state.last_sync_ok);
        // The responder claims to be five seconds ahead of the system clock.
        assert!((state.last_sys_drift_ms - 5000.0).abs() < 500.0);
        assert!((clock.now() - pretend_unix).abs() < 0.5);
    }

    #[test]
    fn failed_sync_falls_back_to_monotonic() {
        // Nothing listens on this port; recv will time out quickly.
        let clock = NetworkClock::new(
            vec!["127.0.0.1:9".to_string()],
            Duration::from_millis(50),
            1,
        );
        assert!(!clock.sync());
        assert!(!clock.state().last_sync_ok);
        let before = monotonic();
        let now = clock.now();
        assert!(now >= before && now < before + 1.0);
    }

    #[test]
    fn single_shot_fires_close_to_target() {
        let (tx, rx) = mpsc::channel();
        let clock = LocalClock;
        let target = unix_now() + 0.03;
        let _handle = clock
            .schedule_at(target, Box::new(move || tx.send(unix_now()).unwrap()))
            .unwrap();
        let fired_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(fired_at >= target - 0.01);
        assert!(fired_at - target < 0.2);
    }

    #[test]
    fn cancelled_single_shot_never_fires() {
        let (tx, rx) = mpsc::channel::<()>();
        let clock = LocalClock;
        let handle = clock
            .schedule_at(unix_now() + 0.2, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        // A second cancel is a no-op.
        handle.cancel();
    }
}
