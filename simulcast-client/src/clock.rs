//! Clock calibration
//!
//! Viewer devices cannot be trusted to agree on the time, so every
//! timeline evaluation on the client runs against a synthetic clock:
//! local wall clock plus a calibrated offset to the server's
//! authoritative time. The offset is refreshed on an adaptive cadence
//! that tightens as a broadcast start approaches, with jitter so a
//! popular start time does not produce a synchronized stampede of
//! calibration requests.

use async_trait::async_trait;
use rand::Rng;
use simulcast_common::model::BroadcastSchedule;
use simulcast_common::time;
use simulcast_common::timeline::{self, BroadcastPhase, TimelineState};
use simulcast_common::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local clock drift beyond this triggers an early recalibration
const DRIFT_THRESHOLD: Duration = Duration::from_secs(2);
/// Fixed cadence of the monotonic-vs-wall drift check
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
/// Calibration jitter spread, applied multiplicatively
const JITTER_FRACTION: f64 = 0.15;

/// Source of authoritative server time
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn server_now_ms(&self) -> Result<i64>;
}

/// `TimeSource` backed by the server's `/time` endpoint
pub struct HttpTimeSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct ServerTimeBody {
    now_ms: i64,
}

impl HttpTimeSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn server_now_ms(&self) -> Result<i64> {
        let url = format!("{}/time", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("time fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Unavailable(format!("time fetch failed: {e}")))?;
        let body: ServerTimeBody = response
            .json()
            .await
            .map_err(|e| Error::Unavailable(format!("invalid time response: {e}")))?;
        Ok(body.now_ms)
    }
}

/// Maintains the offset between local wall clock and server time.
///
/// Reads are lock-free; the latest successful calibration wins. A failed
/// calibration keeps the previous offset, which is always better than
/// falling back to the raw device clock.
pub struct ClockCalibrator {
    time_source: Arc<dyn TimeSource>,
    offset_ms: AtomicI64,
    /// Poked to calibrate ahead of cadence (foreground return, drift)
    recalibrate: Notify,
    cancel: CancellationToken,
}

impl ClockCalibrator {
    pub fn new(time_source: Arc<dyn TimeSource>) -> Arc<Self> {
        Arc::new(Self {
            time_source,
            offset_ms: AtomicI64::new(0),
            recalibrate: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Current best estimate of the server's clock, epoch milliseconds
    pub fn synced_now_ms(&self) -> i64 {
        time::now_ms() + self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Request an out-of-cadence calibration, typically when the
    /// application returns to the foreground after an unknown gap
    pub fn on_foreground(&self) {
        self.recalibrate.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Fetch server time once and update the offset.
    ///
    /// The round trip is assumed symmetric: the server's reply is taken to
    /// describe the midpoint of the request.
    pub async fn calibrate(&self) -> Result<()> {
        let before = time::now_ms();
        let server_now = self.time_source.server_now_ms().await?;
        let after = time::now_ms();

        let midpoint = before + (after - before) / 2;
        let offset = server_now - midpoint;
        let previous = self.offset_ms.swap(offset, Ordering::Relaxed);
        debug!(
            "Clock calibrated: offset {}ms (was {}ms, rtt {}ms)",
            offset,
            previous,
            after - before
        );
        Ok(())
    }

    /// Run the calibration loop until the broadcast ends or `stop`.
    ///
    /// Spawns the drift watchdog alongside; both share the recalibrate
    /// signal.
    pub async fn run(self: Arc<Self>, schedule: BroadcastSchedule) {
        if let Err(e) = self.calibrate().await {
            warn!("Initial clock calibration failed: {}", e);
        }
        self.spawn_drift_watchdog();

        loop {
            let state = timeline::evaluate(self.synced_now_ms(), &schedule);
            let Some(interval) = next_interval(&state) else {
                info!("Broadcast ended, calibration loop stopping");
                return;
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(interval)) => {}
                _ = self.recalibrate.notified() => {
                    debug!("Early recalibration requested");
                }
            }

            if let Err(e) = self.calibrate().await {
                // Keep the stale offset; it beats the raw device clock
                warn!("Clock calibration failed, keeping last offset: {}", e);
            }
        }
    }

    /// Detect the local clock stepping relative to the monotonic clock
    /// (suspend/resume, NTP jumps, manual changes) and recalibrate early.
    fn spawn_drift_watchdog(self: &Arc<Self>) {
        let calibrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut wall_anchor = time::now_ms();
            let mut mono_anchor = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = calibrator.cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                }
                let wall_delta = time::now_ms() - wall_anchor;
                let mono_delta = mono_anchor.elapsed().as_millis() as i64;
                let drift = (wall_delta - mono_delta).unsigned_abs();
                if drift > DRIFT_THRESHOLD.as_millis() as u64 {
                    info!("Local clock stepped {}ms, recalibrating", drift);
                    calibrator.recalibrate.notify_one();
                }
                wall_anchor = time::now_ms();
                mono_anchor = tokio::time::Instant::now();
            }
        });
    }
}

/// Calibration interval for the current timeline state; `None` once the
/// broadcast is over and synchronization no longer matters.
pub fn next_interval(state: &TimelineState) -> Option<Duration> {
    match state.phase {
        BroadcastPhase::Ended => None,
        // Steady state: the periodic resync absorbs small drift, so
        // calibration can be lazy once the broadcast is running
        BroadcastPhase::Live => Some(Duration::from_secs(300)),
        BroadcastPhase::Countdown => {
            let until = state.seconds_until_start;
            Some(if until > 600.0 {
                Duration::from_secs(300)
            } else if until > 180.0 {
                Duration::from_secs(60)
            } else if until > 60.0 {
                Duration::from_secs(30)
            } else {
                // Final minute: tight cadence so everyone starts together
                Duration::from_secs(10)
            })
        }
    }
}

/// Spread an interval by +/-15% with a one second floor
pub fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    Duration::from_secs_f64((interval.as_secs_f64() * factor).max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simulcast_common::model::{AccessPolicy, PlaylistItem};
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    struct MockTimeSource {
        skew_ms: i64,
        fail: AtomicBool,
    }

    impl MockTimeSource {
        fn skewed(skew_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                skew_ms,
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TimeSource for MockTimeSource {
        async fn server_now_ms(&self) -> Result<i64> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Unavailable("mock outage".into()));
            }
            Ok(time::now_ms() + self.skew_ms)
        }
    }

    fn state(phase: BroadcastPhase, seconds_until_start: f64) -> TimelineState {
        TimelineState {
            phase,
            seconds_until_start,
            seconds_remaining: 0.0,
            current_item_index: 0,
            position_secs: 0.0,
            current_loop: 1,
            total_duration_secs: 300.0,
        }
    }

    #[tokio::test]
    async fn calibrate_learns_the_server_skew() {
        let calibrator = ClockCalibrator::new(MockTimeSource::skewed(90_000));
        calibrator.calibrate().await.unwrap();
        // Mock has no network latency, so the offset is essentially exact
        assert!((calibrator.offset_ms() - 90_000).abs() < 50);

        let local = time::now_ms();
        let synced = calibrator.synced_now_ms();
        assert!((synced - local - 90_000).abs() < 50);
    }

    #[tokio::test]
    async fn failed_calibration_keeps_the_last_offset() {
        let source = MockTimeSource::skewed(-30_000);
        let calibrator = ClockCalibrator::new(source.clone());
        calibrator.calibrate().await.unwrap();
        let learned = calibrator.offset_ms();

        source.fail.store(true, Ordering::Relaxed);
        assert!(calibrator.calibrate().await.is_err());
        assert_eq!(calibrator.offset_ms(), learned);
    }

    #[test]
    fn cadence_tightens_toward_start() {
        let far = next_interval(&state(BroadcastPhase::Countdown, 3_600.0)).unwrap();
        let near = next_interval(&state(BroadcastPhase::Countdown, 300.0)).unwrap();
        let close = next_interval(&state(BroadcastPhase::Countdown, 90.0)).unwrap();
        let imminent = next_interval(&state(BroadcastPhase::Countdown, 20.0)).unwrap();
        assert!(far > near && near > close && close > imminent);
        assert_eq!(imminent, Duration::from_secs(10));
    }

    #[test]
    fn cadence_relaxes_when_live_and_stops_when_ended() {
        assert_eq!(
            next_interval(&state(BroadcastPhase::Live, 0.0)),
            Some(Duration::from_secs(300))
        );
        assert_eq!(next_interval(&state(BroadcastPhase::Ended, 0.0)), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..200 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs_f64(60.0 * 0.85));
            assert!(j <= Duration::from_secs_f64(60.0 * 1.15));
        }
        // Floor: tiny intervals never collapse to zero
        assert!(jittered(Duration::from_millis(100)) >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn run_stops_once_the_broadcast_has_ended() {
        let schedule = BroadcastSchedule {
            id: Uuid::new_v4(),
            slug: "over".into(),
            title: String::new(),
            start_at_ms: 0,
            items: vec![PlaylistItem {
                id: Uuid::new_v4(),
                media_id: "m".into(),
                access_policy: AccessPolicy::Public,
                duration_secs: 10.0,
                position: 0,
            }],
            loop_count: 1,
            drift_tolerance_secs: 5.0,
            resync_interval_ms: 5_000,
            forced_stop_at_ms: None,
            active: true,
        };
        let calibrator = ClockCalibrator::new(MockTimeSource::skewed(0));
        // Ended long ago: the loop must return promptly rather than sleep
        tokio::time::timeout(Duration::from_secs(1), calibrator.run(schedule))
            .await
            .expect("calibration loop should exit for an ended broadcast");
    }
}
