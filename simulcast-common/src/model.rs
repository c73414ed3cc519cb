//! Broadcast schedule and playlist data model
//!
//! A `BroadcastSchedule` is the only persisted authority for a simulated-live
//! broadcast: the current position is never stored, it is always derived from
//! wall-clock time plus this schedule (see `timeline::evaluate`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Allowed range for `loop_count`
pub const LOOP_COUNT_RANGE: (u32, u32) = (1, 10);

/// Allowed range for the client resync interval in milliseconds
pub const RESYNC_INTERVAL_RANGE_MS: (u64, u64) = (1_000, 60_000);

/// Allowed range for the drift tolerance in seconds
pub const DRIFT_TOLERANCE_RANGE_SECS: (f64, f64) = (1.0, 30.0);

/// Access policy for a playlist item's media reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    /// Playable without credentials
    Public,
    /// Requires a short-lived token from the token collaborator
    Signed,
}

impl AccessPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPolicy::Public => "public",
            AccessPolicy::Signed => "signed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(AccessPolicy::Public),
            "signed" => Ok(AccessPolicy::Signed),
            other => Err(Error::InvalidInput(format!(
                "unknown access policy: {other}"
            ))),
        }
    }
}

/// One media unit with a fixed duration and play order within a broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: Uuid,
    /// Opaque media identifier resolved by the media collaborator
    pub media_id: String,
    pub access_policy: AccessPolicy,
    pub duration_secs: f64,
    /// Zero-based order index, contiguous and unique within a schedule
    pub position: u32,
}

/// One scheduled simulated-live playout of a playlist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSchedule {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    /// Scheduled start instant, milliseconds since the Unix epoch
    pub start_at_ms: i64,
    /// Ordered by `position`
    pub items: Vec<PlaylistItem>,
    /// Number of times the playlist repeats, clamped to [1, 10]
    pub loop_count: u32,
    pub drift_tolerance_secs: f64,
    pub resync_interval_ms: u64,
    /// When set, the broadcast is force-stopped regardless of the timeline math
    pub forced_stop_at_ms: Option<i64>,
    pub active: bool,
}

impl BroadcastSchedule {
    /// Duration of one pass through the playlist, in seconds
    pub fn playlist_duration_secs(&self) -> f64 {
        self.items.iter().map(|i| i.duration_secs.max(0.0)).sum()
    }

    /// Total broadcast duration: playlist duration times the loop count
    pub fn total_duration_secs(&self) -> f64 {
        self.playlist_duration_secs() * self.clamped_loop_count() as f64
    }

    /// Loop count clamped to the valid range, regardless of the stored value
    pub fn clamped_loop_count(&self) -> u32 {
        self.loop_count.clamp(LOOP_COUNT_RANGE.0, LOOP_COUNT_RANGE.1)
    }

    /// Apply validation clamps to all schedule-configurable values.
    ///
    /// Called at write time so stored rows are always in range; readers
    /// clamp again when evaluating.
    pub fn clamp_configurables(&mut self) {
        self.loop_count = self.clamped_loop_count();
        self.resync_interval_ms = self
            .resync_interval_ms
            .clamp(RESYNC_INTERVAL_RANGE_MS.0, RESYNC_INTERVAL_RANGE_MS.1);
        self.drift_tolerance_secs = self
            .drift_tolerance_secs
            .clamp(DRIFT_TOLERANCE_RANGE_SECS.0, DRIFT_TOLERANCE_RANGE_SECS.1);
    }

    /// Validate structural invariants of the playlist.
    ///
    /// Order indices must be contiguous from zero and item durations must
    /// not be negative. An empty playlist is allowed; the timeline
    /// calculator handles it as a zero-duration broadcast.
    pub fn validate(&self) -> Result<()> {
        if self.slug.is_empty() {
            return Err(Error::InvalidInput("slug must not be empty".into()));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.position as usize != idx {
                return Err(Error::InvalidInput(format!(
                    "playlist positions must be contiguous: expected {idx}, got {}",
                    item.position
                )));
            }
            if item.duration_secs < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "item {} has negative duration",
                    item.id
                )));
            }
        }
        Ok(())
    }
}

/// The durable per-broadcast state the polling endpoint serves: cheap to
/// query and sufficient for a viewer to decide "stopped or not"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastStatus {
    pub slug: String,
    pub forced_stop_at_ms: Option<i64>,
    pub active: bool,
}

impl BroadcastStatus {
    /// Whether a viewer should treat this broadcast as terminated
    pub fn is_stopped(&self) -> bool {
        self.forced_stop_at_ms.is_some() || !self.active
    }
}
