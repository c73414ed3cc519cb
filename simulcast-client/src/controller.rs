//! Playback sync controller
//!
//! Periodically reconciles the local player pair against the computed
//! timeline. The timeline is the only authority: the controller never
//! advances a position of its own, it measures where playback *is* and
//! corrects toward where the timeline says it *should* be. Viewers who
//! pause are dragged back to the live position on the next reconcile,
//! which is what makes the broadcast feel live rather than on-demand.

use crate::clock::ClockCalibrator;
use crate::player::{PlaybackSource, PlayerPair};
use simulcast_common::media::TokenIssuer;
use simulcast_common::model::{AccessPolicy, BroadcastSchedule, PlaylistItem};
use simulcast_common::timeline::{self, BroadcastPhase, TimelineState};
use simulcast_common::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How close to an item boundary the next item is prepared, seconds.
/// Signed-access tokens are short-lived, so issuing any earlier would
/// risk expiry before use.
const PREFETCH_WINDOW_SECS: f64 = 30.0;

/// Keeps a player pair converged on the shared broadcast timeline
pub struct SyncController {
    schedule: BroadcastSchedule,
    pair: PlayerPair,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    /// Set by the delivery adapter when the broadcast is force-stopped
    stopped: watch::Receiver<bool>,
    /// (loop, item index) currently playing; `None` before the first
    /// live reconcile
    current: Option<(u32, usize)>,
    terminal: bool,
}

impl SyncController {
    pub fn new(
        schedule: BroadcastSchedule,
        pair: PlayerPair,
        token_issuer: Option<Arc<dyn TokenIssuer>>,
        stopped: watch::Receiver<bool>,
    ) -> Self {
        Self {
            schedule,
            pair,
            token_issuer,
            stopped,
            current: None,
            terminal: false,
        }
    }

    /// Whether the controller has reached its terminal state
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Reconcile playback against the timeline at `now_ms`.
    ///
    /// Separated from the timer loop so the convergence logic is driven
    /// by an explicit clock.
    pub async fn reconcile(&mut self, now_ms: i64) -> Result<()> {
        if self.terminal {
            return Ok(());
        }

        if *self.stopped.borrow() {
            info!("Broadcast '{}' stopped, ending playback", self.schedule.slug);
            self.pair.active().pause().await?;
            self.terminal = true;
            return Ok(());
        }

        let state = timeline::evaluate(now_ms, &self.schedule);
        match state.phase {
            BroadcastPhase::Countdown => {
                // Hold the first item ready at its first frame
                if let Some(first) = self.schedule.items.first().cloned() {
                    let source = self.source_for(&first).await?;
                    self.pair.load_active(&source).await?;
                }
                if !self.pair.active().is_paused().await? {
                    self.pair.active().pause().await?;
                }
            }
            BroadcastPhase::Live => {
                self.reconcile_live(&state).await?;
            }
            BroadcastPhase::Ended => {
                info!("Broadcast '{}' ended", self.schedule.slug);
                self.pair.active().seek(state.position_secs).await?;
                self.pair.active().pause().await?;
                self.terminal = true;
            }
        }
        Ok(())
    }

    async fn reconcile_live(&mut self, state: &TimelineState) -> Result<()> {
        let target = (state.current_loop, state.current_item_index);
        let Some(item) = self.schedule.items.get(state.current_item_index).cloned() else {
            return Ok(());
        };

        if self.current != Some(target) {
            // Item boundary (or first live tick): bring the target item
            // into the active slot, ideally via the preloaded one
            let source = self.source_for(&item).await?;
            if self.pair.inactive_source() == Some(&source) {
                self.pair.swap().await?;
            } else {
                self.pair.load_active(&source).await?;
            }
            self.pair.active().seek(state.position_secs).await?;
            self.pair.active().play().await?;
            self.current = Some(target);
            debug!(
                "Now playing '{}' (loop {}, item {}) at {:.1}s",
                item.media_id, target.0, target.1, state.position_secs
            );
        } else {
            // Same item: measure drift and correct hard when it exceeds
            // the schedule's tolerance. No gradual rate adjustment; a
            // seek converges immediately and is honest about it.
            let actual = self.pair.active().position_secs().await?;
            let drift = actual - state.position_secs;
            if drift.abs() > self.schedule.drift_tolerance_secs {
                info!(
                    "Playback drifted {:.1}s on '{}', correcting",
                    drift, item.media_id
                );
                self.pair.active().seek(state.position_secs).await?;
            }
            // A paused player during Live means the viewer (or OS) paused
            // it; live playback does not wait for anyone
            if self.pair.active().is_paused().await? {
                debug!("Resuming unexpected pause");
                self.pair.active().play().await?;
            }
        }

        // Near the boundary, stage the next item in the inactive slot
        let remaining_in_item = item.duration_secs - state.position_secs;
        if remaining_in_item <= PREFETCH_WINDOW_SECS {
            if let Some(next) = self.next_item(target) {
                let source = self.source_for(&next).await?;
                self.pair.preload(&source).await?;
            }
        }
        Ok(())
    }

    /// The item following `(loop, index)`, wrapping into the next loop
    fn next_item(&self, current: (u32, usize)) -> Option<PlaylistItem> {
        let (current_loop, index) = current;
        if index + 1 < self.schedule.items.len() {
            self.schedule.items.get(index + 1).cloned()
        } else if current_loop < self.schedule.clamped_loop_count() {
            self.schedule.items.first().cloned()
        } else {
            None
        }
    }

    /// Build the playback source for an item, issuing signed tokens
    /// through the collaborator when the item requires them
    async fn source_for(&self, item: &PlaylistItem) -> Result<PlaybackSource> {
        match item.access_policy {
            AccessPolicy::Public => Ok(PlaybackSource::public(&item.media_id)),
            AccessPolicy::Signed => match &self.token_issuer {
                Some(issuer) => {
                    let tokens = issuer.issue(&item.media_id).await?;
                    Ok(PlaybackSource::signed(&item.media_id, tokens))
                }
                None => {
                    warn!(
                        "No token issuer for signed item '{}', trying unsigned",
                        item.media_id
                    );
                    Ok(PlaybackSource::public(&item.media_id))
                }
            },
        }
    }

    /// Drive reconciliation from the calibrated clock until the broadcast
    /// reaches a terminal state or `cancel` fires.
    ///
    /// A change on the stopped flag triggers an immediate reconcile
    /// instead of waiting out the interval.
    pub async fn run(mut self, clock: Arc<ClockCalibrator>, cancel: CancellationToken) {
        let interval = simulcast_common::time::millis_to_duration(self.schedule.resync_interval_ms);
        loop {
            if let Err(e) = self.reconcile(clock.synced_now_ms()).await {
                warn!("Reconcile failed: {}", e);
            }
            if self.terminal {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
                changed = self.stopped.changed() => {
                    if changed.is_err() {
                        // Delivery adapter gone; keep reconciling on the timer
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }
}
