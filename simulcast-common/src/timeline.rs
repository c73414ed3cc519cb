//! Timeline calculator
//!
//! Maps (wall-clock time, schedule) to a broadcast phase and playlist
//! position. Pure and total: no I/O, no mutable state, no panics for any
//! schedule shape (empty playlists and zero-duration items included).
//!
//! There is deliberately no stored "current position" anywhere in the
//! system; the wall clock plus the schedule *is* the position, which is
//! what lets every viewer converge independently of the event fan-out.

use crate::model::BroadcastSchedule;
use serde::{Deserialize, Serialize};

/// Phase of a broadcast at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPhase {
    /// Scheduled start has not been reached yet
    Countdown,
    /// Playing: a current item and position are defined
    Live,
    /// Past the end, or force-stopped. Terminal.
    Ended,
}

/// Computed phase/position of a broadcast at a given instant.
///
/// Derived fresh on every evaluation; never persisted or cached as
/// authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineState {
    pub phase: BroadcastPhase,
    pub seconds_until_start: f64,
    pub seconds_remaining: f64,
    pub current_item_index: usize,
    /// Position within the current item, seconds
    pub position_secs: f64,
    /// 1-based, clamped to the loop count
    pub current_loop: u32,
    pub total_duration_secs: f64,
}

/// Evaluate the timeline state of `schedule` at `now_ms`.
///
/// A set force-stop instant overrides the phase to Ended unconditionally,
/// taking precedence over the time-based computation. A zero-duration
/// broadcast is perpetually Countdown before its start and immediately
/// Ended after it. Ended reports a stable final frame: the last item at
/// its full duration on the final loop.
pub fn evaluate(now_ms: i64, schedule: &BroadcastSchedule) -> TimelineState {
    let loop_count = schedule.clamped_loop_count();
    let playlist_duration = schedule.playlist_duration_secs();
    let total_duration = playlist_duration * loop_count as f64;
    let elapsed = (now_ms - schedule.start_at_ms) as f64 / 1000.0;

    if schedule.forced_stop_at_ms.is_some() {
        return ended_state(schedule, loop_count, total_duration);
    }

    if elapsed < 0.0 {
        return TimelineState {
            phase: BroadcastPhase::Countdown,
            seconds_until_start: -elapsed,
            seconds_remaining: total_duration,
            current_item_index: 0,
            position_secs: 0.0,
            current_loop: 1,
            total_duration_secs: total_duration,
        };
    }

    if total_duration <= 0.0 || elapsed >= total_duration {
        return ended_state(schedule, loop_count, total_duration);
    }

    let elapsed_in_broadcast = elapsed.max(0.0);
    let current_loop =
        ((elapsed_in_broadcast / playlist_duration).floor() as u32 + 1).clamp(1, loop_count);
    let position_in_loop = elapsed_in_broadcast % playlist_duration;

    let (current_item_index, position_secs) = locate_item(schedule, position_in_loop);

    TimelineState {
        phase: BroadcastPhase::Live,
        seconds_until_start: 0.0,
        seconds_remaining: total_duration - elapsed_in_broadcast,
        current_item_index,
        position_secs,
        current_loop,
        total_duration_secs: total_duration,
    }
}

/// Walk the ordered items accumulating durations until the accumulator
/// passes `position_in_loop`; that item is current.
fn locate_item(schedule: &BroadcastSchedule, position_in_loop: f64) -> (usize, f64) {
    let mut accumulated = 0.0;
    for (index, item) in schedule.items.iter().enumerate() {
        let duration = item.duration_secs.max(0.0);
        if position_in_loop < accumulated + duration {
            return (index, position_in_loop - accumulated);
        }
        accumulated += duration;
    }
    // Floating point slop at the loop boundary: report the final frame of
    // the last item rather than walking off the end.
    match schedule.items.last() {
        Some(last) => (schedule.items.len() - 1, last.duration_secs.max(0.0)),
        None => (0, 0.0),
    }
}

/// Stable "final frame" state: last item at its full duration, final loop.
fn ended_state(
    schedule: &BroadcastSchedule,
    loop_count: u32,
    total_duration: f64,
) -> TimelineState {
    let (current_item_index, position_secs) = match schedule.items.last() {
        Some(last) => (schedule.items.len() - 1, last.duration_secs.max(0.0)),
        None => (0, 0.0),
    };
    TimelineState {
        phase: BroadcastPhase::Ended,
        seconds_until_start: 0.0,
        seconds_remaining: 0.0,
        current_item_index,
        position_secs,
        current_loop: loop_count,
        total_duration_secs: total_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessPolicy, PlaylistItem};
    use uuid::Uuid;

    fn item(position: u32, duration_secs: f64) -> PlaylistItem {
        PlaylistItem {
            id: Uuid::new_v4(),
            media_id: format!("media-{position}"),
            access_policy: AccessPolicy::Public,
            duration_secs,
            position,
        }
    }

    /// Start at T=1_000_000 ms, playlist [A:120s, B:180s], loop 2
    fn example_schedule() -> BroadcastSchedule {
        BroadcastSchedule {
            id: Uuid::new_v4(),
            slug: "example".into(),
            title: "Example".into(),
            start_at_ms: 1_000_000,
            items: vec![item(0, 120.0), item(1, 180.0)],
            loop_count: 2,
            drift_tolerance_secs: 5.0,
            resync_interval_ms: 5_000,
            forced_stop_at_ms: None,
            active: true,
        }
    }

    fn at_offset_secs(schedule: &BroadcastSchedule, offset: f64) -> TimelineState {
        evaluate(schedule.start_at_ms + (offset * 1000.0) as i64, schedule)
    }

    #[test]
    fn test_countdown_before_start() {
        let s = example_schedule();
        let state = at_offset_secs(&s, -90.0);
        assert_eq!(state.phase, BroadcastPhase::Countdown);
        assert_eq!(state.seconds_until_start, 90.0);
        assert_eq!(state.seconds_remaining, 600.0);
        assert_eq!(state.current_item_index, 0);
        assert_eq!(state.position_secs, 0.0);
        assert_eq!(state.current_loop, 1);
    }

    #[test]
    fn test_live_in_second_item_first_loop() {
        // now = T + 140s: item B at 20s, loop 1
        let s = example_schedule();
        let state = at_offset_secs(&s, 140.0);
        assert_eq!(state.phase, BroadcastPhase::Live);
        assert_eq!(state.current_item_index, 1);
        assert_eq!(state.position_secs, 20.0);
        assert_eq!(state.current_loop, 1);
        assert_eq!(state.seconds_remaining, 460.0);
    }

    #[test]
    fn test_live_wraps_into_second_loop() {
        // now = T + 310s: position in loop = 10s, item A, loop 2
        let s = example_schedule();
        let state = at_offset_secs(&s, 310.0);
        assert_eq!(state.phase, BroadcastPhase::Live);
        assert_eq!(state.current_item_index, 0);
        assert_eq!(state.position_secs, 10.0);
        assert_eq!(state.current_loop, 2);
    }

    #[test]
    fn test_ended_after_total_duration() {
        // totalDuration = 600s
        let s = example_schedule();
        let state = at_offset_secs(&s, 650.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
        assert_eq!(state.current_item_index, 1);
        assert_eq!(state.position_secs, 180.0);
        assert_eq!(state.current_loop, 2);
        assert_eq!(state.seconds_remaining, 0.0);

        // Monotonic terminal: still Ended much later
        let later = at_offset_secs(&s, 1_000_000.0);
        assert_eq!(later.phase, BroadcastPhase::Ended);
    }

    #[test]
    fn test_exact_boundaries() {
        let s = example_schedule();
        // Exactly at start: Live at item 0, position 0
        let state = at_offset_secs(&s, 0.0);
        assert_eq!(state.phase, BroadcastPhase::Live);
        assert_eq!(state.current_item_index, 0);
        assert_eq!(state.position_secs, 0.0);
        // Exactly at total duration: Ended
        let state = at_offset_secs(&s, 600.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
        // Exactly at the A->B boundary: item B, position 0
        let state = at_offset_secs(&s, 120.0);
        assert_eq!(state.current_item_index, 1);
        assert_eq!(state.position_secs, 0.0);
    }

    #[test]
    fn test_idempotent_for_identical_inputs() {
        let s = example_schedule();
        let now = s.start_at_ms + 217_000;
        assert_eq!(evaluate(now, &s), evaluate(now, &s));
    }

    #[test]
    fn test_live_position_invariant() {
        // sum(durations before current) + position == elapsed mod playlist
        let s = example_schedule();
        let playlist = s.playlist_duration_secs();
        for offset in [0.5, 60.0, 119.9, 120.0, 250.0, 299.0, 301.0, 599.0] {
            let state = at_offset_secs(&s, offset);
            assert_eq!(state.phase, BroadcastPhase::Live, "offset {offset}");
            let before: f64 = s.items[..state.current_item_index]
                .iter()
                .map(|i| i.duration_secs)
                .sum();
            let recomposed = before + state.position_secs;
            assert!(
                (recomposed - offset % playlist).abs() < 1e-6,
                "offset {offset}: {recomposed} != {}",
                offset % playlist
            );
        }
    }

    #[test]
    fn test_force_stop_overrides_live() {
        let mut s = example_schedule();
        s.forced_stop_at_ms = Some(s.start_at_ms + 10_000);
        let state = at_offset_secs(&s, 140.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
    }

    #[test]
    fn test_force_stop_overrides_countdown() {
        let mut s = example_schedule();
        s.forced_stop_at_ms = Some(s.start_at_ms);
        let state = at_offset_secs(&s, -3600.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
    }

    #[test]
    fn test_empty_playlist_is_total_function() {
        let mut s = example_schedule();
        s.items.clear();
        // Before start: perpetually Countdown
        let state = at_offset_secs(&s, -5.0);
        assert_eq!(state.phase, BroadcastPhase::Countdown);
        // After start: immediately Ended, no division by zero
        let state = at_offset_secs(&s, 5.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
        assert_eq!(state.current_item_index, 0);
        assert_eq!(state.position_secs, 0.0);
    }

    #[test]
    fn test_zero_duration_items_are_skipped() {
        let mut s = example_schedule();
        s.items = vec![item(0, 0.0), item(1, 100.0), item(2, 0.0)];
        s.loop_count = 1;
        let state = at_offset_secs(&s, 50.0);
        assert_eq!(state.phase, BroadcastPhase::Live);
        assert_eq!(state.current_item_index, 1);
        assert_eq!(state.position_secs, 50.0);
    }

    #[test]
    fn test_all_zero_durations_end_immediately() {
        let mut s = example_schedule();
        s.items = vec![item(0, 0.0), item(1, 0.0)];
        let state = at_offset_secs(&s, 1.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
    }

    #[test]
    fn test_oversized_loop_count_clamped_in_evaluation() {
        let mut s = example_schedule();
        s.loop_count = 1000;
        let state = at_offset_secs(&s, 140.0);
        // 10 loops x 300s = 3000s total, not 300_000s
        assert_eq!(state.total_duration_secs, 3_000.0);
        let state = at_offset_secs(&s, 3_100.0);
        assert_eq!(state.phase, BroadcastPhase::Ended);
        assert_eq!(state.current_loop, 10);
    }
}
