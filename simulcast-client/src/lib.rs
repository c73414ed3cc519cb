//! Simulcast viewer client
//!
//! Everything a viewer-side player application needs to track a
//! simulated-live broadcast: clock calibration against the server's
//! authoritative time, a double-buffered player pair, a sync controller
//! that keeps playback converged on the shared timeline, and a delivery
//! adapter that listens for control events with a polling fallback.
//!
//! The embedding application supplies the actual media player behind the
//! [`player::Player`] trait; everything else is self-contained.

pub mod clock;
pub mod controller;
pub mod delivery;
pub mod player;
