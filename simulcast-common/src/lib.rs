//! # Simulcast Common Library
//!
//! Shared code for the simulcast services:
//! - Broadcast schedule and playlist data model
//! - Timeline calculator (wall clock + schedule -> phase/position)
//! - Control event types and the control bus
//! - Database layer (schedules, playlist items, force-stop flag)
//! - External collaborator traits (media resolution, access tokens)

pub mod db;
pub mod error;
pub mod events;
pub mod media;
pub mod model;
pub mod time;
pub mod timeline;

pub use error::{Error, Result};
