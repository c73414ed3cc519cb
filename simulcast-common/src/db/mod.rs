//! Database layer
//!
//! SQLite via sqlx. Only the schedule and its force-stop flag are durable;
//! the current broadcast position is never stored (it is derived from the
//! wall clock by the timeline calculator).

mod init;
mod schedules;

pub use init::init_database;
pub use schedules::{
    create_broadcast, delete_broadcast, get_broadcast, get_status, list_broadcasts,
    set_forced_stop, update_broadcast,
};
