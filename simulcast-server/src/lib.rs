//! Simulcast worker server
//!
//! One process of the simulated-live broadcast backend: HTTP API for
//! schedule mutations and viewer status, SSE fan-out for control events,
//! and (in the primary process) supervision of worker processes.

pub mod api;
pub mod config;
pub mod fanout;
pub mod supervisor;
