//! HTTP API for the simulcast worker

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, run, AppContext};
