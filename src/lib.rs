#[macro_use]
extern crate tracing;

pub mod config;
pub mod constants;
pub mod container;
pub mod errors;
pub mod executor;
pub mod gpu;
pub mod io_models;
pub mod log_store;
pub mod logger;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod service;
mod utilities;

pub use utilities::to_short_id;
