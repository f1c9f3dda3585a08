//! Try-on serving layer.
//!
//! Validates try-on requests, owns the accelerator queue, drives the
//! generation pipeline through a [`pipeline::PipelineBackend`] and serves the
//! stored results.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod state;
pub mod store;
pub mod test_util;
pub mod validate;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use state::AppState;
