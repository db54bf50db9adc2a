//! realesr-runner - single-image super-resolution and environment check
//!
//! This library backs the `upscale` and `check-environment` binaries and
//! exports the core modules for testing.

/// Configuration management
pub mod config;
/// Installed dependency verification
pub mod environment;
/// Upscale failure reasons
pub mod error;
/// Weights, network and inference engine
pub mod model;
/// Phase-by-phase upscale run
pub mod pipeline;
/// Stdout progress protocol
pub mod progress;
/// Diagnostic logging
pub mod telemetry;

pub use error::UpscaleError;
