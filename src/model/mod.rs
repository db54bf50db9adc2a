/// Weights download and management
pub mod download;
/// Super-resolution inference engine
pub mod engine;
/// Network architecture
pub mod network;

pub use download::{ensure_weights, HttpFetcher, WeightsFetcher};
pub use engine::{CandleLoader, EngineLoader, Enhancer, Upsampler};
pub use network::{ActivationKind, CompactNet, NetworkSpec};
