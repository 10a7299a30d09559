pub mod controller;
pub mod device;
pub mod envelope;
pub mod foreground;
pub mod recording;
pub mod rgba_converter;
pub mod session;
pub mod simulated;
pub mod source;
pub mod tracking;
pub mod transform;
pub mod views;

// Re-exports for convenience
pub use session::{SessionConfig, SourceIdentity, run_session};
pub use simulated::SimulatedDriver;
