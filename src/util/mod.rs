//! Process plumbing for the CLI binary.
//!
//! - [`sig_down`] - Ctrl-C and SIGTERM as a cancellation token
//! - [`telemetry`] - log subscriber and optional OpenTelemetry export

pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
