//! Utility types shared by the wire format.
//!
//! - [`amount`] - Integer token amounts carried as strings
//! - [`b64`] - Base64 encoding/decoding utilities
//! - [`lit_str`] - Types standing for one fixed string

pub mod amount;
pub mod b64;
pub mod lit_str;

pub use amount::*;
pub use b64::*;
