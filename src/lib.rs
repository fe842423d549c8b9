// THEORY:
// This file is the main entry point for the `layercam` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (the dashboard's web layer,
// or the example runner in `main.rs`).
//
// The primary goal is to export the `SessionGateway` and its response types as
// the clean, high-level interface for the capture core. The building blocks in
// `core_modules` (pool building, the session worker, the record store and the
// layer bundler) stay public for testing and tooling, but a caller that only
// wants to run sessions never needs to reach past the gateway.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod gateway;

pub use config::{CaptureConfig, ConfigError};
pub use core_modules::capture_session::{SessionEvent, SessionOutcome};
pub use core_modules::dataset::{LayerId, Split, SplitMode};
pub use error::{CaptureError, Result};
pub use gateway::{
    LayerCounter, LibraryItem, ResetResponse, SessionGateway, SessionStatus, StartResponse, StartStatus,
};
