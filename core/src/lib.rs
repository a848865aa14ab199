//! # Orrery Core
//!
//! Small shared utilities for the Orrery simulation runtime.

pub mod math;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the core version. Called once by the simulation root during startup.
pub fn init() {
    log::info!("Orrery Core v{} initialized", VERSION);
}
