//! hotswap-core
//!
//! Live code-swap engine. A long-running process loads modules through a tracked loader;
//! when a module file changes on disk, the new revision is loaded for inspection only, its
//! reloadable members are matched to the live originals by identity, and each original is
//! detoured to a trampoline that translates and compiles the new body on its next call.
//!
//! The crate also carries the small bytecode host runtime the engine targets (live and inert
//! modules, lazy compilation, detours), so every piece is testable in-process.

pub mod config;
pub mod loader;
pub mod model;
pub mod patch;
pub mod registry;
pub mod reloader;
pub mod runtime;
pub mod translate;
pub mod watch;

pub use config::{ConfigError, ReloaderConfig};
pub use reloader::{ReloadRecord, Reloader};

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
