//! specmem-embed - per-project local embedding daemon.
//!
//! Listens on a Unix domain socket, encodes text through a native ONNX
//! model, adapts the result to whatever dimension the host project's
//! vector column currently declares, and caches the result on disk. A
//! CPU-aware scheduler and an optional Postgres-backed overflow queue keep
//! the daemon from starving its host process under load; a lifecycle
//! manager lazily loads and idles the encoder and watches for an
//! unreachable parent process.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod oracle;
pub mod overflow;
pub mod project;
pub mod scheduler;
pub mod server;
pub mod stats;

pub use config::Config;
pub use error::{EmbedError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
