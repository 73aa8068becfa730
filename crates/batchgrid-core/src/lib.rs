//! batchgrid-core: shared model for the batchgrid job orchestrator.
//!
//! Holds everything that does not talk to a scheduler: the `batchgrid.toml`
//! configuration, the backend-independent job model, run-time strings, the
//! per-run directory layout and the small file helpers every backend writes
//! its descriptors with.

pub mod config;
pub mod fsutil;
pub mod graph;
pub mod layout;
pub mod time;
pub mod types;

pub use config::{BatchConfig, ConfigError, EngineKind};
pub use graph::JobGraph;
pub use layout::RunLayout;
pub use time::RunTime;
pub use types::*;
