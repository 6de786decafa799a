//! Core engine module
//!
//! Configuration, handle pools, reload requests, frame statistics and the
//! [`Engine`] that ties the subsystems together.

mod config;
mod debug;
mod engine;
mod pool;
mod reload;

pub use config::{ComputeConfig, ConfigError, EngineConfig};
pub use debug::FrameStats;
pub use engine::Engine;
pub use pool::{Pool, PoolIndex};
pub use reload::{ReloadFlags, ReloadRequest};
