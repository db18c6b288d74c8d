//! Infrastructure layer: job store and dispatcher, event storage, plugin
//! storage backends, configuration, and the engine that wires them together.

pub mod config;
pub mod engine;
pub mod event_store;
pub mod jobs;
pub mod kv;


pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError};
