//! WhisperBox node: the protocol engine that keeps private forms, their
//! sealed responses and delivery confirmations in sync over a shared
//! pub/sub channel.

pub mod access;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod identity;
pub mod keystore;
pub mod kv;
pub mod network;
pub mod repository;
pub mod transport;

pub use engine::{Engine, EngineConfig, Inbound};
pub use error::EngineError;
pub use events::{EngineEvent, EngineState};
pub use handle::EngineHandle;
pub use repository::Role;
