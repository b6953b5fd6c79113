#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process scheduling engine for stevedore: evaluation broker, worker
//! pool, plan applier and deployment watcher, wired together behind an
//! [`api::EngineHandle`].

/// Public API for the engine crate.
pub mod api;

pub mod applier;
pub mod broker;
pub mod watcher;

mod engine;
mod worker;

pub use api::{
    EngineConfig, EngineError, EngineEvent, EngineHandle, StatusSnapshot, WorkerSnapshot,
    WorkerState, start_engine, start_engine_with,
};
