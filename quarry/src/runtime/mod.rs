/// Engine construction and the public handle.
pub mod builder;
/// Adaptive consumer pool.
pub(crate) mod consumer;
/// The control loop actor owning all engine state.
pub(crate) mod control;

pub use builder::{EngineHandle, JobEngine, JobEngineBuilder};
