//! Durable workflow orchestration.
//!
//! - [`state`]: crash-safe, cached persistence of the workflow document
//! - [`phase`]: the fixed phase sequence and its persisted transitions
//! - [`review`]: the multi-pass review convergence loop
//! - [`orchestrator`]: binds review outcomes to phase transitions

pub mod config;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod review;
pub mod state;
