//! Tether Core
//!
//! Core domain types, traits, and error handling for the Tether delegate agent.
//! This crate has minimal dependencies and defines the shared vocabulary
//! between the agent runtime and its control-plane adapters.

pub mod agent;
pub mod error;
pub mod ids;
pub mod ports;
pub mod secrets;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
