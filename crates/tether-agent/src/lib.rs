//! Delegate agent runtime for Tether.
//!
//! Registers with the control plane, receives task events by polling or
//! over a stream, executes them under a timeout and reports the results.

pub mod agent;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod governor;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod registration;
pub mod registry;
pub mod retry;
pub mod secrets;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use agent::DelegateAgent;
pub use client::HttpControlPlane;
pub use config::AgentConfig;
pub use dispatcher::{DispatchDecision, TaskDispatcher};
pub use executor::ShellScriptRunner;
pub use health::{HealthCheck, HealthStatus};
pub use state::AgentRuntimeState;
