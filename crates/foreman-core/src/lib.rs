//! Agent process supervision and protocol client core.
//!
//! Starts, reuses and retires one agent process per workspace, speaks
//! line-delimited JSON-RPC over its standard streams, and exposes a
//! uniform [`harness::Harness`] operation set over every backend.

pub mod approval;
pub mod config;
pub mod error;
pub mod harness;
pub mod normalize;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod workspace;

pub use error::{Error, Result};
pub use registry::{AgentRegistry, Capability};
pub use supervisor::Supervisor;
