//! Keel - policy-driven cleanup for container build caches and registries
//!
//! Reconciles published image tags against git history, cleanup policies
//! and live cluster workloads, then removes build stages that no surviving
//! tag depends on.

pub mod audit;
pub mod chart;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub(crate) mod exec;
pub mod git;
pub mod kube;
pub mod lock;
pub mod policy;
pub mod registry;
pub mod ui;

pub use error::{KeelError, KeelResult};
