//! CLI command implementations

pub mod cleanup;

pub use cleanup::execute as cleanup;
