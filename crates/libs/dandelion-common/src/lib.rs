//! Shared pieces of the dandelion workspace: configuration loading and
//! tracing setup. Both the control-plane server and the fleet agent depend
//! on this crate.

pub mod config;
pub mod tracing;

pub use config::AppConfig;
