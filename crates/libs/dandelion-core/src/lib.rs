//! # dandelion-core: release catalog, content store and fleet state
//!
//! This crate holds the domain logic shared by the dandelion server:
//!
//! - [`store::repo`]: the Git-backed content store (branches map to apps)
//! - [`store::archive`]: the per-commit zip archive cache
//! - [`model`]: release catalog, instance status and access-check tables
//! - [`notify`]: notification and push-channel message types
//! - [`bus`]: the cross-replica event bus
//!
//! All state flows through a [`ModelManager`] service bundle owned by the
//! HTTP layer; nothing in here is a global.

pub mod bus;
pub mod error;
pub mod model;
pub mod notify;
pub mod store;

pub use error::{Error, Result};
pub use model::ModelManager;
