//! Git plumbing for Trellis.
//!
//! This crate provides:
//! - Repository cloning into the shared task workspace
//! - Fast-forward updates from the remote
//! - Working tree status summaries

mod error;
mod service;

pub use error::*;
pub use service::*;
