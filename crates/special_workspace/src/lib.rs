//! Shared git workspace for in-tree task storage.
//!
//! A single clone per repository URL serves every Trellis session on the
//! machine. Mutating operations run under an advisory file lock so that
//! concurrent sessions, including other processes, do not interleave
//! writes to the task files.

mod config;
mod error;
mod lock;
mod manager;

pub use config::*;
pub use error::*;
pub use lock::*;
pub use manager::*;
