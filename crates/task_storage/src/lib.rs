//! Pluggable task storage for Trellis.
//!
//! This crate provides:
//! - A uniform [`StorageBackend`] interface over JSON file, SQLite and
//!   PostgreSQL engines
//! - Classification of backend failures into typed, severity-ranked
//!   errors with per-kind retry budgets
//! - Health monitoring with operation metrics and backend probes
//! - Routing of task operations through the shared workspace lock for
//!   backends that store data inside the repository tree

mod backend;
mod classify;
mod config;
mod error;
mod health;
mod json_file;
mod postgres;
mod retry;
mod router;
mod sqlite;
mod tasks;

pub use backend::*;
pub use classify::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use json_file::*;
pub use postgres::*;
pub use retry::*;
pub use router::*;
pub use sqlite::*;
pub use tasks::*;
