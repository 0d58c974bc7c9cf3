//! Core entity definitions for Trellis.
//!
//! This crate defines the task record types shared by every storage
//! backend and by the workspace routing layer.

mod task;

pub use task::*;
