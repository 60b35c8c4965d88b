//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Training and evaluation runs
//! - Dataset preparation and adapter target inspection
//! - Batch and interactive inference

pub mod commands;
pub mod handlers;

pub use commands::{Commands, LoggingConfig, RunArgs};
pub use handlers::{
    handle_infer, handle_prepare, handle_resume_status, handle_targets, handle_train,
};
