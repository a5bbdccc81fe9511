//! Core domain models for the orchestrator
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, run records and their configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod state;
pub mod step;

pub use context::*;
pub use error::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
