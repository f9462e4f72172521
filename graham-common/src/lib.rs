//! Graham Common - Shared plumbing for the Graham valuation pipeline.
//!
//! This crate provides:
//! - Configuration directory resolution and JSON loading helpers
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Small string utilities used in log output

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::ObservabilityConfig;
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};

