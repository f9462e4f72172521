//! Configuration validation.
//!
//! Every config section implements [`Validate`]; the pipeline refuses to start
//! when any section reports an error.

use thiserror::Error;

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Shorthand for an [`ValidationError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a list of errors into `Ok`, a single error, or `Multiple`.
    pub fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

/// Require a strictly positive, finite number.
pub fn require_positive(field: &str, value: f64) -> ValidationResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, format!("must be positive, got {}", value)))
    }
}

/// Require a finite number inside `[min, max]`.
pub fn require_range(field: &str, value: f64, min: f64, max: f64) -> ValidationResult<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError::invalid(
            field,
            format!("must be within [{}, {}], got {}", min, max, value),
        ))
    }
}

/// Require a non-zero count.
pub fn require_nonzero(field: &str, value: usize) -> ValidationResult<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, "must be greater than zero"))
    }
}
