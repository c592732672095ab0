//! Admission gate for Cat resources
//!
//! Two capabilities run before a Cat is persisted:
//! - [`Defaulter`] fills unset spec fields with their defaults
//! - [`Validator`] rejects specs the reconciler could not act on
//!
//! The reconciler relies on `duration`, `message` and `totalLives` being set
//! for every Cat that passed this gate.

pub mod webhook;

use kube::ResourceExt;
use thiserror::Error;
use tracing::info;

use crate::cat::{Cat, DEFAULT_DURATION, DEFAULT_MESSAGE, DEFAULT_TOTAL_LIVES, GROUP, KIND};
use crate::duration;

/// Fills unset fields before the object is persisted
pub trait Defaulter {
    fn apply_defaults(&mut self);
}

/// Accepts or rejects an object on create, update and delete
pub trait Validator {
    /// # Errors
    /// Returns the aggregated field errors if the object is invalid.
    fn validate_create(&self) -> Result<(), ValidationError>;

    /// # Errors
    /// Returns the aggregated field errors if the new object is invalid.
    fn validate_update(&self, old: &Self) -> Result<(), ValidationError>;

    /// # Errors
    /// Returns an error if deletion must be blocked.
    fn validate_delete(&self) -> Result<(), ValidationError>;
}

/// What is wrong with a single field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldErrorKind {
    /// The field is set to a value that cannot be accepted
    #[error("Invalid value: {value:?}: {detail}")]
    Invalid { value: String, detail: String },
    /// The field must be set
    #[error("Required value")]
    Required,
}

/// Error scoped to one field path, e.g. `spec.duration`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {kind}")]
pub struct FieldError {
    pub path: String,
    pub kind: FieldErrorKind,
}

impl FieldError {
    pub fn invalid(path: &str, value: &str, detail: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: FieldErrorKind::Invalid {
                value: value.to_string(),
                detail: detail.to_string(),
            },
        }
    }

    pub fn required(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: FieldErrorKind::Required,
        }
    }
}

/// Rejection of a whole object, rendered like the API server's Invalid status
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}.{group} {name:?} is invalid: {}", render(.errors), kind = KIND, group = GROUP)]
pub struct ValidationError {
    pub name: String,
    pub errors: Vec<FieldError>,
}

fn render(errors: &[FieldError]) -> String {
    match errors {
        [single] => single.to_string(),
        many => {
            let joined: Vec<String> = many.iter().map(ToString::to_string).collect();
            format!("[{}]", joined.join(", "))
        }
    }
}

impl ValidationError {
    /// Field paths that failed, in order
    pub fn paths(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.path.as_str()).collect()
    }
}

impl Defaulter for Cat {
    fn apply_defaults(&mut self) {
        info!(name = %self.name_any(), "default");

        if self.spec.duration.is_none() {
            self.spec.duration = Some(DEFAULT_DURATION.to_string());
        }
        if self.spec.message.is_none() {
            self.spec.message = Some(DEFAULT_MESSAGE.to_string());
        }
        if self.spec.total_lives.is_none() {
            self.spec.total_lives = Some(DEFAULT_TOTAL_LIVES);
        }
    }
}

impl Validator for Cat {
    fn validate_create(&self) -> Result<(), ValidationError> {
        info!(name = %self.name_any(), "validate create");
        validate_cat(self)
    }

    fn validate_update(&self, _old: &Self) -> Result<(), ValidationError> {
        info!(name = %self.name_any(), "validate update");
        validate_cat(self)
    }

    fn validate_delete(&self) -> Result<(), ValidationError> {
        info!(name = %self.name_any(), "validate delete");
        Ok(())
    }
}

fn validate_cat(cat: &Cat) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if let Some(err) = validate_duration(cat.spec.duration.as_deref(), "spec.duration") {
        errors.push(err);
    }

    if errors.is_empty() {
        return Ok(());
    }

    Err(ValidationError {
        name: cat.name_any(),
        errors,
    })
}

fn validate_duration(value: Option<&str>, path: &str) -> Option<FieldError> {
    match value {
        None => Some(FieldError::required(path)),
        Some(raw) => duration::parse(raw)
            .err()
            .map(|_| FieldError::invalid(path, raw, "invalid duration value")),
    }
}
