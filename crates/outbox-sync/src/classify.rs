//! Failure classification
//!
//! Whether a failed replay is retried, discarded or routed to conflict
//! resolution is decided here from the backend's error code alone, never from
//! where in a run the failure happened.

use outbox_config::{ConfigResult, SyncConfig};
use outbox_types::{BackendError, BackendErrorCode, FailureClass};
use std::collections::HashMap;

/// Maps a backend failure to a [`FailureClass`]
pub trait FailureClassifier: Send + Sync {
    /// Classify a failure
    fn classify(&self, error: &BackendError) -> FailureClass;
}

/// Table-driven classifier with per-code overrides.
///
/// Defaults:
///
/// | Code | Class |
/// |------|-------|
/// | unreachable, timeout, rate_limited, unavailable | transient |
/// | validation, not_found, unauthorized, rejected | permanent |
/// | conflict | conflict |
/// | unknown | the configured fallback (transient unless overridden) |
#[derive(Debug, Clone)]
pub struct PolicyClassifier {
    table: HashMap<BackendErrorCode, FailureClass>,
    fallback: FailureClass,
}

impl PolicyClassifier {
    /// Classifier with the default table
    pub fn new() -> Self {
        use BackendErrorCode::*;

        let table = [
            (Unreachable, FailureClass::Transient),
            (Timeout, FailureClass::Transient),
            (RateLimited, FailureClass::Transient),
            (Unavailable, FailureClass::Transient),
            (Validation, FailureClass::Permanent),
            (NotFound, FailureClass::Permanent),
            (Unauthorized, FailureClass::Permanent),
            (Rejected, FailureClass::Permanent),
            (Conflict, FailureClass::Conflict),
        ]
        .into_iter()
        .collect();

        Self {
            table,
            fallback: FailureClass::Transient,
        }
    }

    /// Build from the `sync` configuration section
    pub fn from_config(config: &SyncConfig) -> ConfigResult<Self> {
        let mut classifier = Self::new().with_fallback(config.unknown_failure);
        for (code, class) in &config.failure_overrides {
            let code = outbox_config::builder::parse_error_code(code)?;
            classifier = classifier.with_override(code, *class);
        }
        Ok(classifier)
    }

    /// Override the class of one code
    pub fn with_override(mut self, code: BackendErrorCode, class: FailureClass) -> Self {
        if code == BackendErrorCode::Unknown {
            self.fallback = class;
        } else {
            self.table.insert(code, class);
        }
        self
    }

    /// Class for codes without an entry
    pub fn with_fallback(mut self, class: FailureClass) -> Self {
        self.fallback = class;
        self
    }
}

impl Default for PolicyClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier for PolicyClassifier {
    fn classify(&self, error: &BackendError) -> FailureClass {
        self.table
            .get(&error.code)
            .copied()
            .unwrap_or(self.fallback)
    }
}
