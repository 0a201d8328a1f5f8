//! Core type system and error handling for outbox
//!
//! This crate provides the foundational types shared by every outbox crate:
//!
//! - **Error handling**: [`Error`] with kinds, severity levels and retry hints
//! - **Operations**: buffered mutations with typed parameters
//! - **Backend failures**: structured [`BackendError`] values
//! - **Capabilities**: device snapshots, tiers and adaptation strategies
//! - **Traits**: the backend and key-value persistence boundaries
//!
//! # Examples
//!
//! ```rust
//! use outbox_types::{NewOperation, OperationKind};
//! use serde_json::json;
//!
//! let op = NewOperation::update("tasks.update", "task", "t-1", json!({"done": true}))
//!     .with_base_version(3);
//! assert_eq!(op.params.kind(), OperationKind::Update);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod capability;
pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use capability::{
    AdaptationStrategy, CapabilitySnapshot, CapabilityTier, DeviceCapabilities, FeatureToggles,
    NetworkQuality, NetworkType,
};
pub use config::{BackoffConfig, CompressionLevel};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use traits::*;
pub use types::*;
