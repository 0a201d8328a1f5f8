//! Error types and handling for outbox
//!
//! Every fallible engine call returns [`Error`]. Failures reported by the remote
//! backend during a sync run are *not* errors of this type: they are carried as
//! [`BackendError`](crate::BackendError) values, classified, and folded into the
//! run's result.

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - durable state may be inconsistent
    Critical,
}

/// Main error type for outbox operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Durable storage failed to load or persist
    #[error("Storage error: {message}")]
    Storage {
        /// Error message from the storage layer
        message: String,
    },

    /// Persisted or wire data could not be encoded or decoded
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message from the codec
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Network error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// A backend call failed outside of a sync run
    #[error("Backend error: {message}")]
    Backend {
        /// Error message returned by the backend
        message: String,
    },

    /// Synchronization error
    #[error("Synchronization error: {message}")]
    Sync {
        /// Error message describing the synchronization issue
        message: String,
    },

    /// A sync run is already active
    #[error("A synchronization run is already in progress")]
    SyncInProgress,

    /// Global sync is switched off by the selective-sync policy
    #[error("Synchronization is disabled by policy")]
    SyncDisabled,

    /// Attempt to disable an entity type that must always sync
    #[error("Entity type '{entity_type}' is required and cannot be disabled")]
    EntityTypeRequired {
        /// The entity type
        entity_type: String,
    },

    /// Device is not registered with the session manager
    #[error("Unknown device: {device_id}")]
    UnknownDevice {
        /// Identifier of the missing device
        device_id: String,
    },

    /// Session does not exist
    #[error("Unknown session: {session_id}")]
    UnknownSession {
        /// Identifier of the missing session
        session_id: String,
    },

    /// State machine transition not allowed
    #[error("Invalid state: {message}")]
    InvalidState {
        /// What was attempted
        message: String,
    },

    /// Operation identifier already present in the queue
    #[error("Operation {id} is already queued")]
    DuplicateOperation {
        /// The clashing identifier
        id: u64,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Storage related errors
    Storage,
    /// Encoding and decoding errors
    Serialization,
    /// Configuration errors
    Config,
    /// Network errors
    Network,
    /// Backend errors
    Backend,
    /// Synchronization errors, including run-guard rejections
    Sync,
    /// Policy rejections
    Policy,
    /// Session and device lookup errors
    Session,
    /// Invalid caller input or transitions
    InvalidInput,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Config { .. } => ErrorKind::Config,
            Self::Network { .. } => ErrorKind::Network,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Sync { .. } | Self::SyncInProgress => ErrorKind::Sync,
            Self::SyncDisabled | Self::EntityTypeRequired { .. } => ErrorKind::Policy,
            Self::UnknownDevice { .. } | Self::UnknownSession { .. } => ErrorKind::Session,
            Self::InvalidState { .. } | Self::DuplicateOperation { .. } => ErrorKind::InvalidInput,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Storage { .. } | Self::Serialization { .. } => ErrorSeverity::Critical,
            Self::Config { .. } => ErrorSeverity::High,
            Self::Network { .. } | Self::Backend { .. } => ErrorSeverity::Medium,
            Self::Sync { .. } => ErrorSeverity::Medium,
            Self::SyncInProgress | Self::Cancelled => ErrorSeverity::Low,
            Self::SyncDisabled | Self::EntityTypeRequired { .. } => ErrorSeverity::Low,
            Self::UnknownDevice { .. }
            | Self::UnknownSession { .. }
            | Self::InvalidState { .. }
            | Self::DuplicateOperation { .. } => ErrorSeverity::High,
            Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Backend { .. }
            | Self::Timeout { .. }
            | Self::SyncInProgress
            | Self::Sync { .. } => true,
            Self::Storage { message } => {
                message.contains("Interrupted") || message.contains("WouldBlock")
            }
            Self::Serialization { .. }
            | Self::Config { .. }
            | Self::SyncDisabled
            | Self::EntityTypeRequired { .. }
            | Self::UnknownDevice { .. }
            | Self::UnknownSession { .. }
            | Self::InvalidState { .. }
            | Self::DuplicateOperation { .. }
            | Self::Cancelled => false,
            Self::Other { .. } => true,
        }
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && self.severity() <= ErrorSeverity::Medium
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync<S: Into<String>>(message: S) -> Self {
        Self::Sync {
            message: message.into(),
        }
    }

    /// Create a new invalid-state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Storage {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}
