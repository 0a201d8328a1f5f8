//! Options for a single sync run

use outbox_types::{Cancellable, EntityType};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Shared cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Cancellable for CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one `synchronize` call
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Identifier to tag the run's events with; generated when unset
    pub run_id: Option<Uuid>,
    /// Cap on operations processed by this run
    pub max_operations: Option<usize>,
    /// When set, only these entity types are replayed
    pub only_entity_types: Option<BTreeSet<EntityType>>,
    /// Entity types never replayed by this run
    pub excluded_entity_types: BTreeSet<EntityType>,
    /// Compress outgoing payloads
    pub compress: bool,
    /// Per-run cancellation, checked between operations
    pub cancel: CancelFlag,
}

impl SyncOptions {
    /// Options with no filters
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the run with a known identifier
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Cap the number of operations processed
    pub fn with_max_operations(mut self, max: usize) -> Self {
        self.max_operations = Some(max);
        self
    }

    /// Only replay the given entity types
    pub fn only<I, T>(mut self, entity_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        self.only_entity_types = Some(entity_types.into_iter().map(Into::into).collect());
        self
    }

    /// Never replay the given entity type
    pub fn exclude(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.excluded_entity_types.insert(entity_type.into());
        self
    }

    /// Use the given cancellation flag
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether operations on `entity_type` may be replayed
    pub fn allows(&self, entity_type: &EntityType) -> bool {
        !self.excluded_entity_types.contains(entity_type)
            && self
                .only_entity_types
                .as_ref()
                .map_or(true, |only| only.contains(entity_type))
    }
}
