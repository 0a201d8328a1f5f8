//! Selective-sync policy
//!
//! Decides which entity types a run may replay. The policy is persisted
//! through the same [`KeyValueStore`] as the queue so a restart keeps the
//! user's choices.

use crate::options::SyncOptions;
use outbox_config::PolicyConfig;
use outbox_types::{EntityType, Error, KeyValueStore, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Store key the policy is persisted under
pub const POLICY_KEY: &str = "policy/selective-sync";

/// Rule for one entity type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRule {
    /// Whether the type syncs
    pub enabled: bool,
    /// Required types can never be disabled
    #[serde(default)]
    pub required: bool,
    /// Types that must be syncable for this one to sync
    #[serde(default)]
    pub depends_on: BTreeSet<EntityType>,
}

/// Transfer options imposed on every run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Compress outgoing payloads
    pub compress: bool,
    /// Cap on operations per run
    pub max_batch_size: Option<usize>,
}

/// Persisted policy state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    /// Global switch
    pub enabled: bool,
    /// Whether types without a rule sync
    pub default_enabled: bool,
    /// Per-type rules
    #[serde(default)]
    pub rules: BTreeMap<EntityType, EntityRule>,
    /// Transfer options
    #[serde(default)]
    pub transfer: TransferOptions,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for PolicyState {
    fn from(config: &PolicyConfig) -> Self {
        let mut rules: BTreeMap<EntityType, EntityRule> = BTreeMap::new();
        let default_enabled = config.default_enabled;

        for name in &config.required {
            rules.entry(EntityType::new(name.as_str())).or_default().required = true;
        }
        for name in &config.disabled {
            rules.entry(EntityType::new(name.as_str())).or_default();
        }
        for (name, deps) in &config.dependencies {
            rules
                .entry(EntityType::new(name.as_str()))
                .or_default()
                .depends_on
                .extend(deps.iter().map(|dep| EntityType::new(dep.as_str())));
        }
        for (entity_type, rule) in &mut rules {
            rule.enabled = rule.required
                || (default_enabled && !config.disabled.iter().any(|d| d == entity_type.as_str()));
        }

        Self {
            enabled: config.enabled,
            default_enabled,
            rules,
            transfer: TransferOptions {
                compress: config.compress,
                max_batch_size: config.max_batch_size,
            },
        }
    }
}

impl PolicyState {
    fn is_enabled(&self, entity_type: &EntityType) -> bool {
        self.rules
            .get(entity_type)
            .map_or(self.default_enabled, |rule| rule.enabled)
    }

    fn is_syncable(&self, entity_type: &EntityType, visiting: &mut BTreeSet<EntityType>) -> bool {
        if !self.is_enabled(entity_type) {
            return false;
        }
        // A type already on the path is assumed syncable so cycles terminate
        if !visiting.insert(entity_type.clone()) {
            return true;
        }
        let syncable = self.rules.get(entity_type).map_or(true, |rule| {
            rule.depends_on
                .iter()
                .all(|dep| self.is_syncable(dep, visiting))
        });
        visiting.remove(entity_type);
        syncable
    }
}

/// Selective-sync policy with optional persistence
pub struct SelectiveSyncPolicy {
    store: Option<Arc<dyn KeyValueStore>>,
    state: RwLock<PolicyState>,
}

impl SelectiveSyncPolicy {
    /// In-memory policy
    pub fn new(state: PolicyState) -> Self {
        Self {
            store: None,
            state: RwLock::new(state),
        }
    }

    /// Load the persisted policy, falling back to `initial` when none exists
    pub fn load(store: Arc<dyn KeyValueStore>, initial: PolicyState) -> Result<Self> {
        let state = match store.load(POLICY_KEY)? {
            Some(bytes) => {
                debug!("Loaded persisted selective-sync policy");
                serde_json::from_slice(&bytes)?
            }
            None => initial,
        };
        Ok(Self {
            store: Some(store),
            state: RwLock::new(state),
        })
    }

    /// Current state
    pub async fn snapshot(&self) -> PolicyState {
        self.state.read().await.clone()
    }

    /// Whether sync is globally enabled
    pub async fn is_enabled(&self) -> bool {
        self.state.read().await.enabled
    }

    /// Whether operations on `entity_type` may be replayed: the type is
    /// enabled and every type it depends on is syncable
    pub async fn is_syncable(&self, entity_type: &EntityType) -> bool {
        let state = self.state.read().await;
        state.is_syncable(entity_type, &mut BTreeSet::new())
    }

    /// Flip the global switch
    pub async fn set_global(&self, enabled: bool) -> Result<()> {
        self.modify(|state| {
            state.enabled = enabled;
            Ok(())
        })
        .await?;
        info!("Sync globally {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Enable an entity type
    pub async fn enable(&self, entity_type: impl Into<EntityType>) -> Result<()> {
        let entity_type = entity_type.into();
        self.modify(|state| {
            state.rules.entry(entity_type.clone()).or_default().enabled = true;
            Ok(())
        })
        .await?;
        info!("Enabled sync for {}", entity_type);
        Ok(())
    }

    /// Disable an entity type; fails for required types
    pub async fn disable(&self, entity_type: impl Into<EntityType>) -> Result<()> {
        let entity_type = entity_type.into();
        self.modify(|state| {
            let rule = state.rules.entry(entity_type.clone()).or_default();
            if rule.required {
                return Err(Error::EntityTypeRequired {
                    entity_type: entity_type.to_string(),
                });
            }
            rule.enabled = false;
            Ok(())
        })
        .await?;
        info!("Disabled sync for {}", entity_type);
        Ok(())
    }

    /// Mark an entity type required, which also enables it
    pub async fn require(&self, entity_type: impl Into<EntityType>) -> Result<()> {
        let entity_type = entity_type.into();
        self.modify(|state| {
            let rule = state.rules.entry(entity_type).or_default();
            rule.required = true;
            rule.enabled = true;
            Ok(())
        })
        .await
    }

    /// Declare that `entity_type` only syncs when `dependency` does
    pub async fn add_dependency(
        &self,
        entity_type: impl Into<EntityType>,
        dependency: impl Into<EntityType>,
    ) -> Result<()> {
        let entity_type = entity_type.into();
        let dependency = dependency.into();
        self.modify(|state| {
            let default_enabled = state.default_enabled;
            let rule = state.rules.entry(entity_type).or_insert_with(|| EntityRule {
                enabled: default_enabled,
                ..EntityRule::default()
            });
            rule.depends_on.insert(dependency);
            Ok(())
        })
        .await
    }

    /// Replace the transfer options
    pub async fn set_transfer_options(&self, transfer: TransferOptions) -> Result<()> {
        self.modify(|state| {
            state.transfer = transfer;
            Ok(())
        })
        .await
    }

    /// Fold the policy into run options.
    ///
    /// Types with a rule that are not syncable are excluded. When types
    /// without a rule do not sync, the run is restricted to the syncable
    /// declared types. Fails with [`Error::SyncDisabled`] when sync is off.
    pub async fn apply_to(&self, mut options: SyncOptions) -> Result<SyncOptions> {
        let state = self.state.read().await;
        if !state.enabled {
            return Err(Error::SyncDisabled);
        }

        let mut syncable = BTreeSet::new();
        for entity_type in state.rules.keys() {
            if state.is_syncable(entity_type, &mut BTreeSet::new()) {
                syncable.insert(entity_type.clone());
            } else {
                options.excluded_entity_types.insert(entity_type.clone());
            }
        }

        if !state.default_enabled {
            options.only_entity_types = Some(match options.only_entity_types.take() {
                Some(only) => only.intersection(&syncable).cloned().collect(),
                None => syncable,
            });
        }

        options.max_operations = match (options.max_operations, state.transfer.max_batch_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        options.compress |= state.transfer.compress;
        Ok(options)
    }

    /// Apply `change` to a copy, persist it, then publish it
    async fn modify(&self, change: impl FnOnce(&mut PolicyState) -> Result<()>) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        change(&mut next)?;

        if let Some(store) = &self.store {
            store.save(POLICY_KEY, &serde_json::to_vec(&next)?)?;
        }
        *state = next;
        Ok(())
    }
}

impl std::fmt::Debug for SelectiveSyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectiveSyncPolicy")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_queue::MemoryStore;

    fn entity(name: &str) -> EntityType {
        EntityType::new(name)
    }

    #[tokio::test]
    async fn test_required_type_cannot_be_disabled() {
        let policy = SelectiveSyncPolicy::new(PolicyState::default());

        let err = policy.disable("settings").await.unwrap_err();
        assert_eq!(
            err,
            Error::EntityTypeRequired {
                entity_type: "settings".to_string()
            }
        );
        assert!(policy.is_syncable(&entity("settings")).await);
    }

    #[tokio::test]
    async fn test_dependency_gates_sync() {
        let policy = SelectiveSyncPolicy::new(PolicyState::default());
        policy.add_dependency("comment", "task").await.unwrap();

        assert!(policy.is_syncable(&entity("comment")).await);
        policy.disable("task").await.unwrap();
        assert!(!policy.is_syncable(&entity("comment")).await);

        let options = policy.apply_to(SyncOptions::new()).await.unwrap();
        assert!(!options.allows(&entity("comment")));
        assert!(!options.allows(&entity("task")));
        assert!(options.allows(&entity("note")));
    }

    #[tokio::test]
    async fn test_dependency_cycle_terminates() {
        let policy = SelectiveSyncPolicy::new(PolicyState::default());
        policy.add_dependency("a", "b").await.unwrap();
        policy.add_dependency("b", "a").await.unwrap();

        assert!(policy.is_syncable(&entity("a")).await);
        policy.disable("b").await.unwrap();
        assert!(!policy.is_syncable(&entity("a")).await);
    }

    #[tokio::test]
    async fn test_globally_disabled() {
        let policy = SelectiveSyncPolicy::new(PolicyState::default());
        policy.set_global(false).await.unwrap();

        assert_eq!(
            policy.apply_to(SyncOptions::new()).await.unwrap_err(),
            Error::SyncDisabled
        );
    }

    #[tokio::test]
    async fn test_default_disabled_restricts_to_declared_types() {
        let config = PolicyConfig {
            default_enabled: false,
            max_batch_size: Some(10),
            compress: true,
            ..PolicyConfig::default()
        };
        let policy = SelectiveSyncPolicy::new(PolicyState::from(&config));
        policy.enable("task").await.unwrap();

        let options = policy
            .apply_to(SyncOptions::new().with_max_operations(50))
            .await
            .unwrap();
        assert!(options.allows(&entity("task")));
        assert!(options.allows(&entity("settings")));
        assert!(!options.allows(&entity("note")));
        assert_eq!(options.max_operations, Some(10));
        assert!(options.compress);
    }

    #[tokio::test]
    async fn test_policy_persists() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let policy = SelectiveSyncPolicy::load(store.clone(), PolicyState::default()).unwrap();
            policy.disable("note").await.unwrap();
            policy.set_global(false).await.unwrap();
        }

        let policy = SelectiveSyncPolicy::load(store, PolicyState::default()).unwrap();
        assert!(!policy.is_enabled().await);
        assert!(!policy.is_syncable(&entity("note")).await);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_policy_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let policy = SelectiveSyncPolicy::load(store.clone(), PolicyState::default()).unwrap();
        store.set_fail_writes(true);

        assert!(policy.disable("note").await.is_err());
        assert!(policy.is_syncable(&entity("note")).await);
    }
}
