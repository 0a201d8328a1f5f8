//! Command implementations
//!
//! Each command works on the durable state under `storage.data_dir` and
//! returns a serializable report; rendering lives in `main.rs`.

use crate::json_output::{
    CapabilityJson, ChangeJson, OperationJson, PlanStepJson, PolicyJson, QueueJson,
};
use anyhow::{bail, Context, Result};
use outbox_config::{Config, ConfigLoader};
use outbox_device::{CapabilityMonitor, CapabilitySignals, MonitorConfig, SystemProbe};
use outbox_queue::{dependency_order, FileStore, OperationQueue};
use outbox_sync::{PolicyState, SelectiveSyncPolicy};
use outbox_types::{EntityType, KeyValueStore, NetworkQuality, NetworkType, OperationId};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable state of one device
pub struct Workspace {
    queue: OperationQueue,
    policy: SelectiveSyncPolicy,
}

impl Workspace {
    /// Open the queue and policy stored under `config.storage.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let data_dir = &config.storage.data_dir;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(data_dir)
                .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?,
        );
        let queue = OperationQueue::open(store.clone()).context("Failed to load the queue")?;
        let policy = SelectiveSyncPolicy::load(store, PolicyState::from(&config.policy))
            .context("Failed to load the selective-sync policy")?;
        debug!("Opened workspace at {}", data_dir.display());
        Ok(Self { queue, policy })
    }

    /// Buffered operations in enqueue order
    pub async fn queue_list(&self) -> QueueJson {
        let operations: Vec<OperationJson> =
            self.queue.list().await.iter().map(OperationJson::from).collect();
        QueueJson {
            length: operations.len(),
            operations,
        }
    }

    /// Discard one operation
    pub async fn queue_remove(&self, id: OperationId) -> Result<ChangeJson> {
        let removed = self.queue.remove(id).await?;
        let message = if removed {
            info!("Removed operation {}", id);
            format!("Removed operation #{}", id)
        } else {
            format!("Operation #{} is not queued", id)
        };
        Ok(ChangeJson {
            changed: removed,
            count: usize::from(removed),
            message,
        })
    }

    /// Discard every operation
    pub async fn queue_clear(&self) -> Result<ChangeJson> {
        let count = self.queue.clear().await?;
        let message = if count == 0 {
            "Queue already empty".to_string()
        } else {
            info!("Cleared {} operations", count);
            format!("Discarded {} operations", count)
        };
        Ok(ChangeJson {
            changed: count > 0,
            count,
            message,
        })
    }

    /// Order the queue would be replayed in
    pub async fn queue_plan(&self) -> Vec<PlanStepJson> {
        let mut steps = Vec::new();
        for (index, op) in dependency_order(&self.queue.list().await).iter().enumerate() {
            steps.push(PlanStepJson {
                position: index + 1,
                operation: OperationJson::from(op),
                syncable: self.policy.is_syncable(&op.entity_type).await,
            });
        }
        steps
    }

    /// Policy with the effective decision for every declared type
    pub async fn policy_show(&self) -> PolicyJson {
        let policy = self.policy.snapshot().await;
        let mut syncable = BTreeMap::new();
        for entity_type in policy.rules.keys() {
            syncable.insert(
                entity_type.to_string(),
                self.policy.is_syncable(entity_type).await,
            );
        }
        PolicyJson { policy, syncable }
    }

    /// Enable an entity type
    pub async fn policy_enable(&self, entity_type: &str) -> Result<PolicyJson> {
        self.policy.enable(EntityType::new(entity_type)).await?;
        Ok(self.policy_show().await)
    }

    /// Disable an entity type; required types are refused
    pub async fn policy_disable(&self, entity_type: &str) -> Result<PolicyJson> {
        self.policy.disable(EntityType::new(entity_type)).await?;
        Ok(self.policy_show().await)
    }

    /// Flip the global switch
    pub async fn policy_global(&self, enabled: bool) -> Result<PolicyJson> {
        self.policy.set_global(enabled).await?;
        Ok(self.policy_show().await)
    }
}

/// Host signals supplied on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalArgs {
    /// Battery charge in `0.0..=1.0`
    pub battery: Option<f32>,
    /// Battery is charging
    pub charging: bool,
    /// Network link
    pub network: Option<NetworkType>,
    /// Network quality
    pub quality: Option<NetworkQuality>,
}

/// Sample this host and derive tier and strategy
pub async fn device_report(config: &Config, args: SignalArgs) -> CapabilityJson {
    let signals = CapabilitySignals::new();
    signals.set_battery(args.battery, args.charging).await;
    if let Some(network_type) = args.network {
        let online = network_type != NetworkType::None;
        let quality = args.quality.unwrap_or(if online {
            NetworkQuality::Good
        } else {
            NetworkQuality::Offline
        });
        signals.set_network(online, network_type, quality).await;
    }

    let monitor = CapabilityMonitor::new(
        Arc::new(SystemProbe::new(signals)),
        MonitorConfig {
            sample_interval: config.capability.sample_interval(),
            ttl: config.capability.cache_ttl(),
        },
    );
    let state = monitor.refresh().await;
    CapabilityJson {
        snapshot: state.snapshot,
        tier: state.tier,
        strategy: state.strategy,
    }
}

/// Write a default configuration file
pub fn config_init(path: &Path, force: bool) -> Result<ChangeJson> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ConfigLoader::generate_default_config(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(ChangeJson {
        changed: true,
        count: 1,
        message: format!("Wrote default configuration to {}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_types::NewOperation;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config
    }

    async fn seed(config: &Config) -> (OperationId, OperationId) {
        let workspace = Workspace::open(config).unwrap();
        let create = workspace
            .queue
            .enqueue(NewOperation::create("createTask", "task", json!({"title": "a"})))
            .await
            .unwrap();
        let update = workspace
            .queue
            .enqueue(
                NewOperation::update("updateTask", "task", "t-1", json!({"done": true}))
                    .depends_on(create),
            )
            .await
            .unwrap();
        (create, update)
    }

    #[tokio::test]
    async fn test_queue_commands_work_on_persisted_state() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let (create, update) = seed(&config).await;

        let workspace = Workspace::open(&config).unwrap();
        let listing = workspace.queue_list().await;
        assert_eq!(listing.length, 2);
        assert_eq!(listing.operations[0].id, create);

        let plan = workspace.queue_plan().await;
        let order: Vec<_> = plan.iter().map(|step| step.operation.id).collect();
        assert_eq!(order, vec![create, update]);
        assert!(plan.iter().all(|step| step.syncable));

        assert!(workspace.queue_remove(create).await.unwrap().changed);
        assert!(!workspace.queue_remove(create).await.unwrap().changed);

        let cleared = workspace.queue_clear().await.unwrap();
        assert_eq!(cleared.count, 1);
        assert!(!workspace.queue_clear().await.unwrap().changed);

        let reopened = Workspace::open(&config).unwrap();
        assert_eq!(reopened.queue_list().await.length, 0);
    }

    #[tokio::test]
    async fn test_policy_commands() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed(&config).await;
        let workspace = Workspace::open(&config).unwrap();

        let shown = workspace.policy_disable("task").await.unwrap();
        assert_eq!(shown.syncable.get("task"), Some(&false));
        assert!(workspace.queue_plan().await.iter().all(|step| !step.syncable));

        assert!(workspace.policy_disable("settings").await.is_err());

        let shown = workspace.policy_global(false).await.unwrap();
        assert!(!shown.policy.enabled);

        let reopened = Workspace::open(&config).unwrap();
        let shown = reopened.policy_enable("task").await.unwrap();
        assert!(!shown.policy.enabled);
        assert_eq!(shown.syncable.get("task"), Some(&true));
    }

    #[tokio::test]
    async fn test_device_report_uses_signals() {
        let report = device_report(
            &Config::default(),
            SignalArgs {
                battery: Some(0.1),
                charging: false,
                network: Some(NetworkType::Cellular),
                quality: Some(NetworkQuality::Poor),
            },
        )
        .await;

        assert!(report.snapshot.online);
        assert_eq!(report.snapshot.network_type, NetworkType::Cellular);
        assert!(!report.strategy.features.background_sync);
        assert!(report.strategy.features.compression);
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.yaml");

        assert!(config_init(&path, false).unwrap().changed);
        assert!(config_init(&path, false).is_err());
        assert!(config_init(&path, true).is_ok());
        assert!(ConfigLoader::load_from_file(&path).is_ok());
    }
}
