//! Background scheduling
//!
//! The scheduler decides *when* the coordinator runs. Every decision goes
//! through [`plan`], a pure function of the strategy, the trigger and a
//! [`SchedulingContext`]; [`BackgroundScheduler`] turns the resulting [`Plan`]
//! into at most one armed [`ScheduledTask`].
//!
//! A timer is never armed while the device is offline or the queue is
//! empty. Connectivity, foreground and startup signals re-plan immediately,
//! bypassing whatever timer is pending.
//!
//! A finished run only chains straight into the next one when it made
//! progress and left work it can still attempt. Runs that failed, or that
//! only skipped operations, hand over to a timer instead.

use crate::task::ScheduledTask;
use async_trait::async_trait;
use outbox_config::StrategyConfig;
use outbox_device::CapabilityMonitor;
use outbox_queue::OperationQueue;
use outbox_sync::{SyncCoordinator, SyncResult};
use outbox_types::{
    AdaptationStrategy, BackoffConfig, CapabilitySnapshot, Error, NetworkType, Result,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Caller-supplied readiness check for [`ScheduleStrategy::Custom`]
pub type SchedulePredicate = Arc<dyn Fn(&SchedulingContext) -> bool + Send + Sync>;

type FireFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Retry delays of the event-driven strategies grow to this multiple of
/// their base interval
const RETRY_CAP_FACTOR: u32 = 32;

/// When background runs happen
#[derive(Clone)]
pub enum ScheduleStrategy {
    /// Run on every queue change while items are pending
    Immediate,
    /// Run on a fixed interval, never faster than the tier's polling interval
    Periodic {
        /// Interval between runs
        interval: Duration,
    },
    /// Delay `min(base * 2^failures, cap)`, reset by a successful run
    ExponentialBackoff(BackoffConfig),
    /// Run when the host reports idle time
    Idle {
        /// Upper bound on the wait, and the interval used without an idle hook
        fallback: Duration,
    },
    /// Run only with enough power and, optionally, a specific network
    OptimalConditions {
        /// Minimum battery level unless charging
        battery_threshold: f32,
        /// Network type that must be active
        required_network: Option<NetworkType>,
        /// How often unmet conditions are re-checked
        check_interval: Duration,
    },
    /// Run once the queue holds at least `threshold` operations
    QueueThreshold {
        /// Minimum queue length
        threshold: usize,
    },
    /// Poll a caller predicate
    Custom {
        /// Readiness check
        predicate: SchedulePredicate,
        /// Polling interval while the predicate is false
        interval: Duration,
    },
}

impl ScheduleStrategy {
    /// Build a strategy from configuration
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let strategy = match config {
            StrategyConfig::Immediate => Self::Immediate,
            StrategyConfig::Periodic { interval_secs } => Self::Periodic {
                interval: Duration::from_secs(*interval_secs),
            },
            StrategyConfig::ExponentialBackoff { base_secs, cap_secs } => {
                let backoff = BackoffConfig::new(
                    Duration::from_secs(*base_secs),
                    Duration::from_secs(*cap_secs),
                )
                .map_err(Error::config)?;
                Self::ExponentialBackoff(backoff)
            }
            StrategyConfig::Idle { fallback_secs } => Self::Idle {
                fallback: Duration::from_secs(*fallback_secs),
            },
            StrategyConfig::OptimalConditions {
                battery_threshold,
                required_network,
                check_interval_secs,
            } => Self::OptimalConditions {
                battery_threshold: *battery_threshold,
                required_network: *required_network,
                check_interval: Duration::from_secs(*check_interval_secs),
            },
            StrategyConfig::QueueThreshold { threshold } => Self::QueueThreshold {
                threshold: *threshold,
            },
        };
        Ok(strategy)
    }

    /// Custom strategy polling `predicate` every `interval`
    pub fn custom<F>(interval: Duration, predicate: F) -> Self
    where
        F: Fn(&SchedulingContext) -> bool + Send + Sync + 'static,
    {
        Self::Custom {
            predicate: Arc::new(predicate),
            interval,
        }
    }

    /// Short name for logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Periodic { .. } => "periodic",
            Self::ExponentialBackoff(_) => "exponential_backoff",
            Self::Idle { .. } => "idle",
            Self::OptimalConditions { .. } => "optimal_conditions",
            Self::QueueThreshold { .. } => "queue_threshold",
            Self::Custom { .. } => "custom",
        }
    }
}

impl Default for ScheduleStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff(BackoffConfig {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        })
    }
}

impl fmt::Debug for ScheduleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Periodic { interval } => {
                f.debug_struct("Periodic").field("interval", interval).finish()
            }
            Self::ExponentialBackoff(backoff) => {
                f.debug_tuple("ExponentialBackoff").field(backoff).finish()
            }
            Self::Idle { fallback } => f.debug_struct("Idle").field("fallback", fallback).finish(),
            Self::OptimalConditions {
                battery_threshold,
                required_network,
                check_interval,
            } => f
                .debug_struct("OptimalConditions")
                .field("battery_threshold", battery_threshold)
                .field("required_network", required_network)
                .field("check_interval", check_interval)
                .finish(),
            Self::QueueThreshold { threshold } => f
                .debug_struct("QueueThreshold")
                .field("threshold", threshold)
                .finish(),
            Self::Custom { interval, .. } => f
                .debug_struct("Custom")
                .field("interval", interval)
                .finish_non_exhaustive(),
        }
    }
}

/// Why scheduling is being re-evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Explicit request to recompute the schedule
    Reschedule,
    /// Queue length changed
    QueueChanged,
    /// A scheduled run finished
    RunFinished,
    /// Capability tier or strategy changed
    CapabilityChanged,
    /// The armed timer fired
    TimerFired,
    /// Device came back online
    ConnectivityRestored,
    /// App returned to the foreground
    Foregrounded,
    /// App started
    Startup,
}

impl Trigger {
    /// Triggers that run right away instead of waiting for a timer
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            Self::TimerFired | Self::ConnectivityRestored | Self::Foregrounded | Self::Startup
        )
    }
}

/// Inputs to a scheduling decision
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    /// Device connectivity
    pub online: bool,
    /// App is in the foreground
    pub foreground: bool,
    /// Pending operations
    pub queue_len: usize,
    /// Latest capability sample
    pub snapshot: CapabilitySnapshot,
    /// Strategy for the current tier
    pub adaptation: AdaptationStrategy,
    /// Failed scheduled runs since the last success
    pub consecutive_failures: u32,
    /// The last run made progress and left operations it can still attempt
    pub continue_draining: bool,
    /// An idle hook is installed
    pub idle_hook: bool,
}

/// Outcome of a scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Run now
    Run,
    /// Arm the timer
    RunAfter(Duration),
    /// Wait for idle time, at most the given duration
    RunWhenIdle(Duration),
    /// Arm nothing
    Wait,
}

/// Decide what to do for `trigger`
pub fn plan(strategy: &ScheduleStrategy, trigger: Trigger, ctx: &SchedulingContext) -> Plan {
    if !ctx.online || ctx.queue_len == 0 {
        return Plan::Wait;
    }

    // Gates hold even against signals
    match strategy {
        ScheduleStrategy::OptimalConditions {
            battery_threshold,
            required_network,
            check_interval,
        } => {
            let powered = ctx.snapshot.has_power(*battery_threshold);
            let network = required_network.map_or(true, |required| ctx.snapshot.network_type == required);
            if !(powered && network) {
                return Plan::RunAfter(*check_interval);
            }
        }
        ScheduleStrategy::QueueThreshold { threshold } if ctx.queue_len < *threshold => {
            return Plan::Wait;
        }
        ScheduleStrategy::Custom { predicate, interval } if !predicate(ctx) => {
            return Plan::RunAfter(*interval);
        }
        _ => {}
    }

    if trigger.is_immediate() {
        return Plan::Run;
    }

    if !ctx.foreground && !ctx.adaptation.features.background_sync {
        return Plan::Wait;
    }

    // A stalled or failing queue is retried on a timer, not chained
    let hold = match trigger {
        Trigger::RunFinished => !ctx.continue_draining,
        _ => ctx.consecutive_failures > 0,
    };
    let run_or_retry = |base: Duration| {
        if hold {
            Plan::RunAfter(retry_delay(base, ctx.consecutive_failures))
        } else {
            Plan::Run
        }
    };

    let polling = ctx.adaptation.polling_interval;
    match strategy {
        ScheduleStrategy::Immediate | ScheduleStrategy::QueueThreshold { .. } => {
            run_or_retry(polling)
        }
        ScheduleStrategy::OptimalConditions { check_interval, .. } => {
            run_or_retry((*check_interval).max(polling))
        }
        ScheduleStrategy::Custom { interval, .. } => run_or_retry(*interval),
        ScheduleStrategy::Periodic { interval } => Plan::RunAfter((*interval).max(polling)),
        ScheduleStrategy::ExponentialBackoff(backoff) => {
            Plan::RunAfter(backoff.delay_for_attempt(ctx.consecutive_failures))
        }
        ScheduleStrategy::Idle { fallback } => {
            if ctx.idle_hook {
                Plan::RunWhenIdle(*fallback)
            } else {
                Plan::RunAfter(*fallback)
            }
        }
    }
}

/// `base` after a stall, doubling per consecutive failure
fn retry_delay(base: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return base;
    }
    BackoffConfig {
        base,
        cap: base.saturating_mul(RETRY_CAP_FACTOR),
    }
    .delay_for_attempt(failures - 1)
}

/// What a run achieved, as far as scheduling cares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// No failures and no process-level error
    pub success: bool,
    /// At least one operation left the queue
    pub progressed: bool,
    /// Queued operations the run neither attempted nor skipped
    pub pending: usize,
}

impl RunReport {
    /// Whether another run could make headway right away
    pub fn can_continue(&self) -> bool {
        self.success && self.progressed && self.pending > 0
    }
}

impl From<&SyncResult> for RunReport {
    fn from(result: &SyncResult) -> Self {
        let discarded = result.failed_operations.iter().any(|f| f.discarded);
        Self {
            success: result.success,
            progressed: result.completed > 0 || discarded,
            pending: result.remaining.saturating_sub(result.skipped.len()),
        }
    }
}

/// Something that performs a sync run
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// Run once
    async fn run_sync(&self) -> Result<RunReport>;
}

#[async_trait]
impl SyncRunner for SyncCoordinator {
    async fn run_sync(&self) -> Result<RunReport> {
        self.synchronize().await.map(|result| RunReport::from(&result))
    }
}

/// Host hook reporting idle time
#[async_trait]
pub trait IdleDetector: Send + Sync {
    /// Resolve once the host is idle
    async fn wait_for_idle(&self);
}

/// Scheduler options taken from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Foreground transitions run immediately
    pub trigger_on_foreground: bool,
    /// Startup runs immediately
    pub trigger_on_startup: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            trigger_on_foreground: true,
            trigger_on_startup: true,
        }
    }
}

/// Drives the sync runner according to a [`ScheduleStrategy`]
pub struct BackgroundScheduler {
    this: Weak<Self>,
    strategy: RwLock<ScheduleStrategy>,
    options: SchedulerOptions,
    runner: Arc<dyn SyncRunner>,
    queue: Arc<OperationQueue>,
    capability: Arc<CapabilityMonitor>,
    idle: Option<Arc<dyn IdleDetector>>,
    task: ScheduledTask,
    online: AtomicBool,
    foreground: AtomicBool,
    running: AtomicBool,
    draining: AtomicBool,
    failures: AtomicU32,
    runs: AtomicU64,
}

impl BackgroundScheduler {
    /// Create a scheduler; it stays passive until triggered or spawned
    pub fn new(
        strategy: ScheduleStrategy,
        options: SchedulerOptions,
        runner: Arc<dyn SyncRunner>,
        queue: Arc<OperationQueue>,
        capability: Arc<CapabilityMonitor>,
        idle: Option<Arc<dyn IdleDetector>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            strategy: RwLock::new(strategy),
            options,
            runner,
            queue,
            capability,
            idle,
            task: ScheduledTask::new(),
            online: AtomicBool::new(false),
            foreground: AtomicBool::new(true),
            running: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            runs: AtomicU64::new(0),
        })
    }

    /// Current strategy
    pub async fn strategy(&self) -> ScheduleStrategy {
        self.strategy.read().await.clone()
    }

    /// Switch strategy and re-plan
    pub async fn set_strategy(&self, strategy: ScheduleStrategy) {
        info!("Scheduling strategy set to {}", strategy.name());
        *self.strategy.write().await = strategy;
        self.failures.store(0, Ordering::SeqCst);
        self.task.cancel();
        self.schedule_next().await;
    }

    /// Recompute the schedule, arming at most one timer
    pub async fn schedule_next(&self) -> Plan {
        self.evaluate(Trigger::Reschedule).await
    }

    /// Disarm the pending timer
    pub fn cancel_scheduled(&self) -> bool {
        let cancelled = self.task.cancel();
        if cancelled {
            debug!("Scheduled sync cancelled");
        }
        cancelled
    }

    /// Record connectivity without re-planning
    pub fn set_connectivity(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Record foreground state without re-planning
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    /// Whether the scheduler considers the device online
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Connectivity changed
    pub async fn notify_connectivity(&self, online: bool) -> Plan {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            self.evaluate(Trigger::ConnectivityRestored).await
        } else {
            self.evaluate(Trigger::Reschedule).await
        }
    }

    /// App moved to the foreground or background
    pub async fn notify_foreground(&self, foreground: bool) -> Plan {
        let was_foreground = self.foreground.swap(foreground, Ordering::SeqCst);
        if foreground && !was_foreground && self.options.trigger_on_foreground {
            self.evaluate(Trigger::Foregrounded).await
        } else {
            self.evaluate(Trigger::Reschedule).await
        }
    }

    /// App started
    pub async fn notify_startup(&self) -> Plan {
        if self.options.trigger_on_startup {
            self.evaluate(Trigger::Startup).await
        } else {
            self.evaluate(Trigger::Reschedule).await
        }
    }

    /// Whether a timer is armed
    pub fn is_armed(&self) -> bool {
        self.task.is_armed()
    }

    /// Deadline of the armed timer
    pub fn deadline(&self) -> Option<Instant> {
        self.task.deadline()
    }

    /// Observe the armed deadline
    pub fn subscribe_armed(&self) -> watch::Receiver<Option<Instant>> {
        self.task.subscribe()
    }

    /// Whether a scheduled run is in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Failed scheduled runs since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Runs started by this scheduler
    pub fn runs_started(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Current scheduling inputs
    pub async fn context(&self) -> SchedulingContext {
        let capability = self.capability.current().await;
        SchedulingContext {
            online: self.online.load(Ordering::SeqCst),
            foreground: self.foreground.load(Ordering::SeqCst),
            queue_len: self.queue.len().await,
            snapshot: capability.snapshot,
            adaptation: capability.strategy,
            consecutive_failures: self.failures.load(Ordering::SeqCst),
            continue_draining: self.draining.load(Ordering::SeqCst),
            idle_hook: self.idle.is_some(),
        }
    }

    /// Plan for `trigger` and act on it
    pub async fn evaluate(&self, trigger: Trigger) -> Plan {
        let ctx = self.context().await;
        let decision = {
            let strategy = self.strategy.read().await;
            plan(&strategy, trigger, &ctx)
        };
        debug!("Scheduling {:?} -> {:?}", trigger, decision);

        match decision {
            Plan::Wait => {
                self.task.cancel();
            }
            Plan::Run => {
                self.task.cancel();
                self.start_run();
            }
            Plan::RunAfter(_) | Plan::RunWhenIdle(_)
                if trigger == Trigger::QueueChanged && self.task.is_armed() =>
            {
                // Enqueueing must not keep pushing an armed run back
            }
            Plan::RunAfter(delay) => {
                let this = self.this.clone();
                self.task.schedule(delay, Self::fire(this));
            }
            Plan::RunWhenIdle(fallback) => {
                let this = self.this.clone();
                let idle = self.idle.clone();
                let wake = async move {
                    match idle {
                        Some(idle) => idle.wait_for_idle().await,
                        None => std::future::pending().await,
                    }
                };
                self.task.schedule_with_wake(fallback, wake, Self::fire(this));
            }
        }
        decision
    }

    fn fire(this: Weak<Self>) -> FireFuture {
        Box::pin(async move {
            if let Some(scheduler) = this.upgrade() {
                scheduler.evaluate(Trigger::TimerFired).await;
            }
        })
    }

    /// Spawn a run unless one is in flight. The run lives outside the timer
    /// task so re-arming the timer never aborts it.
    fn start_run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Scheduled run already in flight");
            return;
        }
        let Some(scheduler) = self.this.upgrade() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut draining = false;
            match scheduler.runner.run_sync().await {
                Ok(report) if report.success => {
                    scheduler.failures.store(0, Ordering::SeqCst);
                    draining = report.can_continue();
                }
                Ok(_) => {
                    let failures = scheduler.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("Scheduled run incomplete ({} consecutive)", failures);
                }
                Err(Error::SyncInProgress) => {
                    // The active run reports through the queue; retry on the timer
                    debug!("Another run is active, scheduled run skipped");
                }
                Err(Error::SyncDisabled) => {
                    debug!("Sync disabled by policy, scheduled run skipped");
                }
                Err(e) => {
                    let failures = scheduler.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("Scheduled run failed ({} consecutive): {}", failures, e);
                }
            }
            scheduler.draining.store(draining, Ordering::SeqCst);
            scheduler.running.store(false, Ordering::SeqCst);
            scheduler.evaluate(Trigger::RunFinished).await;
        });
    }

    /// React to queue and capability changes until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut queue_rx = self.queue.subscribe();
            let mut capability_rx = self.capability.subscribe();
            loop {
                tokio::select! {
                    result = queue_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                        self.evaluate(Trigger::QueueChanged).await;
                    }
                    result = capability_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                        self.evaluate(Trigger::CapabilityChanged).await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            debug!("Scheduler stopping");
                            break;
                        }
                    }
                }
            }
            self.task.cancel();
        })
    }
}

impl fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("options", &self.options)
            .field("armed", &self.task.is_armed())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
