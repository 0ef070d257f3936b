//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that wires the activity
//! table, run table, dispatcher and outbound pump together and exposes the
//! invocation API used by applications.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

// Submodules
pub mod activity;
pub mod async_runner;
pub mod command;
pub mod condition;
pub mod control;
pub mod dedup;
pub mod error;
pub mod event_loop;
pub mod mailbox;
pub mod queue;
pub mod runtable;
pub mod storage;
pub mod sync_runner;
pub mod transport;
pub mod worker;

use activity::{Activity, ActivityTable, ActivityTemplate, ExecutionKind};
use command::Argument;
use condition::{PlacementEvaluator, Tier};
use error::{Result, RuntimeError};
use event_loop::{EventLoop, InboundHandle};
use mailbox::Outbox;
use runtable::RunTable;
use storage::Storage;
use transport::Transport;

/// Configuration for a jamcore node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (default: .jamcore/)
    pub root: PathBuf,

    /// Identity used as the originator of every command this node sends
    pub device_id: Uuid,

    /// Broker port supplied at bootstrap
    pub port: u16,

    /// Device serial number supplied at bootstrap
    pub serial_num: u32,

    /// Application tag supplied at bootstrap
    pub app_tag: String,

    /// Tier this node runs on
    pub tier: Tier,

    /// Tiers whose brokers this node is connected to
    pub links: Vec<Tier>,

    /// Maximum number of concurrently live activities
    pub activity_capacity: usize,

    /// Capacity of each activity inbox and outbox
    pub queue_capacity: usize,

    /// Per-reply wait of the synchronous acknowledgment phase
    pub ack_timeout_ms: u64,

    /// Per-reply wait of the asynchronous runner
    pub reply_timeout_ms: u64,

    /// Wait for each result after the first one
    pub result_grace_ms: u64,

    /// Lease advertised in acknowledgments
    pub default_lease_ms: u64,

    /// Number of request keys remembered for duplicate suppression
    pub dedup_cache_size: usize,

    /// How long a synchronous request waits for the start signal
    pub sync_start_timeout_ms: u64,

    /// Delay between a READY and the start time it is granted
    pub sync_start_delay_ms: u64,

    /// How long a served synchronous result waits to be pulled
    pub result_retention_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".jamcore"),
            device_id: Uuid::new_v4(),
            port: 1883,
            serial_num: 1,
            app_tag: "app".to_string(),
            tier: Tier::Device,
            links: vec![Tier::Device],
            activity_capacity: 64,
            queue_capacity: 64,
            ack_timeout_ms: 300,
            reply_timeout_ms: 300,
            result_grace_ms: 5,
            default_lease_ms: 50,
            dedup_cache_size: 32,
            sync_start_timeout_ms: 1000,
            sync_start_delay_ms: 20,
            result_retention_ms: 2000,
        }
    }
}

impl RuntimeConfig {
    /// Reject configurations the runtime cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.activity_capacity == 0 {
            return Err(RuntimeError::Config("activity_capacity must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(RuntimeError::Config("queue_capacity must be positive".into()));
        }
        if self.dedup_cache_size == 0 {
            return Err(RuntimeError::Config("dedup_cache_size must be positive".into()));
        }
        Ok(())
    }

    /// Originator id carried by outgoing commands
    pub fn originator(&self) -> String {
        self.device_id.to_string()
    }

    /// Acknowledgment wait
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Asynchronous reply wait
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Grace period for results after the first
    pub fn result_grace(&self) -> Duration {
        Duration::from_millis(self.result_grace_ms)
    }

    /// Start-signal wait
    pub fn sync_start_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_start_timeout_ms)
    }

    /// Start-time offset granted to READY
    pub fn sync_start_delay(&self) -> Duration {
        Duration::from_millis(self.sync_start_delay_ms)
    }

    /// Served result retention
    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }
}

/// Shared state the runners operate on
#[derive(Clone)]
pub struct Invoker {
    table: Arc<ActivityTable>,
    runs: Arc<RunTable>,
    evaluator: Arc<dyn PlacementEvaluator>,
    config: Arc<RuntimeConfig>,
}

impl Invoker {
    /// Assemble an invoker over existing tables
    pub fn new(
        table: Arc<ActivityTable>,
        runs: Arc<RunTable>,
        evaluator: Arc<dyn PlacementEvaluator>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            table,
            runs,
            evaluator,
            config,
        }
    }

    /// Activity table
    pub fn table(&self) -> &Arc<ActivityTable> {
        &self.table
    }

    /// Run table
    pub fn runs(&self) -> &Arc<RunTable> {
        &self.runs
    }
}

/// The main runtime orchestrator
///
/// Owns the activity and run tables and the two long-lived tasks: the
/// inbound dispatcher and the outbound pump. Must be started inside a tokio
/// runtime.
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    invoker: Invoker,
    inbound: InboundHandle,
    storage: Storage,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Start a node on `transport`, consulting `evaluator` for placement
    pub fn start(
        config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        evaluator: Arc<dyn PlacementEvaluator>,
    ) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RuntimeError::Init("no tokio runtime".into()));
        }

        let config = Arc::new(config);
        let (doorbell, doorbell_rx) = mailbox::doorbell();
        let table = Arc::new(ActivityTable::new(
            config.activity_capacity,
            config.queue_capacity,
            doorbell.clone(),
        ));
        let runs = Arc::new(RunTable::new());
        let control = Outbox::with_capacity(config.queue_capacity, doorbell)
            .ok_or_else(|| RuntimeError::Init("control outbox".into()))?;

        let (inbound, inbound_rx) = event_loop::inbound_queue();
        let dispatcher = EventLoop::new(
            inbound_rx,
            table.clone(),
            evaluator.clone(),
            config.clone(),
            control,
        );

        let tasks = vec![
            tokio::spawn(dispatcher.run()),
            tokio::spawn(event_loop::run_outbound_pump(doorbell_rx, transport)),
        ];

        tracing::info!(
            device = %config.device_id,
            tier = %config.tier,
            links = ?config.links,
            "runtime started"
        );

        Ok(Self {
            storage: Storage::new(config.root.clone()),
            invoker: Invoker::new(table, runs, evaluator, config.clone()),
            config,
            inbound,
            tasks,
        })
    }

    /// Initialize runtime storage directories and write the configuration
    pub fn init(config: &RuntimeConfig) -> anyhow::Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(config)?;
        Ok(())
    }

    /// Start from a configuration previously written by [`Runtime::init`]
    pub fn load(
        root: PathBuf,
        transport: Arc<dyn Transport>,
        evaluator: Arc<dyn PlacementEvaluator>,
    ) -> anyhow::Result<Self> {
        let config = storage::load_config(&root)?;
        Ok(Self::start(config, transport, evaluator)?)
    }

    /// Register an activity template
    pub fn register<F>(
        &self,
        name: &str,
        signature: &str,
        kind: ExecutionKind,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&[Argument]) -> anyhow::Result<Option<Argument>> + Send + Sync + 'static,
    {
        let template = ActivityTemplate::new(name, signature, kind, callback)?;
        self.invoker.table.register(template)?;
        Ok(())
    }

    /// Invoke `name` synchronously and wait for its result
    pub async fn rexec_sync(&self, name: &str, args: Vec<Argument>) -> Result<Option<Argument>> {
        self.invoker.rexec_sync(name, args).await
    }

    /// Invoke `name` asynchronously on every tier
    pub async fn rexec_async(&self, name: &str, args: Vec<Argument>) -> Result<Arc<Activity>> {
        self.invoker
            .rexec_async(name, condition::UNCONDITIONAL, args)
            .await
    }

    /// Invoke `name` asynchronously on the tiers admitted by `condition`
    pub async fn rexec_async_when(
        &self,
        name: &str,
        condition: &str,
        args: Vec<Argument>,
    ) -> Result<Arc<Activity>> {
        self.invoker.rexec_async(name, condition, args).await
    }

    /// Run the asynchronous runner on its own task
    pub fn spawn_rexec_async(
        &self,
        name: &str,
        condition: &str,
        args: Vec<Argument>,
    ) -> JoinHandle<Result<Arc<Activity>>> {
        let invoker = self.invoker.clone();
        let name = name.to_string();
        let condition = condition.to_string();
        tokio::spawn(async move { invoker.rexec_async(&name, &condition, args).await })
    }

    /// Release an activity returned by the asynchronous runner
    pub fn free(&self, activity: &Activity) -> bool {
        self.invoker.table.free(activity)
    }

    /// Handle through which the transport delivers inbound commands
    pub fn inbound(&self) -> InboundHandle {
        self.inbound.clone()
    }

    /// Current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Storage manager
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Activity table
    pub fn activities(&self) -> &ActivityTable {
        &self.invoker.table
    }

    /// Number of in-flight remote invocations
    pub fn in_flight(&self) -> usize {
        self.invoker.runs.len()
    }

    /// Point-in-time status
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus::capture(&self.config, &self.invoker.table, &self.invoker.runs)
    }

    /// Write the current status under the storage root
    pub fn persist_status(&self) -> anyhow::Result<()> {
        storage::init_storage(self.storage.root())?;
        self.storage.write_status(&self.status())
    }

    /// Stop the dispatcher and outbound pump
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        futures::future::join_all(self.tasks).await;
        tracing::info!(device = %self.config.device_id, "runtime stopped");
    }
}

// Re-export commonly used types
pub use control::RuntimeStatus;
