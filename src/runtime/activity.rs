//! Activity templates, live instances, and the pooled activity table
//!
//! Templates are registered once and never removed. Live instances occupy a
//! slot in a fixed-capacity pool; slots are recycled through an explicit
//! free list so allocation is O(1) and the number of concurrently live
//! activities is bounded. The table hands out `Arc<Activity>` handles; freeing
//! an activity returns its slot even while handles are still held, and those
//! handles then observe a closed inbox.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::command::{Argument, Command, CommandKind, Signature};
use super::error::{ActivityError, ActivityResult, CommandResult, QueueResult};
use super::mailbox::{Doorbell, Envelope, Inbox, Outbox};

/// Reply slots per activity, one per tier
pub const MAX_REPLIES: usize = 3;

/// Process-unique activity identifier
///
/// Locally generated ids are derived from the wall clock plus a sequence
/// number; served activities reuse the id chosen by the originator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(String);

impl ActivityId {
    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-derived id
    pub fn generate() -> Self {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("{:x}-{:x}", nanos, seq))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an activity instance
///
/// Variants are declared in severity order so that folding replies is a
/// plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivityState {
    /// Slot unused
    Empty,
    /// Allocated, nothing sent or received yet
    New,
    /// At least one tier acknowledged
    Started,
    /// Callback executing
    Running,
    /// Finished successfully
    Completed,
    /// Some expected replies never arrived
    Partial,
    /// Placement condition rejected the request
    NegativeCond,
    /// Arguments rejected
    ParameterError,
    /// Callback failed
    Error,
    /// Every wait expired
    TimedOut,
    /// Unrecoverable
    FatalError,
}

impl ActivityState {
    /// Upper-case label used in status replies and logs
    pub fn label(self) -> &'static str {
        match self {
            ActivityState::Empty => "EMPTY",
            ActivityState::New => "NEW",
            ActivityState::Started => "STARTED",
            ActivityState::Running => "RUNNING",
            ActivityState::Completed => "COMPLETED",
            ActivityState::Partial => "PARTIAL",
            ActivityState::NegativeCond => "NEGATIVE_COND",
            ActivityState::ParameterError => "PARAMETER_ERROR",
            ActivityState::Error => "ERROR",
            ActivityState::TimedOut => "TIMEDOUT",
            ActivityState::FatalError => "FATAL_ERROR",
        }
    }

    /// Whether no further transitions are expected before the free
    pub fn is_terminal(self) -> bool {
        self >= ActivityState::Completed
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether callers block for a result or fan out and continue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    /// Result pulled back with RES-GET
    Sync,
    /// Fire and aggregate acknowledgments
    Async,
}

impl ExecutionKind {
    /// Whether a request of `kind` may run an activity of this kind
    pub fn accepts(self, kind: CommandKind) -> bool {
        match self {
            ExecutionKind::Sync => kind == CommandKind::RexecSyn,
            ExecutionKind::Async => kind.is_async_request(),
        }
    }
}

/// Native logic bound to a template
pub type ActivityCallback =
    Arc<dyn Fn(&[Argument]) -> anyhow::Result<Option<Argument>> + Send + Sync>;

/// Registered activity definition
#[derive(Clone)]
pub struct ActivityTemplate {
    /// Unique name
    pub name: String,
    /// Expected argument types
    pub signature: Signature,
    /// Sync or async
    pub kind: ExecutionKind,
    /// Native function run when a request is served
    pub callback: ActivityCallback,
}

impl ActivityTemplate {
    /// Build a template from a signature string such as `"si"`
    pub fn new<F>(name: impl Into<String>, signature: &str, kind: ExecutionKind, callback: F) -> CommandResult<Self>
    where
        F: Fn(&[Argument]) -> anyhow::Result<Option<Argument>> + Send + Sync + 'static,
    {
        Ok(Self {
            name: name.into(),
            signature: Signature::parse(signature)?,
            kind,
            callback: Arc::new(callback),
        })
    }
}

impl fmt::Debug for ActivityTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityTemplate")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Live activity instance
pub struct Activity {
    id: ActivityId,
    name: String,
    slot: usize,
    for_remote: bool,
    state: Mutex<ActivityState>,
    arguments: Mutex<Vec<Argument>>,
    replies: Mutex<[Option<Command>; MAX_REPLIES]>,
    result: Mutex<Option<Argument>>,
    access_time: Mutex<DateTime<Utc>>,
    inbox: Inbox<Envelope>,
    outbox: Outbox,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Activity {
    /// Activity id
    pub fn id(&self) -> &ActivityId {
        &self.id
    }

    /// Template name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool slot index
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether this instance serves a remote request
    pub fn is_remote(&self) -> bool {
        self.for_remote
    }

    /// Current state
    pub fn state(&self) -> ActivityState {
        *self.state.lock()
    }

    /// Overwrite the state
    pub fn set_state(&self, state: ActivityState) {
        *self.state.lock() = state;
    }

    /// Raise the state to at least `state`, returning the resulting state
    pub fn raise_state(&self, state: ActivityState) -> ActivityState {
        let mut current = self.state.lock();
        *current = (*current).max(state);
        *current
    }

    /// Mark the callback as executing
    pub fn mark_running(&self) {
        self.set_state(ActivityState::Running);
    }

    /// Mark successful completion
    pub fn mark_completed(&self) {
        self.set_state(ActivityState::Completed);
    }

    /// Mark a callback failure
    pub fn mark_error(&self) {
        self.raise_state(ActivityState::Error);
    }

    /// Mark that every wait expired
    pub fn mark_timed_out(&self) {
        self.raise_state(ActivityState::TimedOut);
    }

    /// Argument snapshot
    pub fn arguments(&self) -> Vec<Argument> {
        self.arguments.lock().clone()
    }

    /// Replace the argument snapshot
    pub fn set_arguments(&self, args: Vec<Argument>) {
        *self.arguments.lock() = args;
    }

    /// Store a reply in slot `index`; out-of-range slots are ignored
    pub fn store_reply(&self, index: usize, reply: Command) -> bool {
        match self.replies.lock().get_mut(index) {
            Some(slot) => {
                *slot = Some(reply);
                true
            }
            None => false,
        }
    }

    /// Reply stored in slot `index`
    pub fn reply(&self, index: usize) -> Option<Command> {
        self.replies.lock().get(index).cloned().flatten()
    }

    /// Stored replies in slot order
    pub fn replies(&self) -> Vec<Command> {
        self.replies.lock().iter().flatten().cloned().collect()
    }

    /// Clear every reply slot
    pub fn clear_replies(&self) {
        *self.replies.lock() = Default::default();
    }

    /// Longest lease advertised by the stored acknowledgments
    pub fn lease_hint(&self) -> Duration {
        let ms = self
            .replies
            .lock()
            .iter()
            .flatten()
            .filter(|r| r.kind() == CommandKind::RexecAck)
            .filter_map(Command::lease_ms)
            .max()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Value produced by a served callback
    pub fn result(&self) -> Option<Argument> {
        self.result.lock().clone()
    }

    /// Record the value produced by a served callback
    pub fn set_result(&self, result: Option<Argument>) {
        *self.result.lock() = result;
    }

    /// Last access time
    pub fn access_time(&self) -> DateTime<Utc> {
        *self.access_time.lock()
    }

    /// Stamp the access time with the current wall clock
    pub fn touch(&self) {
        *self.access_time.lock() = Utc::now();
    }

    /// Inbound queue (single consumer: the runner or the worker)
    pub fn inbox(&self) -> &Inbox<Envelope> {
        &self.inbox
    }

    /// Outbound queue drained by the outbound pump
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Hand an inbound command to this activity
    pub fn deliver(&self, envelope: Envelope) -> QueueResult<()> {
        self.inbox.push(envelope)
    }

    /// Wait for the next reply, synthesizing TIMEOUT when `timeout` elapses
    pub async fn await_reply(&self, timeout: Duration) -> CommandResult<Command> {
        match self.inbox.recv_timeout(timeout).await {
            Some(envelope) => Ok(envelope.command),
            None => Command::timeout(&self.name, &self.id),
        }
    }

    /// Attach the worker task serving this activity
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    /// Whether a worker task is attached and still running
    pub fn has_live_task(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Summary for status reporting
    pub fn summary(&self) -> ActivitySummary {
        ActivitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state(),
            for_remote: self.for_remote,
            access_time: self.access_time(),
        }
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable view of a live activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Activity id
    pub id: ActivityId,
    /// Template name
    pub name: String,
    /// Current state
    pub state: ActivityState,
    /// Whether it serves a remote request
    pub for_remote: bool,
    /// Last access time
    pub access_time: DateTime<Utc>,
}

/// A node may serve the same id it is calling, so served and local
/// instances are indexed apart.
type InstanceKey = (ActivityId, bool);

struct Slots {
    entries: Vec<Option<Arc<Activity>>>,
    free: Vec<usize>,
    by_id: HashMap<InstanceKey, usize>,
}

/// Template registry plus the fixed-capacity instance pool
pub struct ActivityTable {
    templates: RwLock<HashMap<String, ActivityTemplate>>,
    slots: Mutex<Slots>,
    capacity: usize,
    queue_capacity: usize,
    doorbell: Doorbell,
}

impl ActivityTable {
    /// Create a table with `capacity` slots whose queues hold `queue_capacity` commands
    pub fn new(capacity: usize, queue_capacity: usize, doorbell: Doorbell) -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            slots: Mutex::new(Slots {
                entries: (0..capacity).map(|_| None).collect(),
                free: (0..capacity).rev().collect(),
                by_id: HashMap::new(),
            }),
            capacity,
            queue_capacity: queue_capacity.max(1),
            doorbell,
        }
    }

    /// Register a template; names are unique
    pub fn register(&self, template: ActivityTemplate) -> ActivityResult<()> {
        let mut templates = self.templates.write();
        if templates.contains_key(&template.name) {
            return Err(ActivityError::AlreadyRegistered(template.name));
        }
        tracing::debug!(name = %template.name, signature = %template.signature, "registered activity");
        templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Look up a template by name
    pub fn template(&self, name: &str) -> Option<ActivityTemplate> {
        self.templates.read().get(name).cloned()
    }

    /// Registered template names, sorted
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Allocate an instance with a fresh id
    pub fn create(&self, name: &str, for_remote: bool) -> ActivityResult<Arc<Activity>> {
        self.create_with_id(name, ActivityId::generate(), for_remote)
    }

    /// Allocate an instance under an id chosen elsewhere
    pub fn create_with_id(
        &self,
        name: &str,
        id: ActivityId,
        for_remote: bool,
    ) -> ActivityResult<Arc<Activity>> {
        if !self.templates.read().contains_key(name) {
            return Err(ActivityError::NotFound(name.to_string()));
        }

        let mut slots = self.slots.lock();
        if slots.by_id.contains_key(&(id.clone(), for_remote)) {
            return Err(ActivityError::DuplicateInstance(id));
        }
        let slot = slots.free.pop().ok_or(ActivityError::CapacityExceeded {
            capacity: self.capacity,
        })?;

        let (Some(inbox), Some(outbox)) = (
            Inbox::with_capacity(self.queue_capacity),
            Outbox::with_capacity(self.queue_capacity, self.doorbell.clone()),
        ) else {
            slots.free.push(slot);
            return Err(ActivityError::CapacityExceeded { capacity: 0 });
        };

        let activity = Arc::new(Activity {
            id: id.clone(),
            name: name.to_string(),
            slot,
            for_remote,
            state: Mutex::new(ActivityState::New),
            arguments: Mutex::new(Vec::new()),
            replies: Mutex::new(Default::default()),
            result: Mutex::new(None),
            access_time: Mutex::new(Utc::now()),
            inbox,
            outbox,
            task: Mutex::new(None),
        });

        slots.entries[slot] = Some(activity.clone());
        slots.by_id.insert((id, for_remote), slot);
        Ok(activity)
    }

    /// Find a live instance by id, preferring the local one
    pub fn lookup(&self, id: &ActivityId) -> Option<Arc<Activity>> {
        self.local(id).or_else(|| self.served(id))
    }

    /// Instance driven by a local caller, the target of replies
    pub fn local(&self, id: &ActivityId) -> Option<Arc<Activity>> {
        self.find(id, false)
    }

    /// Instance serving a remote request, the target of requests
    pub fn served(&self, id: &ActivityId) -> Option<Arc<Activity>> {
        self.find(id, true)
    }

    fn find(&self, id: &ActivityId, for_remote: bool) -> Option<Arc<Activity>> {
        let slots = self.slots.lock();
        let slot = *slots.by_id.get(&(id.clone(), for_remote))?;
        slots.entries[slot].clone()
    }

    /// Release an instance's slot
    ///
    /// Returns `false` if the instance was already freed. A slot that was
    /// recycled for a different activity is left untouched.
    pub fn free(&self, activity: &Activity) -> bool {
        let mut slots = self.slots.lock();
        let owned = matches!(
            slots.entries.get(activity.slot),
            Some(Some(live)) if std::ptr::eq(Arc::as_ptr(live), activity)
        );
        if !owned {
            return false;
        }

        slots.entries[activity.slot] = None;
        slots.by_id.remove(&(activity.id.clone(), activity.for_remote));
        slots.free.push(activity.slot);
        drop(slots);

        activity.inbox.close();
        activity.clear_replies();
        activity.set_state(ActivityState::Empty);
        true
    }

    /// Summaries of every live instance, in slot order
    pub fn snapshot(&self) -> Vec<ActivitySummary> {
        let live: Vec<Arc<Activity>> = self.slots.lock().entries.iter().flatten().cloned().collect();
        live.iter().map(|a| a.summary()).collect()
    }

    /// Number of live instances
    pub fn live_count(&self) -> usize {
        self.slots.lock().by_id.len()
    }

    /// Fixed slot capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
