//! Per-node liveness state machine
//!
//! ```text
//!            suspend fault / retries exhausted
//!   Active ─────────────────────────────────────► Suspended
//!     │  ▲                                          │
//!     │  └──────── now > recover_at (lazy) ◄────────┘
//!     │  ▲
//!     │  └──────── now > recover_at (lazy) ◄──┐
//!     └─── timeout, retries left ────────► Timeout
//!
//!   any ── switch_off ──► Off ── switch_on ──► Active
//! ```
//!
//! Reads of the active flag are lock-free. Every transition takes the record
//! lock so the flag and the recovery timestamp always change together.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::cluster::{ClusterError, ClusterState, SharedValue};
use crate::config::DefaultSuspend;
use crate::definition::EndpointDefinition;

/// Observable liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    /// Eligible for traffic
    Active,

    /// Timed out with retries left; inactive until the retry delay passes
    Timeout,

    /// Suspended after a fatal error
    Suspended,

    /// Administratively switched off
    Off,
}

/// How a node backs off after failures
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendPolicy {
    /// First suspension; `None` suspends until reactivated
    pub initial: Option<Duration>,

    /// Growth per consecutive failure (values below 1 are treated as 1)
    pub progression_factor: f32,

    pub maximum: Option<Duration>,

    /// Timeouts tolerated before a timeout suspends the node
    pub retries_on_timeout: u32,

    pub retry_delay: Duration,
}

impl SuspendPolicy {
    /// Policy of a leaf, falling back to `default` without an initial duration
    pub fn from_definition(definition: &EndpointDefinition, default: DefaultSuspend) -> Self {
        Self {
            initial: definition.initial_suspend().or_else(|| default.initial()),
            progression_factor: definition.suspend_progression_factor(),
            maximum: definition.suspend_maximum(),
            retries_on_timeout: definition.retries_on_timeout_before_suspend(),
            retry_delay: definition.retry_delay_on_timeout(),
        }
    }

    /// Policy of composite nodes: inactive until a check finds a live child
    pub fn until_child_active() -> Self {
        Self {
            initial: None,
            progression_factor: 1.0,
            maximum: None,
            retries_on_timeout: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Suspension for the `failures`-th consecutive failure, `None` for forever
    pub fn suspend_millis(&self, failures: u32) -> Option<u64> {
        let initial = self.initial?.as_millis() as u64;
        let factor = f64::from(self.progression_factor.max(1.0));
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;

        // float-to-int casts saturate
        let mut millis = (initial as f64 * factor.powi(exponent)) as u64;
        if let Some(maximum) = self.maximum {
            millis = millis.min(maximum.as_millis() as u64);
        }
        Some(millis)
    }
}

/// Point-in-time view of a node's liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessSnapshot {
    pub state: EndpointState,

    /// When the node becomes eligible again; `None` while active or suspended forever
    pub recover_at: Option<u64>,

    pub consecutive_failures: u32,

    /// Duration of the latest suspension in milliseconds
    pub last_suspend_millis: Option<u64>,
}

impl LivenessSnapshot {
    pub fn is_active(&self) -> bool {
        self.state == EndpointState::Active
    }
}

#[derive(Debug)]
struct SuspendRecord {
    state: EndpointState,
    recover_at: Option<u64>,
    consecutive_failures: u32,
    timeout_retries_left: u32,
    last_suspend: Option<u64>,
}

struct SharedLiveness {
    cluster: Arc<dyn ClusterState>,
    active_key: String,
    recover_key: String,
}

impl SharedLiveness {
    fn keys(&self) -> Vec<String> {
        vec![self.active_key.clone(), self.recover_key.clone()]
    }
}

/// Liveness of one routing node
pub struct LivenessState {
    policy: SuspendPolicy,
    active: AtomicBool,
    record: Mutex<SuspendRecord>,
    shared: RwLock<Option<Arc<SharedLiveness>>>,
}

impl fmt::Debug for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessState")
            .field("policy", &self.policy)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("record", &*self.record.lock())
            .field("clustered", &self.shared.read().is_some())
            .finish()
    }
}

impl LivenessState {
    pub fn new(policy: SuspendPolicy) -> Self {
        let timeout_retries_left = policy.retries_on_timeout;
        Self {
            policy,
            active: AtomicBool::new(true),
            record: Mutex::new(SuspendRecord {
                state: EndpointState::Active,
                recover_at: None,
                consecutive_failures: 0,
                timeout_retries_left,
                last_suspend: None,
            }),
            shared: RwLock::new(None),
        }
    }

    pub fn policy(&self) -> &SuspendPolicy {
        &self.policy
    }

    /// Mirror this state through `cluster` under keys derived from `name`
    pub fn attach_cluster(&self, cluster: Arc<dyn ClusterState>, name: &str) {
        *self.shared.write() = Some(Arc::new(SharedLiveness {
            cluster,
            active_key: format!("{name}_active"),
            recover_key: format!("{name}_recover_on"),
        }));
    }

    pub fn detach_cluster(&self) {
        *self.shared.write() = None;
    }

    pub fn is_clustered(&self) -> bool {
        self.shared.read().is_some()
    }

    /// Whether the node may receive traffic at `now`, recovering it if its
    /// suspension has elapsed
    pub fn is_active(&self, now: u64) -> bool {
        if let Some(shared) = self.shared() {
            return self.is_active_shared(&shared, now);
        }
        if self.active.load(Ordering::Acquire) {
            return true;
        }

        let mut record = self.record.lock();
        if self.active.load(Ordering::Acquire) {
            return true;
        }
        match (record.state, record.recover_at) {
            (EndpointState::Off, _) => false,
            (_, Some(at)) if now > at => {
                record.state = EndpointState::Active;
                record.recover_at = None;
                self.active.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    fn is_active_shared(&self, shared: &SharedLiveness, now: u64) -> bool {
        let active = shared
            .cluster
            .get(&shared.active_key)
            .and_then(|value| value.as_bool())
            .unwrap_or(true);

        let mut record = self.record.lock();
        if active {
            if record.state != EndpointState::Active {
                record.state = EndpointState::Active;
                record.recover_at = None;
            }
            self.active.store(true, Ordering::Release);
            return true;
        }

        let recover_at = shared
            .cluster
            .get(&shared.recover_key)
            .and_then(|value| value.as_millis());
        match recover_at {
            Some(at) if now > at => {
                record.state = EndpointState::Active;
                record.recover_at = None;
                self.active.store(true, Ordering::Release);
                if let Err(e) = publish(shared, true, None) {
                    warn!(key = %shared.active_key, error = %e, "Failed to replicate recovery");
                }
                true
            }
            _ => {
                if record.state == EndpointState::Active {
                    record.state = EndpointState::Suspended;
                }
                record.recover_at = recover_at;
                self.active.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Suspend after a fatal failure, backing off geometrically.
    ///
    /// Local state is updated even when replication fails.
    pub fn suspend(&self, now: u64) -> Result<LivenessSnapshot, ClusterError> {
        let mut record = self.record.lock();
        if record.state == EndpointState::Off {
            return Ok(snapshot_of(&record));
        }

        self.suspend_locked(&mut record, now);
        self.publish_record(&record)
    }

    fn suspend_locked(&self, record: &mut SuspendRecord, now: u64) {
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        let millis = self.policy.suspend_millis(record.consecutive_failures);
        record.state = EndpointState::Suspended;
        record.recover_at = millis.map(|d| now.saturating_add(d));
        record.last_suspend = millis;
        record.timeout_retries_left = self.policy.retries_on_timeout;
        self.active.store(false, Ordering::Release);
    }

    /// React to a timeout: consume a retry, or suspend once none are left
    pub fn on_timeout(&self, now: u64) -> Result<LivenessSnapshot, ClusterError> {
        let mut record = self.record.lock();
        if record.state == EndpointState::Off {
            return Ok(snapshot_of(&record));
        }
        if record.timeout_retries_left == 0 {
            self.suspend_locked(&mut record, now);
        } else {
            record.timeout_retries_left -= 1;
            record.state = EndpointState::Timeout;
            record.recover_at =
                Some(now.saturating_add(self.policy.retry_delay.as_millis() as u64));
            self.active.store(false, Ordering::Release);
        }

        self.publish_record(&record)
    }

    /// Explicit reactivation; clears the failure streak. An `Off` node stays off.
    pub fn mark_active(&self) -> Result<LivenessSnapshot, ClusterError> {
        let mut record = self.record.lock();
        if record.state == EndpointState::Off {
            return Ok(snapshot_of(&record));
        }
        reset(&mut record, &self.policy);
        self.active.store(true, Ordering::Release);

        self.publish_record(&record)
    }

    /// A delivery went through; clears the failure streak
    pub fn record_success(&self) {
        let mut record = self.record.lock();
        if record.state == EndpointState::Off {
            return;
        }
        let was_active = record.state == EndpointState::Active;
        reset(&mut record, &self.policy);
        self.active.store(true, Ordering::Release);

        if !was_active {
            if let Err(e) = self.publish_record(&record) {
                warn!(error = %e, "Failed to replicate reactivation");
            }
        }
    }

    /// Take the node out of rotation until [`LivenessState::switch_on`]
    pub fn switch_off(&self) -> Result<LivenessSnapshot, ClusterError> {
        let mut record = self.record.lock();
        record.state = EndpointState::Off;
        record.recover_at = None;
        self.active.store(false, Ordering::Release);

        self.publish_record(&record)
    }

    pub fn switch_on(&self) -> Result<LivenessSnapshot, ClusterError> {
        let mut record = self.record.lock();
        reset(&mut record, &self.policy);
        self.active.store(true, Ordering::Release);

        self.publish_record(&record)
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        snapshot_of(&self.record.lock())
    }

    pub fn state(&self) -> EndpointState {
        self.record.lock().state
    }

    fn shared(&self) -> Option<Arc<SharedLiveness>> {
        self.shared.read().clone()
    }

    fn publish_record(&self, record: &SuspendRecord) -> Result<LivenessSnapshot, ClusterError> {
        let snapshot = snapshot_of(record);
        if let Some(shared) = self.shared() {
            publish(&shared, snapshot.is_active(), record.recover_at)?;
        }
        Ok(snapshot)
    }
}

fn reset(record: &mut SuspendRecord, policy: &SuspendPolicy) {
    record.state = EndpointState::Active;
    record.recover_at = None;
    record.consecutive_failures = 0;
    record.timeout_retries_left = policy.retries_on_timeout;
}

fn snapshot_of(record: &SuspendRecord) -> LivenessSnapshot {
    LivenessSnapshot {
        state: record.state,
        recover_at: record.recover_at,
        consecutive_failures: record.consecutive_failures,
        last_suspend_millis: record.last_suspend,
    }
}

fn publish(
    shared: &SharedLiveness,
    active: bool,
    recover_at: Option<u64>,
) -> Result<(), ClusterError> {
    shared
        .cluster
        .set(&shared.active_key, SharedValue::Bool(active));
    match recover_at {
        Some(at) if !active => shared
            .cluster
            .set(&shared.recover_key, SharedValue::Millis(at)),
        _ => shared.cluster.remove(&shared.recover_key),
    }
    shared.cluster.replicate(&shared.keys())
}
