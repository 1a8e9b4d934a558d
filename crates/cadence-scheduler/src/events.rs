use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::types::{InstanceId, JobOutcome};

/// Bitmask of event kinds. Every kind occupies one bit; listeners register
/// with any union of them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const SCHEDULER_STARTED: Self = Self(1 << 0);
    pub const SCHEDULER_STOPPED: Self = Self(1 << 1);
    pub const SCHEDULER_PAUSED: Self = Self(1 << 2);
    pub const SCHEDULER_RESUMED: Self = Self(1 << 3);
    pub const JOB_ADDED: Self = Self(1 << 4);
    pub const JOB_REMOVED: Self = Self(1 << 5);
    pub const JOB_MODIFIED: Self = Self(1 << 6);
    pub const JOB_SUBMITTED: Self = Self(1 << 7);
    pub const JOB_MAX_INSTANCES: Self = Self(1 << 8);
    pub const JOB_EXECUTED: Self = Self(1 << 9);
    pub const JOB_ERROR: Self = Self(1 << 10);
    pub const JOB_TERMINATED: Self = Self(1 << 11);

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self((1 << 12) - 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SCHEDULER_STARTED => "scheduler_started",
            Self::SCHEDULER_STOPPED => "scheduler_stopped",
            Self::SCHEDULER_PAUSED => "scheduler_paused",
            Self::SCHEDULER_RESUMED => "scheduler_resumed",
            Self::JOB_ADDED => "job_added",
            Self::JOB_REMOVED => "job_removed",
            Self::JOB_MODIFIED => "job_modified",
            Self::JOB_SUBMITTED => "job_submitted",
            Self::JOB_MAX_INSTANCES => "job_max_instances",
            Self::JOB_EXECUTED => "job_executed",
            Self::JOB_ERROR => "job_error",
            Self::JOB_TERMINATED => "job_terminated",
            _ => return None,
        };
        Some(name)
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "EventMask({:#x})", self.0),
        }
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one job run, as delivered to listeners.
#[derive(Debug, Clone)]
pub struct JobExecutionEvent {
    pub kind: EventMask,
    pub job_id: String,
    pub instance_id: InstanceId,
    pub run_time: DateTime<Utc>,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Lifecycle of the scheduler itself.
    Scheduler { kind: EventMask },
    /// Something happened to a stored job.
    Job { kind: EventMask, job_id: String },
    JobExecution(JobExecutionEvent),
}

impl SchedulerEvent {
    pub fn scheduler(kind: EventMask) -> Self {
        SchedulerEvent::Scheduler { kind }
    }

    pub fn job(kind: EventMask, job_id: impl Into<String>) -> Self {
        SchedulerEvent::Job {
            kind,
            job_id: job_id.into(),
        }
    }

    pub fn kind(&self) -> EventMask {
        match self {
            SchedulerEvent::Scheduler { kind } | SchedulerEvent::Job { kind, .. } => *kind,
            SchedulerEvent::JobExecution(ev) => ev.kind,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::Scheduler { .. } => None,
            SchedulerEvent::Job { job_id, .. } => Some(job_id),
            SchedulerEvent::JobExecution(ev) => Some(&ev.job_id),
        }
    }

    /// `Some(..)` only for execution events.
    pub fn success(&self) -> Option<bool> {
        match self {
            SchedulerEvent::JobExecution(ev) => Some(ev.outcome.is_success()),
            _ => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    mask: EventMask,
    callback: Listener,
}

/// In-process pub/sub for scheduler events.
///
/// Dispatch is synchronous on the caller's task. The registry lock is only
/// held while taking a snapshot, so listeners may register or remove
/// listeners, or call back into the scheduler.
pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener<F>(&self, mask: EventMask, callback: F) -> ListenerId
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.push(Registration {
            id,
            mask,
            callback: Arc::new(callback),
        });
        debug!(listener = id.0, mask = %mask, "listener registered");
        id
    }

    /// Returns `false` if the listener was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() < before
    }

    pub fn dispatch(&self, event: &SchedulerEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().expect("listener registry poisoned");
            listeners
                .iter()
                .filter(|r| r.mask.intersects(kind))
                .map(|r| Arc::clone(&r.callback))
                .collect()
        };

        for callback in targets {
            guarded("event listener", || callback(event));
        }
    }

    pub fn dispatch_all(&self, events: impl IntoIterator<Item = SchedulerEvent>) {
        for event in events {
            self.dispatch(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Run user code, logging instead of propagating a panic.
pub(crate) fn guarded<F: FnOnce()>(label: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(what = label, panic = %panic_message(panic.as_ref()), "callback panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn masks_are_disjoint_bits() {
        let all = [
            EventMask::SCHEDULER_STARTED,
            EventMask::SCHEDULER_STOPPED,
            EventMask::SCHEDULER_PAUSED,
            EventMask::SCHEDULER_RESUMED,
            EventMask::JOB_ADDED,
            EventMask::JOB_REMOVED,
            EventMask::JOB_MODIFIED,
            EventMask::JOB_SUBMITTED,
            EventMask::JOB_MAX_INSTANCES,
            EventMask::JOB_EXECUTED,
            EventMask::JOB_ERROR,
            EventMask::JOB_TERMINATED,
        ];
        let mut union = EventMask::NONE;
        for mask in all {
            assert_eq!(mask.bits().count_ones(), 1);
            assert!(!union.intersects(mask));
            union |= mask;
        }
        assert_eq!(union, EventMask::ALL);
        assert_eq!(EventMask::JOB_ERROR.to_string(), "job_error");
    }

    #[test]
    fn dispatch_respects_masks() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.add_listener(EventMask::JOB_ADDED | EventMask::JOB_REMOVED, move |ev| {
            s.lock().unwrap().push(ev.kind());
        });

        bus.dispatch(&SchedulerEvent::job(EventMask::JOB_ADDED, "a"));
        bus.dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_STARTED));
        bus.dispatch(&SchedulerEvent::job(EventMask::JOB_REMOVED, "a"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventMask::JOB_ADDED, EventMask::JOB_REMOVED]
        );
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        bus.add_listener(EventMask::ALL, |_| panic!("listener blew up"));
        let c = Arc::clone(&count);
        bus.add_listener(EventMask::ALL, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_STARTED));
        bus.dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_STOPPED));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_can_remove_itself_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let id_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let b = Arc::clone(&bus);
        let slot = Arc::clone(&id_slot);
        let c = Arc::clone(&count);
        let id = bus.add_listener(EventMask::ALL, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock().unwrap() {
                b.remove_listener(id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        bus.dispatch(&SchedulerEvent::job(EventMask::JOB_ADDED, "a"));
        bus.dispatch(&SchedulerEvent::job(EventMask::JOB_ADDED, "b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.remove_listener(id));
    }
}
