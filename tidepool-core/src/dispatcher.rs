//! Single-threaded cooperative dispatcher.
//!
//! The dispatcher owns a FIFO ready queue shared by two kinds of work:
//!
//! - **Readiness waits**: one-shot registrations for a condition on a channel
//!   endpoint. When the fabric reports that the condition holds, the wait is
//!   latched onto the ready queue. It runs at most once.
//! - **Posted tasks**: plain closures queued with [`Dispatcher::post`].
//!
//! No `RefCell` borrow is held while a callback runs, so callbacks may
//! register, cancel, post or close freely.
//!
//! ```text
//!  register_read ──► waits ──signal()──► ready ──step()──► callback
//!  post ─────────────────────────────────┘
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::Notify;
use tracing::{debug, instrument, trace};

use crate::channel::{ChannelHandle, EndpointId};
use crate::signals::Signals;

/// Identifier of one readiness registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait#{}", self.0)
    }
}

/// Counters describing dispatcher activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Posted tasks executed.
    pub tasks_run: u64,
    /// Readiness callbacks executed.
    pub waits_fired: u64,
    /// Registrations removed before firing.
    pub waits_cancelled: u64,
}

type WaitCallback = Box<dyn FnOnce(Signals)>;
type Task = Box<dyn FnOnce()>;

struct PendingWait {
    endpoint: EndpointId,
    trigger: Signals,
    callback: WaitCallback,
    latched: bool,
    observed: Signals,
}

enum ReadyItem {
    Wait(WaitId),
    Task(Task),
}

struct DispatcherInner {
    next_wait: u64,
    waits: BTreeMap<WaitId, PendingWait>,
    ready: VecDeque<ReadyItem>,
    notify: Rc<Notify>,
    shutdown: bool,
    stats: DispatcherStats,
}

/// Handle to a cooperative event loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<RefCell<DispatcherInner>>,
}

/// Non-owning reference to a [`Dispatcher`].
#[derive(Clone, Debug, Default)]
pub struct WeakDispatcher {
    inner: Weak<RefCell<DispatcherInner>>,
}

impl WeakDispatcher {
    /// Upgrade to a strong handle if the dispatcher is still alive.
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Dispatcher")
            .field("waits", &inner.waits.len())
            .field("ready", &inner.ready.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create an idle dispatcher.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DispatcherInner {
                next_wait: 0,
                waits: BTreeMap::new(),
                ready: VecDeque::new(),
                notify: Rc::new(Notify::new()),
                shutdown: false,
                stats: DispatcherStats::default(),
            })),
        }
    }

    /// Create a non-owning reference.
    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Fire `callback` once when `channel` is readable or its peer closed.
    pub fn register_read<F>(&self, channel: &ChannelHandle, callback: F) -> WaitId
    where
        F: FnOnce(Signals) + 'static,
    {
        self.register(
            channel,
            Signals::READABLE | Signals::PEER_CLOSED,
            Box::new(callback),
        )
    }

    /// Fire `callback` once when `channel` is writable or its peer closed.
    pub fn register_write<F>(&self, channel: &ChannelHandle, callback: F) -> WaitId
    where
        F: FnOnce(Signals) + 'static,
    {
        self.register(
            channel,
            Signals::WRITABLE | Signals::PEER_CLOSED,
            Box::new(callback),
        )
    }

    fn register(&self, channel: &ChannelHandle, trigger: Signals, callback: WaitCallback) -> WaitId {
        // Read the endpoint state before borrowing ourselves.
        let current = channel.signals();
        let endpoint = channel.id();

        let mut inner = self.inner.borrow_mut();
        inner.next_wait += 1;
        let id = WaitId(inner.next_wait);
        let latched = current.intersects(trigger);
        inner.waits.insert(
            id,
            PendingWait {
                endpoint,
                trigger,
                callback,
                latched,
                observed: if latched { current } else { Signals::NONE },
            },
        );
        trace!("registered {} on {} for {:?}", id, endpoint, trigger);
        if latched {
            inner.ready.push_back(ReadyItem::Wait(id));
            inner.notify.notify_one();
        }
        id
    }

    /// Remove every registration on `channel`, including latched ones.
    ///
    /// Returns the number of registrations removed.
    pub fn cancel(&self, channel: &ChannelHandle) -> usize {
        self.cancel_endpoint(channel.id())
    }

    pub(crate) fn cancel_endpoint(&self, endpoint: EndpointId) -> usize {
        // Callbacks may own channel endpoints whose drop re-enters the
        // dispatcher, so they are dropped after the borrow ends.
        let removed: Vec<PendingWait> = {
            let mut inner = self.inner.borrow_mut();
            let ids: Vec<WaitId> = inner
                .waits
                .iter()
                .filter(|(_, wait)| wait.endpoint == endpoint)
                .map(|(id, _)| *id)
                .collect();
            let removed: Vec<PendingWait> = ids
                .iter()
                .filter_map(|id| inner.waits.remove(id))
                .collect();
            inner.stats.waits_cancelled += removed.len() as u64;
            removed
        };
        if !removed.is_empty() {
            trace!("cancelled {} waits on {}", removed.len(), endpoint);
        }
        removed.len()
    }

    /// Remove one registration. Returns false if it already fired or never existed.
    pub fn cancel_wait(&self, id: WaitId) -> bool {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let removed = inner.waits.remove(&id);
            if removed.is_some() {
                inner.stats.waits_cancelled += 1;
            }
            removed
        };
        removed.is_some()
    }

    /// Returns true while `id` is registered and has not run.
    pub fn is_pending(&self, id: WaitId) -> bool {
        self.inner.borrow().waits.contains_key(&id)
    }

    /// Queue a task behind everything already ready.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.ready.push_back(ReadyItem::Task(Box::new(task)));
        inner.notify.notify_one();
    }

    /// Report the current signals of `endpoint`, latching matching waits.
    pub(crate) fn signal(&self, endpoint: EndpointId, signals: Signals) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mut latched_any = false;
        for (id, wait) in inner.waits.iter_mut() {
            if wait.endpoint == endpoint && !wait.latched && signals.intersects(wait.trigger) {
                wait.latched = true;
                wait.observed = signals;
                inner.ready.push_back(ReadyItem::Wait(*id));
                latched_any = true;
            }
        }
        if latched_any {
            trace!("{} latched with {:?}", endpoint, signals);
            inner.notify.notify_one();
        }
    }

    /// Run one ready item. Returns false if nothing was ready.
    #[instrument(skip(self))]
    pub fn step(&self) -> bool {
        let item = self.inner.borrow_mut().ready.pop_front();
        match item {
            None => false,
            Some(ReadyItem::Task(task)) => {
                self.inner.borrow_mut().stats.tasks_run += 1;
                task();
                true
            }
            Some(ReadyItem::Wait(id)) => {
                let fired = {
                    let mut inner = self.inner.borrow_mut();
                    let wait = inner.waits.remove(&id);
                    if wait.is_some() {
                        inner.stats.waits_fired += 1;
                    }
                    wait
                };
                // A missing entry means the wait was cancelled after latching.
                if let Some(wait) = fired {
                    trace!("firing {} with {:?}", id, wait.observed);
                    (wait.callback)(wait.observed);
                }
                true
            }
        }
    }

    /// Run ready items until none remain. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    /// Drive the loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Parks on a [`Notify`] whenever the ready queue is empty.
    pub async fn run(&self) {
        debug!("dispatcher run loop started");
        loop {
            self.run_until_idle();
            let (notify, shutdown) = {
                let inner = self.inner.borrow();
                (inner.notify.clone(), inner.shutdown)
            };
            if shutdown {
                break;
            }
            notify.notified().await;
        }
        debug!("dispatcher run loop stopped");
    }

    /// Make [`run`](Self::run) return once the current batch finishes.
    pub fn shutdown(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.shutdown = true;
        inner.notify.notify_one();
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.borrow().shutdown
    }

    /// Number of items waiting in the ready queue (including suppressed ones).
    pub fn ready_len(&self) -> usize {
        self.inner.borrow().ready.len()
    }

    /// Number of registrations that have not run yet.
    pub fn pending_waits(&self) -> usize {
        self.inner.borrow().waits.len()
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> DispatcherStats {
        self.inner.borrow().stats.clone()
    }
}
