//! Sets of (implementation, transport) bindings with automatic removal.
//!
//! A [`BindingSet`] owns every transport added to it. When a transport closes
//! on its own (peer closed, I/O error) the entry removes itself and the set's
//! error handler is told. Removal by the owner ([`BindingSet::erase_by_id`],
//! [`BindingSet::clear`]) closes the transport silently.
//!
//! The entry table sits behind a single `RefCell`. It is never borrowed while
//! a transport is closed or a handler runs, so handlers may re-enter the set.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tidepool_core::{Dispatcher, Frame, WeakDispatcher};
use tracing::debug;

use crate::relay::{CloseReason, Phase, Transport};

/// Identifier of one entry. Increases monotonically; never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl BindingId {
    /// Returns the raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Receives frames routed by [`BindingSet::bind`].
pub trait MessageReceiver {
    /// Handle one inbound frame. `reply` is the transport it arrived on.
    fn receive(&self, frame: Frame, reply: &Transport);
}

/// A transport that could not be added. Both objects are handed back.
#[derive(Error)]
#[error("cannot add a transport in phase {phase:?}")]
pub struct AddError<I> {
    phase: Phase,
    implementation: Rc<I>,
    transport: Transport,
}

impl<I> AddError<I> {
    /// Phase the transport was in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Recover the implementation and the transport.
    pub fn into_parts(self) -> (Rc<I>, Transport) {
        (self.implementation, self.transport)
    }
}

impl<I> fmt::Debug for AddError<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddError")
            .field("phase", &self.phase)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

struct Binding<I> {
    implementation: Rc<I>,
    transport: Rc<Transport>,
}

type ErrorHandler = Rc<dyn Fn(BindingId, CloseReason)>;
type EmptyHandler = Rc<dyn Fn()>;

struct SetInner<I> {
    entries: BTreeMap<BindingId, Binding<I>>,
    next_id: u64,
    on_error: Option<ErrorHandler>,
    on_empty: Option<EmptyHandler>,
}

/// Collection of implementation objects paired with their transports.
pub struct BindingSet<I: 'static> {
    inner: Rc<RefCell<SetInner<I>>>,
    dispatcher: WeakDispatcher,
}

impl<I: 'static> BindingSet<I> {
    /// Create an empty set. Deferred removals are posted to `dispatcher`.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SetInner {
                entries: BTreeMap::new(),
                next_id: 0,
                on_error: None,
                on_empty: None,
            })),
            dispatcher: dispatcher.downgrade(),
        }
    }

    /// Take ownership of `transport` paired with `implementation`.
    ///
    /// The entry removes itself when the transport closes. A transport that
    /// is already closed is accepted; its removal is posted to the dispatcher
    /// so it runs after this call returns the id.
    ///
    /// # Errors
    ///
    /// Rejects an unbound transport, handing both objects back.
    pub fn add(&self, implementation: Rc<I>, transport: Transport) -> Result<BindingId, AddError<I>> {
        self.insert(implementation, transport, |_, _| {})
    }

    fn insert<F>(
        &self,
        implementation: Rc<I>,
        transport: Transport,
        prepare: F,
    ) -> Result<BindingId, AddError<I>>
    where
        F: FnOnce(&Rc<I>, &Rc<Transport>),
    {
        let phase = transport.phase();
        if phase == Phase::Unbound {
            return Err(AddError {
                phase,
                implementation,
                transport,
            });
        }

        let transport = Rc::new(transport);
        prepare(&implementation, &transport);

        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            let id = BindingId(inner.next_id);
            inner.entries.insert(
                id,
                Binding {
                    implementation,
                    transport: transport.clone(),
                },
            );
            id
        };
        debug!("added {} ({:?})", id, phase);

        let set = Rc::downgrade(&self.inner);
        if phase == Phase::Bound {
            transport.set_close_handler(move |reason| organic_close(&set, id, reason));
        } else {
            let reason = transport.close_reason().unwrap_or(CloseReason::Requested);
            match self.dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.post(move || organic_close(&set, id, reason)),
                None => organic_close(&set, id, reason),
            }
        }
        Ok(id)
    }

    /// Remove an entry and close its transport without firing any handler.
    ///
    /// Returns whether an entry was removed.
    pub fn erase_by_id(&self, id: BindingId) -> bool {
        let removed = self.inner.borrow_mut().entries.remove(&id);
        match removed {
            Some(binding) => {
                debug!("erasing {}", id);
                silence_and_close(binding);
                true
            }
            None => false,
        }
    }

    /// Close every transport and remove every entry. No handler fires.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        if !entries.is_empty() {
            debug!("clearing {} bindings", entries.len());
        }
        for binding in entries.into_values() {
            silence_and_close(binding);
        }
    }

    /// Called with the id and reason whenever a transport closes on its own.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(BindingId, CloseReason) + 'static,
    {
        let _previous = self.inner.borrow_mut().on_error.replace(Rc::new(handler));
    }

    /// Called when a transport closing on its own leaves the set empty.
    pub fn set_empty_set_handler<F>(&self, handler: F)
    where
        F: Fn() + 'static,
    {
        let _previous = self.inner.borrow_mut().on_empty.replace(Rc::new(handler));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Returns true if `id` is present.
    pub fn contains(&self, id: BindingId) -> bool {
        self.inner.borrow().entries.contains_key(&id)
    }

    /// Implementation bound under `id`.
    pub fn get(&self, id: BindingId) -> Option<Rc<I>> {
        self.inner
            .borrow()
            .entries
            .get(&id)
            .map(|binding| binding.implementation.clone())
    }

    /// Transport bound under `id`.
    pub fn transport(&self, id: BindingId) -> Option<Rc<Transport>> {
        self.inner
            .borrow()
            .entries
            .get(&id)
            .map(|binding| binding.transport.clone())
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<BindingId> {
        self.inner.borrow().entries.keys().copied().collect()
    }

    /// Snapshot of (id, implementation) pairs in insertion order.
    pub fn entries(&self) -> Vec<(BindingId, Rc<I>)> {
        self.inner
            .borrow()
            .entries
            .iter()
            .map(|(id, binding)| (*id, binding.implementation.clone()))
            .collect()
    }
}

impl<I: MessageReceiver + 'static> BindingSet<I> {
    /// Like [`add`](Self::add), and route every inbound frame to
    /// `implementation`.
    ///
    /// # Errors
    ///
    /// Rejects an unbound transport, handing both objects back.
    pub fn bind(&self, implementation: Rc<I>, transport: Transport) -> Result<BindingId, AddError<I>> {
        self.insert(implementation, transport, |target, transport| {
            let target = target.clone();
            let reply = Rc::downgrade(transport);
            transport.set_message_handler(move |frame| {
                if let Some(reply) = reply.upgrade() {
                    target.receive(frame, &reply);
                }
            });
        })
    }
}

impl<I: 'static> fmt::Debug for BindingSet<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSet")
            .field("ids", &self.ids())
            .finish()
    }
}

impl<I: 'static> Drop for BindingSet<I> {
    fn drop(&mut self) {
        self.clear();
    }
}

fn silence_and_close<I>(binding: Binding<I>) {
    binding.transport.clear_close_handler();
    binding.transport.close();
}

fn organic_close<I>(set: &Weak<RefCell<SetInner<I>>>, id: BindingId, reason: CloseReason) {
    let Some(inner) = set.upgrade() else {
        return;
    };
    let (removed, on_error, on_empty) = {
        let mut inner = inner.borrow_mut();
        let removed = inner.entries.remove(&id);
        let emptied = removed.is_some() && inner.entries.is_empty();
        let on_empty = if emptied { inner.on_empty.clone() } else { None };
        (removed, inner.on_error.clone(), on_empty)
    };
    let Some(binding) = removed else {
        return;
    };
    debug!("{} closed: {}", id, reason);
    drop(binding);

    if let Some(handler) = on_error {
        handler(id, reason);
    }
    if let Some(handler) = on_empty {
        handler();
    }
}
