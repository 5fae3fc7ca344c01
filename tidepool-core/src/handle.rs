//! Generic resource handles and the space that allocates them.
//!
//! A [`HandleSpace`] plays the role of the kernel's handle table for one
//! process: it hands out [`RawHandle`] values, remembers the object kind and
//! rights behind each, and records every close. Nothing here is global; each
//! space is an explicit context object passed to whoever needs it.
//!
//! Two ownership forms exist:
//!
//! - [`Handle`] owns its value and closes it when dropped. Frames carry these.
//! - [`HandleInfo`] is the raw, non-owning form used in wire-codec handle
//!   tables, where closing goes through a coding configuration instead of `Drop`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::error::HandleError;

/// Raw numeric handle value. Zero is never allocated and means "invalid".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle(u32);

impl Default for RawHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl RawHandle {
    /// The invalid handle value.
    pub const INVALID: RawHandle = RawHandle(0);

    /// Wraps a raw value.
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Returns true for the invalid value.
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of object a handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HandleKind {
    /// No object (invalid handle slots).
    #[default]
    None,
    /// A signalable event.
    Event,
    /// A memory object.
    Vmo,
    /// A stream socket.
    Socket,
    /// A message channel endpoint.
    Channel,
}

/// Rights attached to a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rights(u32);

impl Rights {
    /// No rights at all.
    pub const NONE: Rights = Rights(0);
    /// May be duplicated.
    pub const DUPLICATE: Rights = Rights(1 << 0);
    /// May be sent over a channel.
    pub const TRANSFER: Rights = Rights(1 << 1);
    /// May be read from.
    pub const READ: Rights = Rights(1 << 2);
    /// May be written to.
    pub const WRITE: Rights = Rights(1 << 3);
    /// May be signaled.
    pub const SIGNAL: Rights = Rights(1 << 4);
    /// Rights new handles receive unless told otherwise.
    pub const BASIC: Rights = Rights(0b1_1111);

    /// Builds rights from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every right in `other` is present.
    pub const fn contains(self, other: Rights) -> bool {
        self.0 & other.0 == other.0
    }

    /// Rights present in both sets.
    pub const fn intersection(self, other: Rights) -> Rights {
        Rights(self.0 & other.0)
    }
}

impl BitOr for Rights {
    type Output = Rights;

    fn bitor(self, rhs: Rights) -> Rights {
        Rights(self.0 | rhs.0)
    }
}

/// Raw, non-owning description of a handle: value, object kind and rights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct HandleInfo {
    /// The handle value.
    pub raw: RawHandle,
    /// The kind of object referenced.
    pub kind: HandleKind,
    /// Rights held through this handle.
    pub rights: Rights,
}

impl HandleInfo {
    /// An invalid slot.
    pub const fn invalid() -> Self {
        Self {
            raw: RawHandle::INVALID,
            kind: HandleKind::None,
            rights: Rights::NONE,
        }
    }

    /// Returns true if the slot holds no handle.
    pub const fn is_invalid(&self) -> bool {
        self.raw.is_invalid()
    }

    /// Moves the handle out, leaving an invalid slot behind.
    pub fn take(&mut self) -> HandleInfo {
        std::mem::replace(self, HandleInfo::invalid())
    }
}

#[derive(Debug, Clone, Copy)]
struct HandleRecord {
    kind: HandleKind,
    rights: Rights,
}

#[derive(Debug, Default)]
struct SpaceInner {
    next_value: u32,
    open: HashMap<RawHandle, HandleRecord>,
    close_counts: HashMap<RawHandle, u32>,
    rejected_closes: u64,
}

impl SpaceInner {
    fn close(&mut self, raw: RawHandle) -> Result<(), HandleError> {
        if self.open.remove(&raw).is_none() {
            self.rejected_closes += 1;
            tracing::debug!("close of unknown or already closed handle {}", raw);
            return Err(HandleError::BadHandle(raw));
        }
        *self.close_counts.entry(raw).or_insert(0) += 1;
        tracing::trace!("closed handle {}", raw);
        Ok(())
    }
}

/// Allocator and close-accounting table for [`Handle`]s.
///
/// Cloning yields another reference to the same space.
#[derive(Debug, Clone, Default)]
pub struct HandleSpace {
    inner: Rc<RefCell<SpaceInner>>,
}

impl HandleSpace {
    /// Creates an empty space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new handle for an object of `kind` with `rights`.
    pub fn create(&self, kind: HandleKind, rights: Rights) -> Handle {
        let mut inner = self.inner.borrow_mut();
        inner.next_value += 1;
        let raw = RawHandle(inner.next_value);
        inner.open.insert(raw, HandleRecord { kind, rights });
        Handle {
            info: HandleInfo { raw, kind, rights },
            space: Rc::downgrade(&self.inner),
        }
    }

    /// Closes a raw handle.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::BadHandle`] if the value is not open, which
    /// includes a second close of the same value.
    pub fn close(&self, raw: RawHandle) -> Result<(), HandleError> {
        self.inner.borrow_mut().close(raw)
    }

    /// Takes ownership of a raw handle again, e.g. after decoding.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::BadHandle`] if the value is not open.
    pub fn adopt(&self, info: HandleInfo) -> Result<Handle, HandleError> {
        let inner = self.inner.borrow();
        let record = inner
            .open
            .get(&info.raw)
            .ok_or(HandleError::BadHandle(info.raw))?;
        Ok(Handle {
            info: HandleInfo {
                raw: info.raw,
                kind: record.kind,
                rights: info.rights,
            },
            space: Rc::downgrade(&self.inner),
        })
    }

    /// Looks up the kind and rights behind an open value.
    pub fn info(&self, raw: RawHandle) -> Option<HandleInfo> {
        self.inner.borrow().open.get(&raw).map(|record| HandleInfo {
            raw,
            kind: record.kind,
            rights: record.rights,
        })
    }

    /// Returns true if `raw` is currently open.
    pub fn is_open(&self, raw: RawHandle) -> bool {
        self.inner.borrow().open.contains_key(&raw)
    }

    /// Number of handles currently open.
    pub fn open_count(&self) -> usize {
        self.inner.borrow().open.len()
    }

    /// How many times `raw` has been successfully closed (0 or 1).
    pub fn close_count(&self, raw: RawHandle) -> u32 {
        self.inner
            .borrow()
            .close_counts
            .get(&raw)
            .copied()
            .unwrap_or(0)
    }

    /// Number of closes rejected because the value was not open.
    pub fn rejected_closes(&self) -> u64 {
        self.inner.borrow().rejected_closes
    }
}

/// An owned handle. Dropping it closes the underlying value exactly once.
#[derive(Debug)]
pub struct Handle {
    info: HandleInfo,
    space: Weak<RefCell<SpaceInner>>,
}

impl Handle {
    /// The raw value.
    pub fn raw(&self) -> RawHandle {
        self.info.raw
    }

    /// The object kind.
    pub fn kind(&self) -> HandleKind {
        self.info.kind
    }

    /// The rights held.
    pub fn rights(&self) -> Rights {
        self.info.rights
    }

    /// Gives up ownership, returning the raw description.
    ///
    /// The caller becomes responsible for closing the value.
    pub fn into_info(mut self) -> HandleInfo {
        self.info.take()
    }

    /// Closes the handle now, reporting whether the space accepted the close.
    pub fn close(mut self) -> Result<(), HandleError> {
        let info = self.info.take();
        let space = self.space.upgrade().ok_or(HandleError::SpaceGone)?;
        space.borrow_mut().close(info.raw)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.info.is_invalid() {
            return;
        }
        if let Some(space) = self.space.upgrade()
            && let Err(error) = space.borrow_mut().close(self.info.raw)
        {
            tracing::warn!("dropped handle {} was not open: {}", self.info.raw, error);
        }
    }
}
