//! In-process message channels.
//!
//! A [`ChannelFabric`] creates connected pairs of [`ChannelHandle`]s. Each
//! endpoint owns a bounded inbound queue of [`Frame`]s; writing to one end
//! appends to the other end's queue. Every state change is reported to the
//! fabric's [`Dispatcher`](crate::Dispatcher), which latches readiness waits.
//!
//! # Endpoint signals
//!
//! | Signal        | Holds when                                                  |
//! |---------------|-------------------------------------------------------------|
//! | `READABLE`    | inbound queue non-empty (or a fault is pending)             |
//! | `WRITABLE`    | peer open and its inbound queue below `max_pending_frames`  |
//! | `PEER_CLOSED` | the opposite endpoint has been closed                       |

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ChannelConfig;
use crate::dispatcher::{Dispatcher, WeakDispatcher};
use crate::error::{ChannelError, ChannelResult};
use crate::handle::Handle;
use crate::signals::Signals;

/// Identity of one channel endpoint within its fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Returns the raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// One logical unit of bytes plus attached handles.
#[derive(Debug, Default)]
pub struct Frame {
    /// Payload bytes.
    pub bytes: Vec<u8>,
    /// Handles transferred with the payload.
    pub handles: Vec<Handle>,
}

impl Frame {
    /// Build a frame from bytes and handles.
    pub fn new(bytes: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { bytes, handles }
    }

    /// Build a handle-less frame.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            handles: Vec::new(),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split into bytes and handles.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Handle>) {
        (self.bytes, self.handles)
    }
}

/// A failed write. The frame is handed back untouched.
#[derive(Error, Debug)]
#[error("write rejected: {error}")]
pub struct WriteRejected {
    /// Why the write failed.
    pub error: ChannelError,
    /// The frame that was not written.
    pub frame: Frame,
}

struct EndpointState {
    peer: EndpointId,
    inbound: VecDeque<Frame>,
    fault: Option<String>,
}

struct FabricInner {
    config: ChannelConfig,
    dispatcher: WeakDispatcher,
    endpoints: HashMap<EndpointId, EndpointState>,
    next_id: u64,
    live_pairs: usize,
}

impl FabricInner {
    fn signals_of(&self, id: EndpointId) -> Signals {
        let Some(state) = self.endpoints.get(&id) else {
            return Signals::NONE;
        };
        let mut signals = Signals::NONE;
        if !state.inbound.is_empty() {
            signals |= Signals::READABLE;
        }
        if state.fault.is_some() {
            signals |= Signals::READABLE | Signals::WRITABLE;
        }
        match self.endpoints.get(&state.peer) {
            Some(peer) if peer.inbound.len() < self.config.max_pending_frames => {
                signals |= Signals::WRITABLE;
            }
            Some(_) => {}
            None => signals |= Signals::PEER_CLOSED,
        }
        signals
    }
}

/// Factory and backing store for channel pairs.
///
/// Cloning yields another reference to the same fabric.
#[derive(Clone)]
pub struct ChannelFabric {
    inner: Rc<RefCell<FabricInner>>,
}

impl fmt::Debug for ChannelFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ChannelFabric")
            .field("endpoints", &inner.endpoints.len())
            .field("live_pairs", &inner.live_pairs)
            .finish()
    }
}

impl ChannelFabric {
    /// Create a fabric that reports signal changes to `dispatcher`.
    pub fn new(dispatcher: &Dispatcher, config: ChannelConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FabricInner {
                config,
                dispatcher: dispatcher.downgrade(),
                endpoints: HashMap::new(),
                next_id: 0,
                live_pairs: 0,
            })),
        }
    }

    /// Create a connected pair of endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ResourceExhausted`] when `max_channels` pairs
    /// are already alive.
    pub fn create(&self) -> ChannelResult<(ChannelHandle, ChannelHandle)> {
        let mut inner = self.inner.borrow_mut();
        if let Some(limit) = inner.config.max_channels
            && inner.live_pairs >= limit
        {
            return Err(ChannelError::ResourceExhausted {
                live: inner.live_pairs,
                limit,
            });
        }

        let a = EndpointId(inner.next_id + 1);
        let b = EndpointId(inner.next_id + 2);
        inner.next_id += 2;
        inner.live_pairs += 1;
        inner.endpoints.insert(
            a,
            EndpointState {
                peer: b,
                inbound: VecDeque::new(),
                fault: None,
            },
        );
        inner.endpoints.insert(
            b,
            EndpointState {
                peer: a,
                inbound: VecDeque::new(),
                fault: None,
            },
        );
        debug!("created channel pair {} <-> {}", a, b);

        let fabric = Rc::downgrade(&self.inner);
        Ok((
            ChannelHandle {
                id: a,
                fabric: fabric.clone(),
                closed: false,
            },
            ChannelHandle {
                id: b,
                fabric,
                closed: false,
            },
        ))
    }

    /// Make the next read or write on `endpoint` fail with [`ChannelError::Io`].
    ///
    /// Returns false if the endpoint is not open.
    pub fn inject_io_error(&self, endpoint: EndpointId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let signals = {
            let mut inner = self.inner.borrow_mut();
            let Some(state) = inner.endpoints.get_mut(&endpoint) else {
                return false;
            };
            debug!("injecting fault on {}: {}", endpoint, reason);
            state.fault = Some(reason);
            inner.signals_of(endpoint)
        };
        Self::notify(&self.inner, &[(endpoint, signals)]);
        true
    }

    /// Frames queued towards `endpoint` and not yet read.
    pub fn pending_frames(&self, endpoint: EndpointId) -> usize {
        self.inner
            .borrow()
            .endpoints
            .get(&endpoint)
            .map(|state| state.inbound.len())
            .unwrap_or(0)
    }

    /// Pairs with at least one open endpoint.
    pub fn live_channels(&self) -> usize {
        self.inner.borrow().live_pairs
    }

    /// The limits this fabric enforces.
    pub fn config(&self) -> ChannelConfig {
        self.inner.borrow().config.clone()
    }

    /// The dispatcher receiving signal changes, if still alive.
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.inner.borrow().dispatcher.upgrade()
    }

    fn notify(inner: &Rc<RefCell<FabricInner>>, changes: &[(EndpointId, Signals)]) {
        let dispatcher = inner.borrow().dispatcher.upgrade();
        if let Some(dispatcher) = dispatcher {
            for (endpoint, signals) in changes {
                dispatcher.signal(*endpoint, *signals);
            }
        }
    }
}

/// One end of a channel. Move-only; dropping it closes the endpoint.
#[derive(Debug)]
pub struct ChannelHandle {
    id: EndpointId,
    fabric: Weak<RefCell<FabricInner>>,
    closed: bool,
}

impl ChannelHandle {
    /// Identity of this endpoint.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current readiness of this endpoint. Closed endpoints report nothing.
    pub fn signals(&self) -> Signals {
        if self.closed {
            return Signals::NONE;
        }
        match self.fabric.upgrade() {
            Some(fabric) => fabric.borrow().signals_of(self.id),
            None => Signals::NONE,
        }
    }

    /// Read the next frame without blocking.
    ///
    /// Returns `Ok(None)` if nothing is queued and the peer is open. Frames
    /// queued before the peer closed are still returned; `PeerClosed` is
    /// reported once they are drained.
    pub fn try_read(&self) -> ChannelResult<Option<Frame>> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let fabric = self.fabric.upgrade().ok_or(ChannelError::Closed)?;
        let (frame, peer_change) = {
            let mut inner = fabric.borrow_mut();
            let state = inner
                .endpoints
                .get_mut(&self.id)
                .ok_or(ChannelError::Closed)?;
            if let Some(reason) = state.fault.take() {
                return Err(ChannelError::Io(reason));
            }
            let peer = state.peer;
            match state.inbound.pop_front() {
                Some(frame) => {
                    trace!("{} read {} bytes", self.id, frame.len());
                    let peer_signals = inner.signals_of(peer);
                    (frame, (peer, peer_signals))
                }
                None if inner.endpoints.contains_key(&peer) => return Ok(None),
                None => return Err(ChannelError::PeerClosed),
            }
        };
        ChannelFabric::notify(&fabric, &[peer_change]);
        Ok(Some(frame))
    }

    /// Write a frame without blocking.
    ///
    /// # Errors
    ///
    /// On any failure the frame comes back inside [`WriteRejected`].
    /// `WouldBlock` means the peer's queue is full.
    pub fn try_write(&self, frame: Frame) -> Result<(), WriteRejected> {
        let reject = |error, frame| Err(WriteRejected { error, frame });
        if self.closed {
            return reject(ChannelError::Closed, frame);
        }
        let Some(fabric) = self.fabric.upgrade() else {
            return reject(ChannelError::Closed, frame);
        };
        let peer_change = {
            let mut inner = fabric.borrow_mut();
            let max_bytes = inner.config.max_message_bytes;
            let max_handles = inner.config.max_message_handles;
            let max_pending = inner.config.max_pending_frames;

            let Some(state) = inner.endpoints.get_mut(&self.id) else {
                return reject(ChannelError::Closed, frame);
            };
            if let Some(reason) = state.fault.take() {
                return reject(ChannelError::Io(reason), frame);
            }
            if frame.len() > max_bytes {
                let error = ChannelError::FrameTooLarge {
                    size: frame.len(),
                    max: max_bytes,
                };
                return reject(error, frame);
            }
            if frame.handles.len() > max_handles {
                let error = ChannelError::TooManyHandles {
                    count: frame.handles.len(),
                    max: max_handles,
                };
                return reject(error, frame);
            }
            let peer = state.peer;
            let Some(peer_state) = inner.endpoints.get_mut(&peer) else {
                return reject(ChannelError::PeerClosed, frame);
            };
            if peer_state.inbound.len() >= max_pending {
                return reject(ChannelError::WouldBlock, frame);
            }
            trace!("{} wrote {} bytes to {}", self.id, frame.len(), peer);
            peer_state.inbound.push_back(frame);
            (peer, inner.signals_of(peer))
        };
        ChannelFabric::notify(&fabric, &[peer_change]);
        Ok(())
    }

    /// Close the endpoint. A second call does nothing.
    ///
    /// Frames queued towards this endpoint are dropped along with their
    /// handles, pending waits on it are cancelled, and the peer observes
    /// `PEER_CLOSED`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };
        let (dropped, peer_change, dispatcher) = {
            let mut inner = fabric.borrow_mut();
            let Some(state) = inner.endpoints.remove(&self.id) else {
                return;
            };
            let peer_change = if inner.endpoints.contains_key(&state.peer) {
                Some((state.peer, inner.signals_of(state.peer)))
            } else {
                inner.live_pairs -= 1;
                None
            };
            debug!(
                "closed {} ({} unread frames dropped)",
                self.id,
                state.inbound.len()
            );
            (state.inbound, peer_change, inner.dispatcher.upgrade())
        };
        // Handles in unread frames close here, outside the fabric borrow.
        drop(dropped);
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel_endpoint(self.id);
        }
        if let Some(change) = peer_change {
            ChannelFabric::notify(&fabric, &[change]);
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleKind, HandleSpace, Rights};

    fn fabric_with(config: ChannelConfig) -> (Dispatcher, ChannelFabric) {
        let dispatcher = Dispatcher::new();
        let fabric = ChannelFabric::new(&dispatcher, config);
        (dispatcher, fabric)
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let (_dispatcher, fabric) = fabric_with(ChannelConfig::default());
        let (a, b) = fabric.create().expect("create pair");

        a.try_write(Frame::from_bytes("abc")).expect("write");
        a.try_write(Frame::from_bytes("de")).expect("write");

        let first = b.try_read().expect("read").expect("frame");
        let second = b.try_read().expect("read").expect("frame");
        assert_eq!(first.bytes, b"abc");
        assert_eq!(second.bytes, b"de");
        assert!(b.try_read().expect("read").is_none());
    }

    #[test]
    fn test_full_peer_queue_returns_frame() {
        let config = ChannelConfig::default().with_max_pending_frames(1);
        let (_dispatcher, fabric) = fabric_with(config);
        let (a, b) = fabric.create().expect("create pair");

        a.try_write(Frame::from_bytes("one")).expect("write");
        assert!(!a.signals().contains(Signals::WRITABLE));

        let rejected = a.try_write(Frame::from_bytes("two")).expect_err("full");
        assert_eq!(rejected.error, ChannelError::WouldBlock);
        assert_eq!(rejected.frame.bytes, b"two");

        b.try_read().expect("read");
        assert!(a.signals().contains(Signals::WRITABLE));
    }

    #[test]
    fn test_queued_frames_survive_peer_close() {
        let (_dispatcher, fabric) = fabric_with(ChannelConfig::default());
        let (mut a, b) = fabric.create().expect("create pair");

        a.try_write(Frame::from_bytes("last words")).expect("write");
        a.close();
        a.close();

        assert!(b.signals().contains(Signals::PEER_CLOSED | Signals::READABLE));
        let frame = b.try_read().expect("read").expect("frame");
        assert_eq!(frame.bytes, b"last words");
        assert_eq!(b.try_read().expect_err("drained"), ChannelError::PeerClosed);
        assert_eq!(
            b.try_write(Frame::from_bytes("x")).expect_err("peer gone").error,
            ChannelError::PeerClosed
        );
    }

    #[test]
    fn test_close_drops_unread_handles() {
        let (_dispatcher, fabric) = fabric_with(ChannelConfig::default());
        let space = HandleSpace::new();
        let (a, mut b) = fabric.create().expect("create pair");

        let handle = space.create(HandleKind::Event, Rights::BASIC);
        let raw = handle.raw();
        a.try_write(Frame::new(b"h".to_vec(), vec![handle]))
            .expect("write");
        assert!(space.is_open(raw));

        b.close();
        assert!(!space.is_open(raw));
        assert_eq!(space.close_count(raw), 1);
    }

    #[test]
    fn test_limits_reject_oversized_frames() {
        let config = ChannelConfig::default()
            .with_max_message_bytes(4)
            .with_max_message_handles(0);
        let (_dispatcher, fabric) = fabric_with(config);
        let space = HandleSpace::new();
        let (a, _b) = fabric.create().expect("create pair");

        let rejected = a.try_write(Frame::from_bytes("12345")).expect_err("too big");
        assert_eq!(
            rejected.error,
            ChannelError::FrameTooLarge { size: 5, max: 4 }
        );

        let handle = space.create(HandleKind::Event, Rights::BASIC);
        let rejected = a
            .try_write(Frame::new(Vec::new(), vec![handle]))
            .expect_err("too many handles");
        assert!(rejected.error.is_fatal());
        assert_eq!(rejected.frame.handles.len(), 1);
    }

    #[test]
    fn test_max_channels_exhausts() {
        let config = ChannelConfig::default().with_max_channels(1);
        let (_dispatcher, fabric) = fabric_with(config);

        let (a, b) = fabric.create().expect("first pair");
        assert!(matches!(
            fabric.create(),
            Err(ChannelError::ResourceExhausted { live: 1, limit: 1 })
        ));

        drop(a);
        assert_eq!(fabric.live_channels(), 1);
        drop(b);
        assert_eq!(fabric.live_channels(), 0);
        assert!(fabric.create().is_ok());
    }

    #[test]
    fn test_injected_fault_fails_next_operation() {
        let (_dispatcher, fabric) = fabric_with(ChannelConfig::default());
        let (a, b) = fabric.create().expect("create pair");

        assert!(fabric.inject_io_error(b.id(), "disk on fire"));
        assert!(b.signals().contains(Signals::READABLE));
        assert_eq!(
            b.try_read().expect_err("fault"),
            ChannelError::Io("disk on fire".to_string())
        );
        assert!(b.try_read().expect("fault consumed").is_none());
        drop(a);
    }

    #[test]
    fn test_closed_handle_rejects_io() {
        let (_dispatcher, fabric) = fabric_with(ChannelConfig::default());
        let (mut a, _b) = fabric.create().expect("create pair");
        a.close();

        assert!(a.is_closed());
        assert_eq!(a.signals(), Signals::NONE);
        assert_eq!(a.try_read().expect_err("closed"), ChannelError::Closed);
    }
}
