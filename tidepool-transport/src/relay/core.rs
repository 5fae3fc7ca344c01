//! Core transport implementation: one channel, one outbound queue, two
//! one-shot readiness waits.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tidepool_core::{
    ChannelError, ChannelHandle, Dispatcher, EndpointId, Frame, WaitId, WeakDispatcher,
    WriteRejected,
};
use tracing::{debug, trace, warn};

use super::config::TransportConfig;
use super::metrics::TransportMetrics;
use crate::error::{TransportError, TransportResult};
use crate::inbox::Inbox;
use crate::queue::MessageQueue;

/// Lifecycle phase of a [`Transport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No channel attached; messages accumulate in the queue.
    Unbound,
    /// Channel attached; reads and writes are driven by the dispatcher.
    Bound,
    /// Close in progress; the close handler is running.
    Closing,
    /// Terminal for the current binding. `set_channel` may start a new one.
    Closed,
}

/// Why a transport stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner called [`Transport::close`].
    Requested,
    /// The remote endpoint closed and every frame it sent was delivered.
    PeerClosed,
    /// A fatal channel error.
    Io(ChannelError),
    /// The transport was dropped while bound.
    Dropped,
    /// The dispatcher was dropped, so no further I/O can be scheduled.
    DispatcherGone,
}

impl CloseReason {
    /// Returns true for closures caused by a failure rather than an orderly shutdown.
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::Io(_) | CloseReason::DispatcherGone)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed by owner"),
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Io(error) => write!(f, "I/O failure: {error}"),
            CloseReason::Dropped => write!(f, "transport dropped"),
            CloseReason::DispatcherGone => write!(f, "dispatcher gone"),
        }
    }
}

type MessageHandler = Rc<dyn Fn(Frame)>;
type CloseHandler = Rc<dyn Fn(CloseReason)>;

/// State shared between the transport and its readiness callbacks.
///
/// Callbacks only hold a `Weak` to this; a failed upgrade means the
/// transport is gone and the callback must do nothing.
struct RelayState {
    phase: Phase,
    channel: Option<ChannelHandle>,
    queue: MessageQueue,
    dispatcher: WeakDispatcher,
    self_ref: Weak<RefCell<RelayState>>,
    read_wait: Option<WaitId>,
    write_wait: Option<WaitId>,
    on_message: Option<MessageHandler>,
    on_close: Option<CloseHandler>,
    last_close: Option<CloseReason>,
    /// Incremented on every `set_channel`; stale callbacks compare against it.
    binding: u64,
    config: TransportConfig,
    metrics: TransportMetrics,
}

impl RelayState {
    fn arm_read(&mut self) -> Result<(), CloseReason> {
        let dispatcher = self
            .dispatcher
            .upgrade()
            .ok_or(CloseReason::DispatcherGone)?;
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        let weak = self.self_ref.clone();
        let binding = self.binding;
        let id = dispatcher.register_read(channel, move |_signals| on_readable(&weak, binding));
        self.read_wait = Some(id);
        Ok(())
    }

    fn arm_write(&mut self) -> Result<(), CloseReason> {
        if self.write_wait.is_some() {
            return Ok(());
        }
        let dispatcher = self
            .dispatcher
            .upgrade()
            .ok_or(CloseReason::DispatcherGone)?;
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        let weak = self.self_ref.clone();
        let binding = self.binding;
        let id = dispatcher.register_write(channel, move |_signals| on_writable(&weak, binding));
        self.write_wait = Some(id);
        Ok(())
    }

    /// Write queued frames until the queue empties or the channel pushes back.
    fn drain(&mut self) -> Result<(), CloseReason> {
        while let Some(frame) = self.queue.pop() {
            let Some(channel) = self.channel.as_ref() else {
                self.queue.requeue(frame);
                return Ok(());
            };
            let size = frame.len();
            match channel.try_write(frame) {
                Ok(()) => {
                    trace!("wrote {} bytes", size);
                    self.metrics.record_message_sent(size);
                }
                Err(WriteRejected {
                    error: ChannelError::WouldBlock,
                    frame,
                }) => {
                    trace!("channel full, {} frames waiting", self.queue.len() + 1);
                    self.queue.requeue(frame);
                    self.metrics.record_would_block();
                    return self.arm_write();
                }
                Err(WriteRejected {
                    error: ChannelError::PeerClosed,
                    frame,
                }) => {
                    // The read wait reports the closure after inbound frames drain.
                    self.queue.requeue(frame);
                    return Ok(());
                }
                Err(WriteRejected { error, .. }) => {
                    warn!("fatal write error: {}", error);
                    return Err(CloseReason::Io(error));
                }
            }
        }
        Ok(())
    }
}

enum ReadStep {
    Deliver(Frame, Option<MessageHandler>),
    Rearm,
    Close(CloseReason),
}

fn on_readable(weak: &Weak<RefCell<RelayState>>, binding: u64) {
    let mut delivered = 0usize;
    loop {
        // The message handler may have dropped the transport.
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let step = {
            let mut state = inner.borrow_mut();
            if state.phase != Phase::Bound || state.binding != binding {
                return;
            }
            state.read_wait = None;
            let budget_spent = state
                .config
                .max_reads_per_wakeup
                .is_some_and(|limit| delivered >= limit);
            if budget_spent {
                trace!("read budget of {} spent, yielding", delivered);
                ReadStep::Rearm
            } else {
                let Some(channel) = state.channel.as_ref() else {
                    return;
                };
                match channel.try_read() {
                    Ok(Some(frame)) => {
                        state.metrics.record_message_received(frame.len());
                        ReadStep::Deliver(frame, state.on_message.clone())
                    }
                    Ok(None) => ReadStep::Rearm,
                    Err(ChannelError::PeerClosed) => ReadStep::Close(CloseReason::PeerClosed),
                    Err(error) => {
                        warn!("fatal read error: {}", error);
                        ReadStep::Close(CloseReason::Io(error))
                    }
                }
            }
        };

        match step {
            ReadStep::Deliver(frame, handler) => {
                drop(inner);
                match handler {
                    Some(handler) => handler(frame),
                    None => trace!("no message handler, dropping {} bytes", frame.len()),
                }
                delivered += 1;
            }
            ReadStep::Rearm => {
                let armed = inner.borrow_mut().arm_read();
                if let Err(reason) = armed {
                    close_state(&inner, reason);
                }
                return;
            }
            ReadStep::Close(reason) => {
                close_state(&inner, reason);
                return;
            }
        }
    }
}

fn on_writable(weak: &Weak<RefCell<RelayState>>, binding: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let drained = {
        let mut state = inner.borrow_mut();
        if state.phase != Phase::Bound || state.binding != binding {
            return;
        }
        state.write_wait = None;
        state.drain()
    };
    if let Err(reason) = drained {
        close_state(&inner, reason);
    }
}

/// Run the close sequence once. Returns false if already closing or closed.
fn close_state(inner: &Rc<RefCell<RelayState>>, reason: CloseReason) -> bool {
    let (channel, dropped, handler, binding) = {
        let mut state = inner.borrow_mut();
        if matches!(state.phase, Phase::Closing | Phase::Closed) {
            return false;
        }
        state.phase = Phase::Closing;
        let waits = [state.read_wait.take(), state.write_wait.take()];
        if let Some(dispatcher) = state.dispatcher.upgrade() {
            for id in waits.into_iter().flatten() {
                dispatcher.cancel_wait(id);
            }
        }
        let dropped = state.queue.take_all();
        state.metrics.record_messages_dropped(dropped.len());
        if state.channel.is_some() {
            state.metrics.closes += 1;
        }
        state.last_close = Some(reason.clone());
        let channel = state.channel.take();
        (channel, dropped, state.on_close.clone(), state.binding)
    };

    match &reason {
        CloseReason::Io(_) | CloseReason::DispatcherGone => {
            warn!("transport closing: {} ({} queued frames dropped)", reason, dropped.len())
        }
        _ => debug!("transport closing: {} ({} queued frames dropped)", reason, dropped.len()),
    }
    drop(channel);
    drop(dropped);

    if let Some(handler) = handler {
        handler(reason);
    }

    // The close handler may have bound a fresh channel.
    let mut state = inner.borrow_mut();
    if state.phase == Phase::Closing && state.binding == binding {
        state.phase = Phase::Closed;
    }
    true
}

/// Drives framed reads and writes for one channel on a [`Dispatcher`].
///
/// A transport owns its [`ChannelHandle`] and outbound [`MessageQueue`] and
/// reports to a single owner through two handlers: one per received frame,
/// one when the channel closes. All methods take `&self`, so handlers may call
/// back into the transport.
///
/// # Example
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use tidepool_core::{ChannelConfig, ChannelFabric, Dispatcher, Frame};
/// use tidepool_transport::Transport;
///
/// let dispatcher = Dispatcher::new();
/// let fabric = ChannelFabric::new(&dispatcher, ChannelConfig::default());
/// let (local, remote) = fabric.create().expect("create pair");
///
/// let transport = Transport::new(&dispatcher);
/// transport.enqueue(Frame::from_bytes("hello")).expect("enqueue");
/// transport.set_channel(local).expect("bind");
/// dispatcher.run_until_idle();
///
/// let frame = remote.try_read().expect("read").expect("frame");
/// assert_eq!(frame.bytes, b"hello");
/// ```
pub struct Transport {
    inner: Rc<RefCell<RelayState>>,
}

impl Transport {
    /// Create an unbound transport with default limits.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self::with_config(dispatcher, TransportConfig::default())
    }

    /// Create an unbound transport with the given limits.
    pub fn with_config(dispatcher: &Dispatcher, config: TransportConfig) -> Self {
        let dispatcher = dispatcher.downgrade();
        let inner = Rc::new_cyclic(|self_ref| {
            RefCell::new(RelayState {
                phase: Phase::Unbound,
                channel: None,
                queue: MessageQueue::new(),
                dispatcher,
                self_ref: self_ref.clone(),
                read_wait: None,
                write_wait: None,
                on_message: None,
                on_close: None,
                last_close: None,
                binding: 0,
                config,
                metrics: TransportMetrics::default(),
            })
        });
        Self { inner }
    }

    /// Attach a channel and start reading. Queued messages are flushed in
    /// order once the channel is writable.
    ///
    /// Allowed when unbound, closed, or from inside the close handler.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyBound`] if a channel is attached;
    /// [`TransportError::DispatcherGone`] if the dispatcher was dropped.
    pub fn set_channel(&self, channel: ChannelHandle) -> TransportResult<()> {
        let armed = {
            let mut state = self.inner.borrow_mut();
            if state.phase == Phase::Bound {
                return Err(TransportError::AlreadyBound);
            }
            if state.dispatcher.upgrade().is_none() {
                return Err(TransportError::DispatcherGone);
            }
            debug!(
                "binding {} ({} queued frames)",
                channel.id(),
                state.queue.len()
            );
            state.channel = Some(channel);
            state.phase = Phase::Bound;
            state.binding += 1;
            state.last_close = None;
            state.metrics.binds += 1;

            let mut armed = state.arm_read();
            if armed.is_ok() && !state.queue.is_empty() {
                armed = state.arm_write();
            }
            armed
        };
        if let Err(reason) = armed {
            close_state(&self.inner, reason);
        }
        Ok(())
    }

    /// Append a message to the outbound queue.
    ///
    /// When bound with no write pending, the queue is drained immediately.
    /// Write failures do not surface here; they close the transport.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] while closing or closed;
    /// [`TransportError::MessageTooLarge`] / [`TransportError::TooManyHandles`]
    /// if the frame exceeds the configured limits.
    pub fn enqueue(&self, frame: Frame) -> TransportResult<()> {
        let failure = {
            let mut state = self.inner.borrow_mut();
            if matches!(state.phase, Phase::Closing | Phase::Closed) {
                return Err(TransportError::Closed);
            }
            if frame.len() > state.config.max_message_bytes {
                return Err(TransportError::MessageTooLarge {
                    size: frame.len(),
                    max: state.config.max_message_bytes,
                });
            }
            if frame.handles.len() > state.config.max_message_handles {
                return Err(TransportError::TooManyHandles {
                    count: frame.handles.len(),
                    max: state.config.max_message_handles,
                });
            }
            state.queue.push(frame);
            let depth = state.queue.len();
            state.metrics.record_message_queued(depth);

            if state.phase == Phase::Bound && state.write_wait.is_none() {
                state.drain().err()
            } else {
                None
            }
        };
        if let Some(reason) = failure {
            close_state(&self.inner, reason);
        }
        Ok(())
    }

    /// Close the channel and fire the close handler with
    /// [`CloseReason::Requested`].
    ///
    /// Returns false, doing nothing, if already closing or closed.
    pub fn close(&self) -> bool {
        close_state(&self.inner, CloseReason::Requested)
    }

    /// Detach the channel without closing it. Queued messages stay queued
    /// and no close handler fires.
    pub fn take_channel(&self) -> Option<ChannelHandle> {
        let mut state = self.inner.borrow_mut();
        if state.phase != Phase::Bound {
            return None;
        }
        let waits = [state.read_wait.take(), state.write_wait.take()];
        if let Some(dispatcher) = state.dispatcher.upgrade() {
            for id in waits.into_iter().flatten() {
                dispatcher.cancel_wait(id);
            }
        }
        state.phase = Phase::Unbound;
        let channel = state.channel.take();
        if let Some(channel) = &channel {
            debug!("unbound {}", channel.id());
        }
        channel
    }

    /// Install the handler receiving each inbound frame.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(Frame) + 'static,
    {
        let _previous = self.inner.borrow_mut().on_message.replace(Rc::new(handler));
    }

    /// Install the handler told once per binding that the channel closed.
    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(CloseReason) + 'static,
    {
        let _previous = self.inner.borrow_mut().on_close.replace(Rc::new(handler));
    }

    /// Remove the close handler.
    pub fn clear_close_handler(&self) {
        let _previous = self.inner.borrow_mut().on_close.take();
    }

    /// Remove the message handler. Frames read afterwards are discarded.
    pub fn clear_message_handler(&self) {
        let _previous = self.inner.borrow_mut().on_message.take();
    }

    /// Route frames and the close reason into an async [`Inbox`].
    ///
    /// Replaces both handlers.
    pub fn inbox(&self) -> Inbox {
        Inbox::attach(self)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.borrow().phase
    }

    /// Returns true while a channel is attached.
    pub fn is_bound(&self) -> bool {
        self.phase() == Phase::Bound
    }

    /// Returns true once the current binding has closed.
    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    /// Why the last binding closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.borrow().last_close.clone()
    }

    /// Endpoint of the attached channel.
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.inner.borrow().channel.as_ref().map(ChannelHandle::id)
    }

    /// Messages waiting to be written.
    pub fn queued_messages(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> TransportMetrics {
        let state = self.inner.borrow();
        let mut metrics = state.metrics.clone();
        metrics.peak_queue_depth = metrics.peak_queue_depth.max(state.queue.peak_depth());
        metrics
    }

    /// The limits this transport enforces.
    pub fn config(&self) -> TransportConfig {
        self.inner.borrow().config.clone()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Transport")
            .field("phase", &state.phase)
            .field("endpoint", &state.channel.as_ref().map(ChannelHandle::id))
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let bound = self.inner.borrow().phase == Phase::Bound;
        if bound {
            close_state(&self.inner, CloseReason::Dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tidepool_core::{ChannelConfig, ChannelFabric};

    fn setup() -> (Dispatcher, ChannelFabric) {
        let dispatcher = Dispatcher::new();
        let fabric = ChannelFabric::new(&dispatcher, ChannelConfig::default());
        (dispatcher, fabric)
    }

    fn count_closes(transport: &Transport) -> Rc<RefCell<Vec<CloseReason>>> {
        let closes = Rc::new(RefCell::new(Vec::new()));
        let sink = closes.clone();
        transport.set_close_handler(move |reason| sink.borrow_mut().push(reason));
        closes
    }

    #[test]
    fn test_set_channel_twice_is_rejected() {
        let (dispatcher, fabric) = setup();
        let (first, _peer) = fabric.create().expect("create pair");
        let (second, _other) = fabric.create().expect("create pair");

        let transport = Transport::new(&dispatcher);
        transport.set_channel(first).expect("bind");
        assert_eq!(
            transport.set_channel(second),
            Err(TransportError::AlreadyBound)
        );
    }

    #[test]
    fn test_close_twice_fires_once() {
        let (dispatcher, fabric) = setup();
        let (local, _remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        let closes = count_closes(&transport);

        transport.set_channel(local).expect("bind");
        assert!(transport.close());
        assert!(!transport.close());
        dispatcher.run_until_idle();

        assert_eq!(*closes.borrow(), vec![CloseReason::Requested]);
        assert_eq!(transport.phase(), Phase::Closed);
        assert_eq!(transport.enqueue(Frame::from_bytes("x")), Err(TransportError::Closed));
    }

    #[test]
    fn test_enqueue_limits() {
        let (dispatcher, _fabric) = setup();
        let config = TransportConfig::default().with_max_message_bytes(2);
        let transport = Transport::with_config(&dispatcher, config);

        assert_eq!(
            transport.enqueue(Frame::from_bytes("abc")),
            Err(TransportError::MessageTooLarge { size: 3, max: 2 })
        );
        assert_eq!(transport.queued_messages(), 0);
    }

    #[test]
    fn test_drop_while_bound_reports_dropped() {
        let (dispatcher, fabric) = setup();
        let (local, remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        let closes = count_closes(&transport);

        transport.set_channel(local).expect("bind");
        drop(transport);

        assert_eq!(*closes.borrow(), vec![CloseReason::Dropped]);
        assert!(matches!(remote.try_read(), Err(ChannelError::PeerClosed)));
    }

    #[test]
    fn test_drop_unbound_fires_nothing() {
        let (dispatcher, _fabric) = setup();
        let transport = Transport::new(&dispatcher);
        let closes = count_closes(&transport);
        transport.enqueue(Frame::from_bytes("pending")).expect("enqueue");

        drop(transport);
        assert!(closes.borrow().is_empty());
    }

    #[test]
    fn test_take_channel_keeps_queue() {
        let dispatcher = Dispatcher::new();
        let config = ChannelConfig::default().with_max_pending_frames(1);
        let fabric = ChannelFabric::new(&dispatcher, config);
        let (local, remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        let closes = count_closes(&transport);

        transport.set_channel(local).expect("bind");
        transport.enqueue(Frame::from_bytes("1")).expect("enqueue");
        transport.enqueue(Frame::from_bytes("2")).expect("enqueue");
        assert_eq!(transport.queued_messages(), 1);

        let channel = transport.take_channel().expect("bound channel");
        assert_eq!(transport.phase(), Phase::Unbound);
        remote.try_read().expect("read").expect("frame");
        dispatcher.run_until_idle();
        assert_eq!(transport.queued_messages(), 1);

        transport.set_channel(channel).expect("rebind");
        dispatcher.run_until_idle();
        let frame = remote.try_read().expect("read").expect("frame");
        assert_eq!(frame.bytes, b"2");
        assert!(closes.borrow().is_empty());
    }

    #[test]
    fn test_close_from_unbound_fires_requested() {
        let (dispatcher, _fabric) = setup();
        let transport = Transport::new(&dispatcher);
        let closes = count_closes(&transport);
        transport.enqueue(Frame::from_bytes("never sent")).expect("enqueue");

        assert!(transport.close());
        assert_eq!(*closes.borrow(), vec![CloseReason::Requested]);
        assert_eq!(transport.metrics().messages_dropped, 1);
    }

    #[test]
    fn test_dispatcher_gone_rejects_bind() {
        let (dispatcher, fabric) = setup();
        let (local, _remote) = fabric.create().expect("create pair");
        let transport = Transport::new(&dispatcher);
        drop(dispatcher);

        assert_eq!(
            transport.set_channel(local),
            Err(TransportError::DispatcherGone)
        );
    }

    #[test]
    fn test_handler_may_close_transport() {
        let (dispatcher, fabric) = setup();
        let (local, remote) = fabric.create().expect("create pair");
        let transport = Rc::new(Transport::new(&dispatcher));
        let closes = count_closes(&transport);
        let seen = Rc::new(Cell::new(0));

        let weak = Rc::downgrade(&transport);
        let counter = seen.clone();
        transport.set_message_handler(move |_frame| {
            counter.set(counter.get() + 1);
            if let Some(transport) = weak.upgrade() {
                transport.close();
            }
        });
        transport.set_channel(local).expect("bind");

        remote.try_write(Frame::from_bytes("a")).expect("write");
        remote.try_write(Frame::from_bytes("b")).expect("write");
        dispatcher.run_until_idle();

        assert_eq!(seen.get(), 1);
        assert_eq!(*closes.borrow(), vec![CloseReason::Requested]);
    }
}
