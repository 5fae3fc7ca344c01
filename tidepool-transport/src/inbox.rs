//! Async adapter over a transport's handlers.

use tidepool_core::Frame;
use tokio::sync::{mpsc, watch};

use crate::relay::{CloseReason, Transport};

/// Receives a transport's frames and close reason as async values.
///
/// Created by [`Transport::inbox`]. Frames are buffered without bound; the
/// dispatcher must be running (e.g. via [`Dispatcher::run`]) for anything to
/// arrive.
///
/// [`Dispatcher::run`]: tidepool_core::Dispatcher::run
#[derive(Debug)]
pub struct Inbox {
    frames: mpsc::UnboundedReceiver<Frame>,
    closed: watch::Receiver<Option<CloseReason>>,
}

enum Wake {
    Frame(Option<Frame>),
    Closed,
}

impl Inbox {
    pub(crate) fn attach(transport: &Transport) -> Self {
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (close_tx, closed) = watch::channel(None);
        transport.set_message_handler(move |frame| {
            if frame_tx.send(frame).is_err() {
                tracing::trace!("inbox dropped, discarding frame");
            }
        });
        transport.set_close_handler(move |reason| {
            close_tx.send_replace(Some(reason));
        });
        Self { frames, closed }
    }

    /// Next frame, or None once the transport has closed and every frame
    /// received before the closure has been returned.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Ok(frame) = self.frames.try_recv() {
                return Some(frame);
            }
            if self.closed.borrow().is_some() {
                return None;
            }
            let wake = tokio::select! {
                biased;
                frame = self.frames.recv() => Wake::Frame(frame),
                _ = self.closed.changed() => Wake::Closed,
            };
            match wake {
                Wake::Frame(frame) => return frame,
                // Sender gone without a reason: nothing more will arrive.
                Wake::Closed if self.closed.has_changed().is_err() => {
                    return self.frames.try_recv().ok();
                }
                Wake::Closed => {}
            }
        }
    }

    /// Next frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Wait until the transport reports a closure.
    ///
    /// Returns None if the transport went away without reporting one.
    pub async fn closed(&mut self) -> Option<CloseReason> {
        match self.closed.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        }
    }

    /// The close reason, if the transport has reported one.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }
}
