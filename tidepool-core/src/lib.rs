//! # tidepool-core
//!
//! Primitives for the tidepool message transport:
//!
//! - **Handles**: [`HandleSpace`] allocates move-only [`Handle`]s and records
//!   every close, so "closed exactly once" can be checked.
//! - **Channels**: [`ChannelFabric`] creates connected [`ChannelHandle`] pairs
//!   carrying [`Frame`]s of bytes and handles, with bounded queues.
//! - **Dispatcher**: [`Dispatcher`] is a single-threaded cooperative loop
//!   running one-shot readiness callbacks and posted tasks.
//!
//! Everything is thread-confined. There are no globals: each space, fabric and
//! dispatcher is an explicit context object.
//!
//! ## Example
//!
//! ```
//! use tidepool_core::{ChannelConfig, ChannelFabric, Dispatcher, Frame};
//!
//! let dispatcher = Dispatcher::new();
//! let fabric = ChannelFabric::new(&dispatcher, ChannelConfig::default());
//! let (client, server) = fabric.create().expect("create pair");
//!
//! client.try_write(Frame::from_bytes("ping")).expect("write");
//! let frame = server.try_read().expect("read").expect("frame");
//! assert_eq!(frame.bytes, b"ping");
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod channel;
mod config;
mod dispatcher;
mod error;
mod handle;
mod signals;

// Channel exports
pub use channel::{ChannelFabric, ChannelHandle, EndpointId, Frame, WriteRejected};
pub use config::ChannelConfig;

// Dispatcher exports
pub use dispatcher::{Dispatcher, DispatcherStats, WaitId, WeakDispatcher};

// Error exports
pub use error::{ChannelError, ChannelResult, HandleError};

// Handle exports
pub use handle::{Handle, HandleInfo, HandleKind, HandleSpace, RawHandle, Rights};
pub use signals::Signals;
