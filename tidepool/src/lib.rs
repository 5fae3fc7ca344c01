//! # Tidepool
//!
//! Asynchronous, handle-bearing message channels with framed I/O and
//! back-pressure, driven by a single-threaded cooperative dispatcher.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              tidepool (this crate)                          │
//! │   Re-exports all functionality                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  tidepool-transport                         │
//! │  • Transport: ordered framed I/O with back-pressure         │
//! │  • BindingSet: entries that erase themselves on close       │
//! │  • Inbox: async receive adapter (tokio)                     │
//! │  • Wire format: aligned encoding, leak-free decoding        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     tidepool-core                           │
//! │  Handles, signals, channel fabric, dispatcher               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use tidepool::{ChannelConfig, ChannelFabric, Dispatcher, Frame, Transport};
//!
//! let dispatcher = Dispatcher::new();
//! let fabric = ChannelFabric::new(&dispatcher, ChannelConfig::default());
//! let (client, server) = fabric.create().expect("create pair");
//!
//! let transport = Transport::new(&dispatcher);
//! transport.set_message_handler(|frame| println!("got {} bytes", frame.len()));
//! transport.set_channel(server).expect("bind");
//!
//! client.try_write(Frame::from_bytes("hello")).expect("write");
//! dispatcher.run_until_idle();
//! ```
//!
//! ## Which Crate to Use
//!
//! | Use case | Crate |
//! |----------|-------|
//! | Everything (recommended) | `tidepool` |
//! | Channels and dispatcher only | `tidepool-core` |
//! | Transport, binding sets, wire codec | `tidepool-transport` |

#![deny(missing_docs)]

// Re-export all public items from sub-crates
pub use tidepool_core::*;
pub use tidepool_transport::*;
