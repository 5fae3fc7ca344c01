//! Channel transport driven by a cooperative dispatcher.
//!
//! A [`Transport`] owns one channel endpoint and an outbound
//! [`MessageQueue`](crate::MessageQueue). Reads and writes are driven by
//! one-shot readiness waits on the [`Dispatcher`](tidepool_core::Dispatcher),
//! re-armed after each wakeup.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐ set_channel ┌───────┐ close / peer closed / I/O error ┌─────────┐
//! │ Unbound ├────────────►│ Bound ├────────────────────────────────►│ Closing │
//! └────┬────┘             └───┬───┘                                 └────┬────┘
//!      │ enqueue              │ read wait ─► message handler             │ close handler
//!      ▼                      │ write wait ─► drain queue                ▼
//!   queue grows               ▼                                     ┌────────┐
//!                          frames flow                              │ Closed │
//!                                                                   └────────┘
//! ```
//!
//! `set_channel` is accepted again from `Closed` (or from inside the close
//! handler), starting a new binding. The close handler fires once per binding.
//!
//! # Destruction guard
//!
//! Readiness callbacks hold only a weak reference to the transport state and
//! never keep it borrowed while a handler runs. A handler may therefore close
//! or drop its own transport; the read loop notices and stops.

/// Core transport implementation
pub mod core;

/// Configuration structures for transport behavior
pub mod config;

/// Traffic and lifecycle counters
pub mod metrics;

// Re-export main types
pub use config::TransportConfig;
pub use core::{CloseReason, Phase, Transport};
pub use metrics::TransportMetrics;
