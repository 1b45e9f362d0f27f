//! The pub/sub connection: a resilient, multiplexing link to one server.
//!
//! # Overview
//!
//! A connection is driven by a single task that owns the socket, the
//! subscription ledger and the subscriber registry. All mutation happens on
//! that task; callers talk to it through the cloneable [`PubSub`] handle.
//!
//! # Connection lifecycle
//!
//! ```text
//! ┌────────────┐    connect ok     ┌───────────┐
//! │Disconnected├──────────────────►│ Connected │
//! │            │◄──────────────────┤           │
//! └────┬───────┘  transport error  └─────┬─────┘
//!      │                                 │
//!      │ backoff timer                   │ (P)SUBSCRIBE /
//!      ▼                                 ▼ push frames
//! ┌────────────┐                  ┌───────────┐
//! │ Reconnect  │                  │  Wire I/O │
//! │  attempt   │                  │           │
//! └────────────┘                  └───────────┘
//! ```
//!
//! Subscriber intent survives the left half of the diagram: on disconnect
//! every confirmed subscription moves back to pending, and the first thing a
//! fresh connection does is re-subscribe everything still wanted.
//!
//! # Backoff
//!
//! Reconnect delays start at `backoff_initial` and grow by half per failed
//! attempt, capped at `backoff_max` (uncapped when `None`). A successful
//! connect resets the schedule.

mod core;
mod handle;

pub use handle::PubSub;
