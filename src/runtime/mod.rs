//! Provisioning Runtime Module
//!
//! Provides the cooperative dispatch layer around the registration state
//! machine.
//!
//! # Overview
//!
//! The state machine in [`crate::client`] is purely synchronous: every
//! operation is a short critical section that decides and returns. This
//! module supplies the moving parts around it:
//!
//! - [`dispatcher`]: the single task that owns the transport, performs the
//!   async connect/subscribe/publish calls, delivers inbound messages and
//!   ticks the retry countdown.
//! - [`events`]: the event-bit queue through which the state machine asks
//!   the dispatcher to act (start, send a request, stop).
//! - [`waiters`]: the fixed-capacity wake table behind the blocking
//!   `register` façade.
//!
//! # Why events instead of direct calls
//!
//! A retry becomes due inside the tick handler, under the client mutex —
//! the wrong place to publish from. Raising an event and letting the
//! dispatcher publish on its next pass keeps all I/O on one task and all
//! critical sections free of `await`s.

pub(crate) mod dispatcher;
pub(crate) mod events;
pub(crate) mod waiters;

pub use dispatcher::{ProvisioningRuntime, TICK_PERIOD};
