//! Dispatcher event bits and queue plumbing.
//!
//! The state machine never performs I/O from the context that decides an
//! action is due; it raises an event here and the dispatcher performs the
//! transport call on its next pass. This is what keeps timer callbacks and
//! caller threads out of the async publish path.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Depth of the dispatcher event queue. At most one of each event is ever
/// outstanding, so a small queue suffices.
pub(crate) const EVENT_QUEUE_DEPTH: usize = 4;

/// Events consumed by the dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Event {
    /// A caller armed the registration attempt; start connecting.
    Start,
    /// A request (new registration or status query) is due.
    Request,
    /// The client was closed; tear the transport down and exit.
    Stop,
}

pub(crate) type EventChannel = Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_DEPTH>;
