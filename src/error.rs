//! # Error Types
//!
//! This module defines the error taxonomy of the provisioning client. Four
//! classes are kept apart so callers can tell them apart:
//!
//! - **Transport errors** (`Transport`, `Disconnected`): the link failed.
//!   Fatal to the current registration attempt; never retried internally.
//! - **Protocol errors** (`Protocol`): the link was fine but the service
//!   sent something the codec cannot make sense of. Also fatal.
//! - **Service errors** (`Service`): a well-formed negative answer from the
//!   provisioning service (`failed`/`disabled`), carrying the service's own
//!   diagnostics.
//! - **Call-local errors** (`WrongState`, `BufferTooSmall`, ...): reported
//!   to the specific caller without disturbing the state machine.

use heapless::String;

use crate::transport;

/// Maximum length of a service-reported error message retained for diagnostics.
pub const ERROR_MESSAGE_MAX: usize = 128;

/// Maximum length of a service tracking id.
pub const TRACKING_ID_MAX: usize = 48;

/// Maximum length of a service error timestamp.
pub const TIMESTAMP_MAX: usize = 32;

/// The primary error enum for the provisioning client.
///
/// It is generic over the transport error type `E`, allowing it to wrap
/// specific errors from the underlying pub/sub transport (e.g. an MQTT
/// client error) without this crate knowing their shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError<E> {
    /// A connect, subscribe or publish call failed in the transport layer.
    Transport(E),
    /// The transport dropped the connection while the attempt was in flight.
    Disconnected,
    /// The service sent a topic or payload the codec could not parse.
    Protocol(ProtocolError),
    /// The service answered with a terminal failure (`failed`/`disabled`).
    Service(ServiceError),
    /// The registration attempt is still in progress. Returned by the
    /// non-blocking probe and by callers whose suspension timed out; the
    /// attempt itself keeps running.
    Pending,
    /// The requested operation is not valid in the client's current state.
    WrongState,
    /// A caller-supplied buffer was too small for the stored value.
    BufferTooSmall,
    /// A fixed-capacity internal resource (waiter table, request buffer)
    /// was exhausted.
    CapacityExceeded,
    /// The client was closed with [`close`](crate::client::ProvisioningClient::close).
    Closed,
}

/// Implements the `From` trait to allow for automatic conversion of any
/// transport error into a `ProvisionError`. This is what allows the `?`
/// operator to work seamlessly on `Result`s from the transport layer.
impl<E: transport::TransportError> From<E> for ProvisionError<E> {
    fn from(err: E) -> Self {
        ProvisionError::Transport(err)
    }
}

/// Enumerates the ways a received topic/payload pair can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The response topic did not match the registration response layout.
    MalformedTopic,
    /// The response payload was missing a required field.
    MalformedPayload,
    /// The payload carried an operation status this client does not know.
    UnknownOperationStatus,
    /// The payload was not valid UTF-8.
    InvalidUtf8,
    /// A protocol-critical field exceeded its fixed storage capacity.
    FieldTooLong,
}

/// The service's own description of a terminal registration failure.
///
/// Populated from the error document the provisioning service returns
/// alongside a `failed`/`disabled` status, e.g. error code `400207` with a
/// tracking id for support. Diagnostic strings longer than their capacity
/// are kept as a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    /// Service error code (e.g. `400207`), or the response status code when
    /// the payload carried none.
    pub code: u32,
    /// Human-readable error message.
    pub message: String<ERROR_MESSAGE_MAX>,
    /// Correlation id for the service's own logs.
    pub tracking_id: String<TRACKING_ID_MAX>,
    /// Service-side timestamp of the failure.
    pub timestamp: String<TIMESTAMP_MAX>,
}

impl ServiceError {
    /// Builds a bare error from a response status code, for error responses
    /// whose payload carried no error document.
    pub(crate) fn from_status(status: u16) -> Self {
        Self {
            code: u32::from(status),
            message: String::new(),
            tracking_id: String::new(),
            timestamp: String::new(),
        }
    }
}
