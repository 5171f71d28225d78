//! # Registration Transport Abstraction
//!
//! This module defines the `RegistrationTransport` trait, which abstracts the
//! publish/subscribe channel the provisioning handshake runs over (typically
//! an MQTT connection, but anything with connect/subscribe/publish semantics
//! works), keeping the state machine network-stack agnostic.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing
//! the need for the `#[async_trait]` macro.
//!
//! The transport owns connection identity and security: implementations read
//! the endpoint and credential material from
//! [`ProvisioningOptions`](crate::client::ProvisioningOptions) and can build
//! the connection user name with
//! [`topic::write_user_name`](crate::topic::write_user_name).

/// A marker trait for transport-related errors.
pub trait TransportError: core::fmt::Debug {}

/// Quality of service for a published request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

/// An inbound transport event delivered by [`RegistrationTransport::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent<'a> {
    /// A message arrived on a subscribed topic. Both slices borrow from the
    /// receive buffer and are only valid until the next `receive` call.
    Message { topic: &'a str, payload: &'a [u8] },
    /// The broker closed the connection.
    Disconnected,
}

/// A trait representing a pub/sub transport for registration traffic.
///
/// All transport failures are fatal to the registration attempt driving
/// them; the client never reconnects on its own. The error type is `Clone`
/// because a terminal transport error is frozen in the client and handed to
/// every current and future observer.
#[allow(async_fn_in_trait)]
pub trait RegistrationTransport {
    /// The error type returned by the transport.
    type Error: TransportError + Clone;

    /// Establishes the connection to the provisioning endpoint.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Subscribes to a topic filter.
    async fn subscribe(&mut self, topic_filter: &str) -> Result<(), Self::Error>;

    /// Publishes a request message.
    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS)
    -> Result<(), Self::Error>;

    /// Waits for the next inbound event, writing any received message into
    /// `buf` and returning slices into it.
    async fn receive<'a>(&mut self, buf: &'a mut [u8])
    -> Result<TransportEvent<'a>, Self::Error>;

    /// Tears the connection down. Called exactly once when the dispatcher
    /// exits; errors are not interesting at that point.
    async fn disconnect(&mut self);
}
