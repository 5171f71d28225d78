//! # Device Provisioning Client for Embedded Systems
//!
//! `dps-mqtt` is a `no_std` compatible, asynchronous device provisioning
//! (DPS) client designed for embedded systems, built upon the
//! [Embassy](https://embassy.dev/) async ecosystem.
//!
//! It drives the multi-round-trip registration handshake against a device
//! provisioning service over any publish/subscribe transport: connect,
//! subscribe to the registration response topic, publish the registration
//! request, then poll the operation status until the service assigns the
//! device to a hub (or reports a terminal failure).
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Designed to run on bare-metal
//!   microcontrollers without requiring a standard library or dynamic
//!   memory allocation. Buffers are managed using `heapless`.
//! - **Fully Async:** Built with `async/await` and leverages the Embassy
//!   ecosystem for timers, ensuring non-blocking operations.
//! - **Rust 2024 Edition:** Uses native `async fn` in traits, removing the
//!   need for `async-trait`.
//! - **Transport Agnostic:** A flexible `RegistrationTransport` trait lets
//!   the handshake run over any pub/sub channel — typically MQTT, but the
//!   client never touches packet encoding itself.
//! - **Multi-Caller:** Any number of tasks can block on the same attempt;
//!   all of them observe the one frozen outcome, and a completion callback
//!   fires exactly once.
//!
//! ## Architecture
//!
//! One dispatcher task owns the transport and performs all I/O; the state
//! machine itself is a set of short mutex-protected critical sections that
//! only decide. Callers interact through the façade on
//! [`ProvisioningClient`].
//!
//! ```ignore
//! use dps_mqtt::{ProvisioningClient, ProvisioningOptions, ProvisioningRuntime};
//! use embassy_time::Duration;
//!
//! let options = ProvisioningOptions::new(
//!     "global.azure-devices-provisioning.net",
//!     "0ne00000000",
//!     "dev1",
//! )
//! .symmetric_key(key);
//! let client = ProvisioningClient::<MyTransport>::new(options);
//!
//! // Dispatcher task:
//! spawner.spawn(run_provisioning(&client, transport))?;
//!
//! // Any caller task:
//! client.register(Duration::from_secs(120)).await?;
//! let (hub_len, id_len) = client.device_info(&mut hub_buf, &mut id_buf)?;
//! ```
//!
//! ## Lifecycle
//!
//! A client drives exactly one registration attempt. Transport failures
//! (connect, subscribe, publish, disconnect) are fatal to the attempt; only
//! the service's own "still provisioning, retry after N seconds" answer is
//! retried, on the client's one-second tick. After a terminal state — or
//! after [`ProvisioningClient::close`] — the outcome is frozen and the
//! client is done; create a new one to try again.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod client;
pub mod error;
pub mod runtime;
pub mod topic;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export key types for easier access at the crate root.
pub use client::{
    CompletionCallback, Credential, ProvisioningClient, ProvisioningOptions, RegistrationOutcome,
};
pub use error::{ProtocolError, ProvisionError, ServiceError};
pub use runtime::ProvisioningRuntime;
pub use topic::{DeviceRegistration, OperationStatus};
pub use transport::{QoS, RegistrationTransport, TransportEvent};
