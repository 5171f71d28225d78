//! The provisioning dispatcher.
//!
//! One task owns the transport and drives every asynchronous step of the
//! attempt: the connect and subscribe round-trips, publishing requests when
//! the state machine raises a request event, feeding inbound messages and
//! disconnects back into it, and ticking the retry countdown once per
//! second. The state machine itself never awaits; it only decides.

use embassy_futures::select::{Either3, select3};
use embassy_time::{Duration, Ticker};

use super::events::Event;
use crate::client::ProvisioningClient;
use crate::error::ProvisionError;
use crate::topic;
use crate::transport::{QoS, RegistrationTransport, TransportEvent};

/// Period of the retry countdown tick.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Drives one registration attempt over one transport.
///
/// ```ignore
/// let client = ProvisioningClient::<MyTransport>::new(options);
/// // dispatcher task:
/// let runtime = ProvisioningRuntime::new(&client, transport);
/// let outcome = runtime.run().await;
/// // caller tasks, concurrently:
/// client.register(Duration::from_secs(120)).await?;
/// ```
pub struct ProvisioningRuntime<
    'c,
    'o,
    T: RegistrationTransport,
    const MAX_WAITERS: usize,
    const BUF_SIZE: usize,
> {
    client: &'c ProvisioningClient<'o, T, MAX_WAITERS, BUF_SIZE>,
    transport: T,
}

impl<'c, 'o, T, const MAX_WAITERS: usize, const BUF_SIZE: usize>
    ProvisioningRuntime<'c, 'o, T, MAX_WAITERS, BUF_SIZE>
where
    T: RegistrationTransport,
{
    /// Pairs a client with the transport its attempt will run over.
    pub fn new(
        client: &'c ProvisioningClient<'o, T, MAX_WAITERS, BUF_SIZE>,
        transport: T,
    ) -> Self {
        Self { client, transport }
    }

    /// Runs the attempt to its terminal state and returns the frozen
    /// outcome. Spawn this as the dispatcher task; it waits for the first
    /// `register` call to arm the machine before touching the network.
    pub async fn run(mut self) -> Result<(), ProvisionError<T::Error>> {
        loop {
            match self.client.events.receive().await {
                Event::Start => break,
                // Closed before ever starting.
                Event::Stop => return self.client.outcome(),
                Event::Request => {}
            }
        }

        if !self.client.begin_connect() {
            return self.client.outcome();
        }
        let connected = self.transport.connect().await;
        if !self.client.handle_connect(connected) {
            self.transport.disconnect().await;
            return self.client.outcome();
        }

        let subscribed = self.transport.subscribe(topic::RESPONSE_TOPIC_FILTER).await;
        if !self.client.handle_subscribe(subscribed) {
            self.transport.disconnect().await;
            return self.client.outcome();
        }

        let mut ticker = Ticker::every(TICK_PERIOD);
        let mut rx_buf = [0u8; BUF_SIZE];
        while !self.client.is_terminal() {
            match select3(
                self.client.events.receive(),
                ticker.next(),
                self.transport.receive(&mut rx_buf),
            )
            .await
            {
                Either3::First(Event::Request) => {
                    // Stale events resolve to no request; nothing is sent.
                    if let Some(request) = self.client.take_request() {
                        #[cfg(feature = "log")]
                        log::debug!("publishing provisioning request to {}", request.topic);
                        let published = self
                            .transport
                            .publish(&request.topic, request.payload.as_bytes(), QoS::AtLeastOnce)
                            .await;
                        self.client.handle_publish(published);
                    }
                }
                Either3::First(Event::Stop) => break,
                Either3::First(Event::Start) => {}
                Either3::Second(()) => self.client.handle_tick(),
                Either3::Third(Ok(TransportEvent::Message { topic, payload })) => {
                    self.client.handle_message(topic, payload);
                }
                Either3::Third(Ok(TransportEvent::Disconnected)) => {
                    self.client.handle_disconnect();
                }
                Either3::Third(Err(error)) => self.client.handle_transport_error(error),
            }
        }

        self.transport.disconnect().await;
        self.client.outcome()
    }
}
