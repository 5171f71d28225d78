//! # Provisioning Client
//!
//! This module implements the registration state machine and the caller
//! façade around it.
//!
//! ## Locking discipline
//!
//! Every field of the machine lives behind one blocking mutex. The handlers
//! (`handle_connect`, `handle_message`, `handle_tick`, ...) are short
//! synchronous critical sections invoked by the dispatcher; they decide,
//! mutate state and return. Anything asynchronous — the actual connect,
//! subscribe and publish calls — happens in the dispatcher afterwards, so
//! no lock is ever held across an `await`.
//!
//! ## State machine
//!
//! ```text
//! Init --connect--> Connecting --connected--> Subscribing
//! Subscribing --subscribed--> Requesting
//! Requesting --published--> WaitingForResponse
//! WaitingForResponse --assigned--> Done
//! WaitingForResponse --terminal failure--> Failed
//! WaitingForResponse --retry-after=N--> (countdown; Requesting on expiry)
//! (any non-init state) --disconnect/transport error--> Failed
//! ```
//!
//! The machine only moves forward: the `Requesting`/`WaitingForResponse`
//! pair may cycle through arbitrarily many retries, but a connection is
//! never re-established — a dropped transport fails the whole attempt.
//! `Done` and `Failed` are absorbing; they carry the frozen outcome handed
//! to every current and future observer.

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Timer};
use futures::future::{Either, select};
use heapless::String;

use crate::error::{ProtocolError, ProvisionError, ServiceError};
use crate::runtime::events::{Event, EventChannel};
use crate::runtime::waiters::WaiterQueue;
use crate::topic::{self, DeviceRegistration, OperationStatus, RegistrationResponse};
use crate::transport::RegistrationTransport;

/// Upper bound for a request topic (a status query with a full operation id).
pub const REQUEST_TOPIC_MAX: usize = 192;

/// Upper bound for an outgoing registration payload, including the caller's
/// custom payload.
pub const REQUEST_PAYLOAD_MAX: usize = 512;

/// The frozen result of a registration attempt.
pub type RegistrationOutcome<E> = Result<DeviceRegistration, ProvisionError<E>>;

/// Completion callback invoked exactly once when the attempt reaches its
/// terminal state, after all suspended callers have been woken.
pub type CompletionCallback<E> = fn(&RegistrationOutcome<E>);

/// Credential material presented by the transport when connecting.
///
/// The client itself never interprets these bytes; they are handed through
/// to the transport implementation, which owns authentication.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// Shared access key for SAS-token authentication.
    SymmetricKey(&'a [u8]),
    /// Client certificate and private key for X.509 authentication.
    X509 { cert: &'a [u8], key: &'a [u8] },
}

/// Identity and configuration of one registration attempt.
///
/// Mirrors the builder style of transport options: construct with the three
/// mandatory identifiers, then chain credential and payload setters.
///
/// ```ignore
/// let options = ProvisioningOptions::new(
///     "global.azure-devices-provisioning.net",
///     "0ne00000000",
///     "dev1",
/// )
/// .symmetric_key(key_bytes)
/// .payload(r#"{"model":"sensor-a"}"#);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningOptions<'a> {
    endpoint: &'a str,
    id_scope: &'a str,
    registration_id: &'a str,
    credential: Option<Credential<'a>>,
    payload: Option<&'a str>,
}

impl<'a> ProvisioningOptions<'a> {
    /// Creates options for the given provisioning endpoint, id scope and
    /// registration id.
    pub fn new(endpoint: &'a str, id_scope: &'a str, registration_id: &'a str) -> Self {
        Self {
            endpoint,
            id_scope,
            registration_id,
            credential: None,
            payload: None,
        }
    }

    /// Sets a symmetric key credential.
    pub fn symmetric_key(mut self, key: &'a [u8]) -> Self {
        self.credential = Some(Credential::SymmetricKey(key));
        self
    }

    /// Sets an X.509 device certificate credential.
    pub fn device_certificate(mut self, cert: &'a [u8], key: &'a [u8]) -> Self {
        self.credential = Some(Credential::X509 { cert, key });
        self
    }

    /// Sets a custom JSON payload embedded in the registration request.
    pub fn payload(mut self, json: &'a str) -> Self {
        self.payload = Some(json);
        self
    }

    /// Hostname of the provisioning endpoint.
    pub fn endpoint(&self) -> &'a str {
        self.endpoint
    }

    /// Id scope of the enrollment.
    pub fn id_scope(&self) -> &'a str {
        self.id_scope
    }

    /// Registration id of the device. Doubles as the connection client id.
    pub fn registration_id(&self) -> &'a str {
        self.registration_id
    }

    /// Credential material for the transport, if any was set.
    pub fn credential(&self) -> Option<Credential<'a>> {
        self.credential
    }

    /// Custom registration payload, if any was set.
    pub fn registration_payload(&self) -> Option<&'a str> {
        self.payload
    }
}

/// Protocol state. `Done`/`Failed` carry the frozen outcome.
#[derive(Debug)]
enum State<E> {
    Init,
    Connecting,
    Subscribing,
    Requesting,
    WaitingForResponse,
    Done(DeviceRegistration),
    Failed(ProvisionError<E>),
}

/// Everything the mutex protects.
struct Inner<E, const MAX_WAITERS: usize> {
    state: State<E>,
    /// Seconds until the next request. `0` means no retry is scheduled.
    retry_countdown: u32,
    /// Single response slot. A second response arriving while this is
    /// occupied is dropped: the first unconsumed response wins.
    last_response: Option<RegistrationResponse>,
    /// `$rid` of the next outgoing request.
    request_id: u32,
    waiters: WaiterQueue<MAX_WAITERS>,
    on_complete: Option<CompletionCallback<E>>,
    armed: bool,
}

/// A request ready for the dispatcher to publish. Status queries carry an
/// empty payload.
pub(crate) struct PendingRequest {
    pub(crate) topic: String<REQUEST_TOPIC_MAX>,
    pub(crate) payload: String<REQUEST_PAYLOAD_MAX>,
}

/// The device provisioning client.
///
/// One instance drives one registration attempt. Spawn
/// [`ProvisioningRuntime::run`](crate::runtime::ProvisioningRuntime) as the
/// dispatcher task, then call [`register`](Self::register) from any number
/// of caller tasks; all of them observe the same frozen outcome. The client
/// is not reusable after [`close`](Self::close) or a terminal state —
/// create a fresh one for a new attempt.
pub struct ProvisioningClient<
    'a,
    T: RegistrationTransport,
    const MAX_WAITERS: usize = 4,
    const BUF_SIZE: usize = 1024,
> {
    options: ProvisioningOptions<'a>,
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<T::Error, MAX_WAITERS>>>,
    pub(crate) events: EventChannel,
}

impl<'a, T, const MAX_WAITERS: usize, const BUF_SIZE: usize>
    ProvisioningClient<'a, T, MAX_WAITERS, BUF_SIZE>
where
    T: RegistrationTransport,
{
    /// Creates a client bound to the given identity. The attempt does not
    /// start until the first `register` call arms it.
    pub fn new(options: ProvisioningOptions<'a>) -> Self {
        Self {
            options,
            inner: Mutex::new(RefCell::new(Inner {
                state: State::Init,
                retry_countdown: 0,
                last_response: None,
                request_id: 0,
                waiters: WaiterQueue::new(),
                on_complete: None,
                armed: false,
            })),
            events: EventChannel::new(),
        }
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ProvisioningOptions<'a> {
        &self.options
    }

    fn lock<R>(&self, f: impl FnOnce(&mut Inner<T::Error, MAX_WAITERS>) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Runs the registration attempt and waits for its outcome.
    ///
    /// The first call arms the state machine (the dispatcher then connects,
    /// subscribes and publishes). A zero `timeout` is the non-blocking
    /// probe: it returns `Err(Pending)` while the attempt is in flight.
    /// With a nonzero `timeout` the caller suspends until the terminal
    /// state is reached or the timeout expires — the timeout only ends the
    /// suspension, the attempt itself keeps running. Once the attempt is
    /// terminal, every call returns the frozen outcome immediately.
    pub async fn register(&self, timeout: Duration) -> Result<(), ProvisionError<T::Error>> {
        let arm = self.lock(|inner| {
            if matches!(inner.state, State::Init) && !inner.armed {
                inner.armed = true;
                true
            } else {
                false
            }
        });
        if arm {
            let _ = self.events.try_send(Event::Start);
        }

        if timeout.as_ticks() == 0 {
            return self.outcome();
        }

        let wait = RegistrationWait {
            client: self,
            registered: None,
        };
        match select(core::pin::pin!(wait), core::pin::pin!(Timer::after(timeout))).await {
            Either::Left((result, _)) => result,
            // Local suspension timeout only; the attempt keeps running.
            Either::Right(((), _)) => Err(ProvisionError::Pending),
        }
    }

    /// Stores the completion callback. At most one is supported; setting it
    /// after the terminal transition stores it but never fires it.
    pub fn completion_callback_set(&self, callback: CompletionCallback<T::Error>) {
        self.lock(|inner| inner.on_complete = Some(callback));
    }

    /// Copies the assigned hub hostname and device id into the caller's
    /// buffers, returning the written lengths.
    ///
    /// Valid only once the attempt is `Done` (`WrongState` otherwise). If
    /// either buffer is too small, nothing is written and `BufferTooSmall`
    /// is returned rather than a truncated value.
    pub fn device_info(
        &self,
        hub_out: &mut [u8],
        device_id_out: &mut [u8],
    ) -> Result<(usize, usize), ProvisionError<T::Error>> {
        self.lock(|inner| match &inner.state {
            State::Done(registration) => {
                let hub = registration.assigned_hub.as_bytes();
                let device_id = registration.device_id.as_bytes();
                if hub.len() > hub_out.len() || device_id.len() > device_id_out.len() {
                    return Err(ProvisionError::BufferTooSmall);
                }
                hub_out[..hub.len()].copy_from_slice(hub);
                device_id_out[..device_id.len()].copy_from_slice(device_id);
                Ok((hub.len(), device_id.len()))
            }
            _ => Err(ProvisionError::WrongState),
        })
    }

    /// Closes the client: fails a still-running attempt with `Closed`,
    /// wakes every suspended caller, drops any buffered response, clears
    /// the completion callback (it never fires from teardown) and tells the
    /// dispatcher to tear the transport down. Idempotent.
    pub fn close(&self) {
        self.lock(|inner| {
            inner.on_complete = None;
            inner.last_response = None;
            finish(inner, Err(ProvisionError::Closed));
        });
        let _ = self.events.try_send(Event::Stop);
    }

    // --- dispatcher-facing operations, one short critical section each ---

    /// Init → Connecting. Refused in any other state.
    pub(crate) fn begin_connect(&self) -> bool {
        self.lock(|inner| match inner.state {
            State::Init => {
                inner.state = State::Connecting;
                true
            }
            _ => false,
        })
    }

    /// Outcome of the async connect. Connecting → Subscribing, or terminal
    /// on failure. A completion arriving after `close` is ignored.
    pub(crate) fn handle_connect(&self, result: Result<(), T::Error>) -> bool {
        let (alive, fire) = self.lock(|inner| {
            if !matches!(inner.state, State::Connecting) {
                return (false, None);
            }
            match result {
                Ok(()) => {
                    #[cfg(feature = "log")]
                    log::debug!("provisioning transport connected");
                    inner.state = State::Subscribing;
                    (true, None)
                }
                Err(e) => (false, finish(inner, Err(ProvisionError::Transport(e)))),
            }
        });
        fire_completion(fire);
        alive
    }

    /// Outcome of the subscribe. Subscribing → Requesting and the first
    /// request event is raised with no delay, or terminal on failure.
    pub(crate) fn handle_subscribe(&self, result: Result<(), T::Error>) -> bool {
        let (alive, fire) = self.lock(|inner| {
            if !matches!(inner.state, State::Subscribing) {
                return (false, None);
            }
            match result {
                Ok(()) => {
                    inner.state = State::Requesting;
                    (true, None)
                }
                Err(e) => (false, finish(inner, Err(ProvisionError::Transport(e)))),
            }
        });
        fire_completion(fire);
        if alive {
            let _ = self.events.try_send(Event::Request);
        }
        alive
    }

    /// Builds the next request. A buffered response with an operation id
    /// becomes a status query and is consumed by the build; otherwise this
    /// is a fresh registration request. Returns `None` on a stale request
    /// event (state moved on) or when the build itself failed terminally.
    pub(crate) fn take_request(&self) -> Option<PendingRequest> {
        let (request, fire) = self.lock(|inner| {
            if !matches!(inner.state, State::Requesting) {
                return (None, None);
            }
            inner.request_id += 1;
            let request_id = inner.request_id;
            let consumed = inner.last_response.take();
            match build_request(
                request_id,
                consumed,
                self.options.registration_id,
                self.options.payload,
            ) {
                Ok(request) => (Some(request), None),
                Err(()) => (None, finish(inner, Err(ProvisionError::CapacityExceeded))),
            }
        });
        fire_completion(fire);
        request
    }

    /// Outcome of the publish. Requesting → WaitingForResponse, or terminal
    /// on failure.
    pub(crate) fn handle_publish(&self, result: Result<(), T::Error>) {
        let fire = self.lock(|inner| {
            if !matches!(inner.state, State::Requesting) {
                return None;
            }
            match result {
                Ok(()) => {
                    inner.state = State::WaitingForResponse;
                    None
                }
                Err(e) => finish(inner, Err(ProvisionError::Transport(e))),
            }
        });
        fire_completion(fire);
    }

    /// A response arrived. Parses it and takes the protocol decision:
    /// assigned → `Done`; terminal failure → `Failed`; otherwise the
    /// response is buffered and the retry countdown armed.
    pub(crate) fn handle_message(&self, topic_str: &str, payload: &[u8]) {
        let fire = self.lock(|inner| {
            if !matches!(inner.state, State::WaitingForResponse) {
                #[cfg(feature = "log")]
                log::debug!("provisioning response ignored: no request in flight");
                return None;
            }
            if inner.last_response.is_some() {
                // Single-slot backpressure: the first unconsumed response
                // wins, later ones are stale by construction.
                #[cfg(feature = "log")]
                log::warn!("provisioning response dropped: previous response unconsumed");
                return None;
            }
            let response = match topic::parse_response(topic_str, payload) {
                Ok(response) => response,
                Err(e) => return finish(inner, Err(ProvisionError::Protocol(e))),
            };
            if response.operation_status == OperationStatus::Assigned {
                return match response.registration {
                    Some(registration) => finish(inner, Ok(registration)),
                    None => finish(
                        inner,
                        Err(ProvisionError::Protocol(ProtocolError::MalformedPayload)),
                    ),
                };
            }
            if response.retry_after_secs == 0 {
                let error = response
                    .error
                    .unwrap_or_else(|| ServiceError::from_status(response.status_code));
                return finish(inner, Err(ProvisionError::Service(error)));
            }
            #[cfg(feature = "log")]
            log::debug!(
                "provisioning pending, next query in {} s",
                response.retry_after_secs
            );
            inner.retry_countdown = response.retry_after_secs;
            inner.last_response = Some(response);
            None
        });
        fire_completion(fire);
    }

    /// One periodic tick. Decrements the countdown; on reaching zero the
    /// request event is raised for the dispatcher's next pass, so the
    /// publish never happens mid-decrement.
    pub(crate) fn handle_tick(&self) {
        let raise = self.lock(|inner| {
            if inner.retry_countdown == 0 {
                return false;
            }
            inner.retry_countdown -= 1;
            if inner.retry_countdown == 0 {
                inner.state = State::Requesting;
                true
            } else {
                false
            }
        });
        if raise {
            let _ = self.events.try_send(Event::Request);
        }
    }

    /// The transport dropped the connection. Fatal from any non-terminal
    /// state past Init; the attempt is never resumed on a new connection.
    pub(crate) fn handle_disconnect(&self) {
        let fire = self.lock(|inner| {
            if matches!(inner.state, State::Init | State::Done(_) | State::Failed(_)) {
                return None;
            }
            finish(inner, Err(ProvisionError::Disconnected))
        });
        fire_completion(fire);
    }

    /// The transport's receive path failed. Same fatality as a disconnect,
    /// but the concrete error is preserved.
    pub(crate) fn handle_transport_error(&self, error: T::Error) {
        let fire = self.lock(|inner| {
            if matches!(inner.state, State::Init | State::Done(_) | State::Failed(_)) {
                return None;
            }
            finish(inner, Err(ProvisionError::Transport(error)))
        });
        fire_completion(fire);
    }

    /// Snapshot of the frozen outcome; `Err(Pending)` while in flight.
    pub(crate) fn outcome(&self) -> Result<(), ProvisionError<T::Error>> {
        self.lock(|inner| match &inner.state {
            State::Done(_) => Ok(()),
            State::Failed(e) => Err(e.clone()),
            _ => Err(ProvisionError::Pending),
        })
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lock(|inner| matches!(inner.state, State::Done(_) | State::Failed(_)))
    }
}

/// The common exit path. Freezes the outcome, wakes every waiter and hands
/// back the callback for a single invocation outside the critical section.
/// Terminal states are absorbing: calling this again is a no-op.
fn finish<E: Clone, const MAX_WAITERS: usize>(
    inner: &mut Inner<E, MAX_WAITERS>,
    outcome: RegistrationOutcome<E>,
) -> Option<(CompletionCallback<E>, RegistrationOutcome<E>)> {
    if matches!(inner.state, State::Done(_) | State::Failed(_)) {
        return None;
    }
    #[cfg(feature = "log")]
    log::info!("provisioning attempt finished");
    inner.retry_countdown = 0;
    inner.last_response = None;
    inner.state = match &outcome {
        Ok(registration) => State::Done(registration.clone()),
        Err(e) => State::Failed(e.clone()),
    };
    inner.waiters.wake_all();
    inner.on_complete.take().map(|callback| (callback, outcome))
}

fn fire_completion<E>(fire: Option<(CompletionCallback<E>, RegistrationOutcome<E>)>) {
    if let Some((callback, outcome)) = fire {
        callback(&outcome);
    }
}

fn build_request(
    request_id: u32,
    consumed: Option<RegistrationResponse>,
    registration_id: &str,
    custom_payload: Option<&str>,
) -> Result<PendingRequest, ()> {
    let mut request = PendingRequest {
        topic: String::new(),
        payload: String::new(),
    };
    match consumed {
        Some(response) if !response.operation_id.is_empty() => {
            topic::write_query_topic(&mut request.topic, request_id, &response.operation_id)
                .map_err(|_| ())?;
            // Status queries carry no body.
        }
        _ => {
            topic::write_register_topic(&mut request.topic, request_id).map_err(|_| ())?;
            topic::write_register_payload(&mut request.payload, registration_id, custom_payload)
                .map_err(|_| ())?;
        }
    }
    Ok(request)
}

/// Future of one suspended `register` caller.
///
/// Registers its waker in the waiter table on every poll and resolves when
/// the state machine freezes. Dropping it (completion, timeout or outright
/// cancellation) unlinks the waker from the table under the mutex, so a
/// timed-out caller leaves nothing behind.
struct RegistrationWait<'w, 'a, T: RegistrationTransport, const MAX_WAITERS: usize, const BUF_SIZE: usize>
{
    client: &'w ProvisioningClient<'a, T, MAX_WAITERS, BUF_SIZE>,
    registered: Option<Waker>,
}

impl<'w, 'a, T, const MAX_WAITERS: usize, const BUF_SIZE: usize> Future
    for RegistrationWait<'w, 'a, T, MAX_WAITERS, BUF_SIZE>
where
    T: RegistrationTransport,
{
    type Output = Result<(), ProvisionError<T::Error>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = this.client.lock(|inner| match &inner.state {
            State::Done(_) => Poll::Ready(Ok(())),
            State::Failed(e) => Poll::Ready(Err(e.clone())),
            _ => match inner.waiters.register(cx.waker()) {
                Ok(()) => Poll::Pending,
                Err(()) => Poll::Ready(Err(ProvisionError::CapacityExceeded)),
            },
        });
        this.registered = match poll {
            Poll::Pending => Some(cx.waker().clone()),
            Poll::Ready(_) => None,
        };
        poll
    }
}

impl<'w, 'a, T, const MAX_WAITERS: usize, const BUF_SIZE: usize> Drop
    for RegistrationWait<'w, 'a, T, MAX_WAITERS, BUF_SIZE>
where
    T: RegistrationTransport,
{
    fn drop(&mut self) {
        if let Some(waker) = self.registered.take() {
            self.client.lock(|inner| inner.waiters.remove(&waker));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use embassy_futures::block_on;

    use crate::test_support::counting_waker;
    use crate::transport::{QoS, TransportError, TransportEvent};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FakeError(u8);

    impl TransportError for FakeError {}

    /// Satisfies the transport type parameter; the tests drive the
    /// synchronous handlers directly and never run it.
    struct FakeTransport;

    impl RegistrationTransport for FakeTransport {
        type Error = FakeError;

        async fn connect(&mut self) -> Result<(), FakeError> {
            Ok(())
        }

        async fn subscribe(&mut self, _topic_filter: &str) -> Result<(), FakeError> {
            Ok(())
        }

        async fn publish(
            &mut self,
            _topic: &str,
            _payload: &[u8],
            _qos: QoS,
        ) -> Result<(), FakeError> {
            Ok(())
        }

        async fn receive<'b>(
            &mut self,
            _buf: &'b mut [u8],
        ) -> Result<TransportEvent<'b>, FakeError> {
            Ok(TransportEvent::Disconnected)
        }

        async fn disconnect(&mut self) {}
    }

    type TestClient = ProvisioningClient<'static, FakeTransport, 4, 1024>;

    const ASSIGNING_TOPIC: &str = "$dps/registrations/res/202/?$rid=1&retry-after=3";
    const ASSIGNING: &[u8] = br#"{"operationId":"op123","status":"assigning"}"#;
    const ASSIGNED_TOPIC: &str = "$dps/registrations/res/200/?$rid=2";
    const ASSIGNED: &[u8] = br#"{"operationId":"op123","status":"assigned","registrationState":{"assignedHub":"myhub.azure-devices.net","deviceId":"dev1","status":"assigned"}}"#;
    const FAILED_TOPIC: &str = "$dps/registrations/res/200/?$rid=1";
    const FAILED: &[u8] = br#"{"operationId":"op9","status":"failed","errorCode":400207,"message":"Custom allocation failed","trackingId":"abc","timestampUtc":"2022-08-01T22:38:13Z"}"#;

    fn client() -> TestClient {
        ProvisioningClient::new(
            ProvisioningOptions::new("global.azure-devices-provisioning.net", "0ne00000000", "dev1")
                .symmetric_key(b"key"),
        )
    }

    fn request_event_raised(client: &TestClient) -> bool {
        matches!(client.events.try_receive(), Ok(Event::Request))
    }

    /// Drives connect, subscribe and the first register publish, leaving
    /// the machine in WaitingForResponse.
    fn advance_to_waiting(client: &TestClient) {
        assert!(client.begin_connect());
        assert!(client.handle_connect(Ok(())));
        assert!(client.handle_subscribe(Ok(())));
        assert!(request_event_raised(client));
        let request = client.take_request().unwrap();
        assert!(request.topic.contains("iotdps-register"));
        assert!(request.payload.contains(r#""registrationId":"dev1""#));
        client.handle_publish(Ok(()));
    }

    #[test]
    fn register_probe_arms_the_machine_once() {
        let client = client();
        assert_eq!(
            block_on(client.register(Duration::from_ticks(0))),
            Err(ProvisionError::Pending)
        );
        assert!(matches!(client.events.try_receive(), Ok(Event::Start)));

        // A second probe neither re-arms nor raises another start event.
        assert_eq!(
            block_on(client.register(Duration::from_ticks(0))),
            Err(ProvisionError::Pending)
        );
        assert!(client.events.try_receive().is_err());
    }

    #[test]
    fn happy_path_with_one_retry_cycle() {
        let client = client();
        advance_to_waiting(&client);

        client.handle_message(ASSIGNING_TOPIC, ASSIGNING);

        // retry-after=3: two silent decrements, the third tick fires.
        client.handle_tick();
        client.handle_tick();
        assert!(client.events.try_receive().is_err());
        client.handle_tick();
        assert!(request_event_raised(&client));

        let query = client.take_request().unwrap();
        assert!(query.topic.contains("iotdps-get-operationstatus"));
        assert!(query.topic.contains("operationId=op123"));
        assert!(query.payload.is_empty());
        client.handle_publish(Ok(()));

        client.handle_message(ASSIGNED_TOPIC, ASSIGNED);
        assert_eq!(block_on(client.register(Duration::from_ticks(0))), Ok(()));

        let mut hub = [0u8; 64];
        let mut device_id = [0u8; 32];
        let (hub_len, id_len) = client.device_info(&mut hub, &mut device_id).unwrap();
        assert_eq!(&hub[..hub_len], b"myhub.azure-devices.net");
        assert_eq!(&device_id[..id_len], b"dev1");
    }

    #[test]
    fn countdown_of_one_fires_on_the_next_tick() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message(
            "$dps/registrations/res/202/?$rid=1&retry-after=1",
            ASSIGNING,
        );

        client.handle_tick();
        assert!(request_event_raised(&client));
    }

    #[test]
    fn second_response_is_dropped_while_first_is_unconsumed() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message(ASSIGNING_TOPIC, ASSIGNING);
        client.handle_message(
            "$dps/registrations/res/202/?$rid=1&retry-after=9",
            br#"{"operationId":"op999","status":"assigning"}"#,
        );

        // The first response's schedule and operation id win.
        client.handle_tick();
        client.handle_tick();
        client.handle_tick();
        assert!(request_event_raised(&client));
        let query = client.take_request().unwrap();
        assert!(query.topic.contains("operationId=op123"));
    }

    #[test]
    fn service_failure_freezes_the_service_error() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message(FAILED_TOPIC, FAILED);

        match block_on(client.register(Duration::from_ticks(0))) {
            Err(ProvisionError::Service(error)) => {
                assert_eq!(error.code, 400207);
                assert_eq!(error.tracking_id.as_str(), "abc");
            }
            other => panic!("expected service error, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_response_is_a_protocol_error() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message("devices/unrelated", b"{}");

        assert_eq!(
            client.outcome(),
            Err(ProvisionError::Protocol(ProtocolError::MalformedTopic))
        );
    }

    #[test]
    fn connect_failure_is_fatal_and_surfaced_verbatim() {
        let client = client();
        assert!(client.begin_connect());
        assert!(!client.handle_connect(Err(FakeError(11))));
        assert_eq!(
            client.outcome(),
            Err(ProvisionError::Transport(FakeError(11)))
        );
    }

    #[test]
    fn publish_failure_is_fatal() {
        let client = client();
        assert!(client.begin_connect());
        assert!(client.handle_connect(Ok(())));
        assert!(client.handle_subscribe(Ok(())));
        assert!(request_event_raised(&client));
        let _request = client.take_request().unwrap();
        client.handle_publish(Err(FakeError(7)));

        assert_eq!(
            client.outcome(),
            Err(ProvisionError::Transport(FakeError(7)))
        );
    }

    #[test]
    fn disconnect_mid_flight_is_fatal_and_stale_ticks_do_nothing() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message(ASSIGNING_TOPIC, ASSIGNING);
        client.handle_disconnect();

        assert_eq!(client.outcome(), Err(ProvisionError::Disconnected));

        // Stale ticks and request events after the failure publish nothing.
        client.handle_tick();
        client.handle_tick();
        client.handle_tick();
        assert!(client.events.try_receive().is_err());
        assert!(client.take_request().is_none());
    }

    #[test]
    fn terminal_state_is_absorbing() {
        let client = client();
        advance_to_waiting(&client);
        client.handle_message(ASSIGNED_TOPIC, ASSIGNED);
        assert_eq!(client.outcome(), Ok(()));

        client.handle_disconnect();
        client.handle_message(FAILED_TOPIC, FAILED);
        assert_eq!(client.outcome(), Ok(()));
    }

    #[test]
    fn completion_callback_fires_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(outcome: &RegistrationOutcome<FakeError>) {
            assert!(outcome.is_ok());
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let client = client();
        client.completion_callback_set(on_complete);
        advance_to_waiting(&client);
        client.handle_message(ASSIGNING_TOPIC, ASSIGNING);
        client.handle_tick();
        client.handle_tick();
        client.handle_tick();
        assert!(request_event_raised(&client));
        let _query = client.take_request().unwrap();
        client.handle_publish(Ok(()));
        client.handle_message(ASSIGNED_TOPIC, ASSIGNED);

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        client.handle_disconnect();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_set_after_terminal_never_fires() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_complete(_outcome: &RegistrationOutcome<FakeError>) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let client = client();
        advance_to_waiting(&client);
        client.handle_disconnect();

        client.completion_callback_set(on_complete);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waiters_are_woken_exactly_once_and_timeouts_unlink() {
        let client = client();
        let (first, first_waker) = counting_waker();
        let (second, second_waker) = counting_waker();
        let (third, third_waker) = counting_waker();

        let mut first_wait = RegistrationWait {
            client: &client,
            registered: None,
        };
        let mut second_wait = RegistrationWait {
            client: &client,
            registered: None,
        };
        let mut third_wait = RegistrationWait {
            client: &client,
            registered: None,
        };

        let mut cx = Context::from_waker(&first_waker);
        assert!(Pin::new(&mut first_wait).poll(&mut cx).is_pending());
        let mut cx = Context::from_waker(&second_waker);
        assert!(Pin::new(&mut second_wait).poll(&mut cx).is_pending());
        let mut cx = Context::from_waker(&third_waker);
        assert!(Pin::new(&mut third_wait).poll(&mut cx).is_pending());

        // The second caller times out: its future is dropped and the table
        // shrinks without disturbing the others.
        drop(second_wait);
        assert_eq!(client.lock(|inner| inner.waiters.len()), 2);

        advance_to_waiting(&client);
        client.handle_message(ASSIGNED_TOPIC, ASSIGNED);

        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
        assert_eq!(third.count(), 1);

        let mut cx = Context::from_waker(&first_waker);
        assert_eq!(Pin::new(&mut first_wait).poll(&mut cx), Poll::Ready(Ok(())));
        let mut cx = Context::from_waker(&third_waker);
        assert_eq!(Pin::new(&mut third_wait).poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn waiter_table_overflow_is_reported() {
        let client: ProvisioningClient<'static, FakeTransport, 1, 256> =
            ProvisioningClient::new(ProvisioningOptions::new("host", "scope", "dev1"));
        let (_, first_waker) = counting_waker();
        let (_, second_waker) = counting_waker();

        let mut first_wait = RegistrationWait {
            client: &client,
            registered: None,
        };
        let mut second_wait = RegistrationWait {
            client: &client,
            registered: None,
        };

        let mut cx = Context::from_waker(&first_waker);
        assert!(Pin::new(&mut first_wait).poll(&mut cx).is_pending());
        let mut cx = Context::from_waker(&second_waker);
        assert_eq!(
            Pin::new(&mut second_wait).poll(&mut cx),
            Poll::Ready(Err(ProvisionError::CapacityExceeded))
        );
    }

    #[test]
    fn close_wakes_waiters_and_is_idempotent() {
        let client = client();
        let (counter, waker) = counting_waker();
        let mut wait = RegistrationWait {
            client: &client,
            registered: None,
        };
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());

        client.close();
        assert_eq!(counter.count(), 1);
        assert_eq!(
            Pin::new(&mut wait).poll(&mut cx),
            Poll::Ready(Err(ProvisionError::Closed))
        );

        client.close();
        assert_eq!(counter.count(), 1);
        assert_eq!(
            block_on(client.register(Duration::from_ticks(0))),
            Err(ProvisionError::Closed)
        );
    }

    #[test]
    fn late_connect_completion_after_close_is_ignored() {
        let client = client();
        assert!(client.begin_connect());
        client.close();
        assert!(!client.handle_connect(Ok(())));
        assert_eq!(client.outcome(), Err(ProvisionError::Closed));
    }

    #[test]
    fn device_info_validates_state_and_buffers() {
        let client = client();
        let mut hub = [0u8; 64];
        let mut device_id = [0u8; 32];
        assert_eq!(
            client.device_info(&mut hub, &mut device_id),
            Err(ProvisionError::WrongState)
        );

        advance_to_waiting(&client);
        client.handle_message(ASSIGNED_TOPIC, ASSIGNED);

        let mut tiny = [0u8; 4];
        assert_eq!(
            client.device_info(&mut tiny, &mut device_id),
            Err(ProvisionError::BufferTooSmall)
        );
        // A failed copy disturbs nothing.
        assert_eq!(client.outcome(), Ok(()));
        assert!(client.device_info(&mut hub, &mut device_id).is_ok());
    }

    #[test]
    fn custom_payload_is_embedded_in_the_register_request() {
        let client: ProvisioningClient<'static, FakeTransport, 4, 1024> =
            ProvisioningClient::new(
                ProvisioningOptions::new("host", "scope", "dev1")
                    .payload(r#"{"model":"sensor-a"}"#),
            );
        assert!(client.begin_connect());
        assert!(client.handle_connect(Ok(())));
        assert!(client.handle_subscribe(Ok(())));
        assert!(request_event_raised(&client));
        let request = client.take_request().unwrap();
        assert!(request.payload.contains(r#""payload":{"model":"sensor-a"}"#));
    }
}
