//! # Provisioning Topic and Payload Codec
//!
//! This module formats the request topics the client publishes and parses
//! the response topic/payload pairs the service sends back. It is the only
//! place wire-format knowledge lives; the state machine consumes the parsed
//! [`RegistrationResponse`] and never looks at raw bytes.
//!
//! The wire protocol is the DPS registration exchange:
//!
//! - register request: `$dps/registrations/PUT/iotdps-register/?$rid={rid}`
//! - status query: `$dps/registrations/GET/iotdps-get-operationstatus/?$rid={rid}&operationId={op}`
//! - responses arrive on `$dps/registrations/res/{status}/?$rid={rid}[&retry-after={n}]`
//!   with a small JSON document in the payload.
//!
//! Builders write through `core::fmt::Write` so the caller picks the
//! storage; an overflowing write surfaces as `fmt::Error`.

use core::fmt::{self, Write};

use heapless::String;

use crate::error::{ProtocolError, ServiceError};
use crate::util::{json_str_field, json_u32_field};

/// Topic filter covering every registration response.
pub const RESPONSE_TOPIC_FILTER: &str = "$dps/registrations/res/#";

const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";

/// Provisioning service API version sent in the connection user name.
pub const API_VERSION: &str = "2019-03-31";

/// Retry interval applied when a retriable response carries no
/// `retry-after` property.
pub const DEFAULT_RETRY_AFTER_SECS: u32 = 3;

/// Maximum length of a service-assigned operation id.
pub const OPERATION_ID_MAX: usize = 64;

/// Maximum length of an assigned hub hostname.
pub const HOSTNAME_MAX: usize = 128;

/// Maximum length of a device id.
pub const DEVICE_ID_MAX: usize = 128;

/// Where the service currently stands with a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

impl OperationStatus {
    /// Parses the wire form of the status. The service sends lowercase.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unassigned" => Some(Self::Unassigned),
            "assigning" => Some(Self::Assigning),
            "assigned" => Some(Self::Assigned),
            "failed" => Some(Self::Failed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// The successful outcome of a registration: where the device now lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    /// Hostname of the hub the device was assigned to.
    pub assigned_hub: String<HOSTNAME_MAX>,
    /// Device id under which the device was registered.
    pub device_id: String<DEVICE_ID_MAX>,
}

/// A parsed registration response, ready for the state machine's decision
/// points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    /// Status code from the response topic (e.g. `202`).
    pub status_code: u16,
    /// Operation id to use in status queries. Empty when the service sent
    /// none (error documents).
    pub operation_id: String<OPERATION_ID_MAX>,
    /// Parsed operation status.
    pub operation_status: OperationStatus,
    /// Seconds until the next request may be sent. `0` means the response
    /// is terminal (assigned or failed); any other value schedules a retry.
    pub retry_after_secs: u32,
    /// Assignment result, present once the status is `assigned`.
    pub registration: Option<DeviceRegistration>,
    /// Service error document, present on terminal failures.
    pub error: Option<ServiceError>,
}

/// Writes the topic of a new-registration request.
pub fn write_register_topic(out: &mut impl Write, request_id: u32) -> fmt::Result {
    write!(out, "$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

/// Writes the topic of an operation status query.
pub fn write_query_topic(out: &mut impl Write, request_id: u32, operation_id: &str) -> fmt::Result {
    write!(
        out,
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
    )
}

/// Writes the JSON body of a new-registration request. `custom` is the
/// caller's registration payload, embedded verbatim.
pub fn write_register_payload(
    out: &mut impl Write,
    registration_id: &str,
    custom: Option<&str>,
) -> fmt::Result {
    match custom {
        Some(payload) => write!(
            out,
            "{{\"registrationId\":\"{registration_id}\",\"payload\":{payload}}}"
        ),
        None => write!(out, "{{\"registrationId\":\"{registration_id}\"}}"),
    }
}

/// Writes the user name a transport presents when connecting to the
/// provisioning endpoint. The client id is the plain registration id.
pub fn write_user_name(out: &mut impl Write, id_scope: &str, registration_id: &str) -> fmt::Result {
    write!(out, "{id_scope}/registrations/{registration_id}/api-version={API_VERSION}")
}

/// Parses a received topic/payload pair into a [`RegistrationResponse`].
///
/// Policy baked in here so the state machine sees a single retry knob:
/// a retriable status (`unassigned`/`assigning`) missing its `retry-after`
/// property gets [`DEFAULT_RETRY_AFTER_SECS`]; a throttled response (topic
/// status 429) is retriable even though its payload is an error document;
/// terminal statuses always report `retry_after_secs == 0`.
pub fn parse_response(topic: &str, payload: &[u8]) -> Result<RegistrationResponse, ProtocolError> {
    let rest = topic
        .strip_prefix(RESPONSE_TOPIC_PREFIX)
        .ok_or(ProtocolError::MalformedTopic)?;
    let (status_str, props) = match rest.split_once('/') {
        Some((status, props)) => (status, props.strip_prefix('?').unwrap_or(props)),
        None => (rest, ""),
    };
    let status_code: u16 = status_str.parse().map_err(|_| ProtocolError::MalformedTopic)?;

    let mut retry_after = None;
    for prop in props.split('&') {
        if let Some(value) = prop.strip_prefix("retry-after=") {
            retry_after = value.parse::<u32>().ok();
        }
    }

    let doc = core::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;

    let operation_status = match json_str_field(doc, "status") {
        Some(s) => OperationStatus::parse(s).ok_or(ProtocolError::UnknownOperationStatus)?,
        // Error documents (throttling, auth failures) carry no status field.
        None if status_code >= 300 => OperationStatus::Failed,
        None => return Err(ProtocolError::MalformedPayload),
    };

    let mut operation_id = String::new();
    if let Some(id) = json_str_field(doc, "operationId") {
        operation_id.push_str(id).map_err(|_| ProtocolError::FieldTooLong)?;
    }

    let registration = match (json_str_field(doc, "assignedHub"), json_str_field(doc, "deviceId")) {
        (Some(hub), Some(device_id)) => {
            let mut registration = DeviceRegistration {
                assigned_hub: String::new(),
                device_id: String::new(),
            };
            registration
                .assigned_hub
                .push_str(hub)
                .map_err(|_| ProtocolError::FieldTooLong)?;
            registration
                .device_id
                .push_str(device_id)
                .map_err(|_| ProtocolError::FieldTooLong)?;
            Some(registration)
        }
        _ => None,
    };

    let retriable = matches!(
        operation_status,
        OperationStatus::Unassigned | OperationStatus::Assigning
    ) || status_code == 429;
    let retry_after_secs = if operation_status == OperationStatus::Assigned {
        0
    } else if retriable {
        retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS)
    } else {
        0
    };

    // Terminal failures surface the service's error document; everything in
    // it is best-effort diagnostics.
    let error = if retry_after_secs == 0 && operation_status != OperationStatus::Assigned {
        let code = json_u32_field(doc, "errorCode").unwrap_or(u32::from(status_code));
        let mut error = ServiceError::from_status(status_code);
        error.code = code;
        error.message = copy_prefix(json_str_field(doc, "message").unwrap_or(""));
        error.tracking_id = copy_prefix(json_str_field(doc, "trackingId").unwrap_or(""));
        error.timestamp = copy_prefix(json_str_field(doc, "timestampUtc").unwrap_or(""));
        Some(error)
    } else {
        None
    };

    Ok(RegistrationResponse {
        status_code,
        operation_id,
        operation_status,
        retry_after_secs,
        registration,
        error,
    })
}

/// Copies as much of `src` as fits. Used for diagnostic strings only.
fn copy_prefix<const N: usize>(src: &str) -> String<N> {
    let mut out = String::new();
    for c in src.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}
