//! Conversions between wire messages and core events.
//!
//! A malformed payload is a protocol violation: the caller logs it and drops
//! the message, the channel stays up.

use conductor_core::{OperationStatus, OutboundEvent, PushEvent};
use thiserror::Error;

use crate::proto;

#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("malformed details payload: {0}")]
    MalformedDetails(#[from] serde_json::Error),
}

pub fn status_from_proto(value: i32) -> Option<OperationStatus> {
    match proto::OperationStatus::try_from(value).ok()? {
        proto::OperationStatus::Unspecified => None,
        proto::OperationStatus::Idle => Some(OperationStatus::Idle),
        proto::OperationStatus::Started => Some(OperationStatus::Started),
        proto::OperationStatus::InProgress => Some(OperationStatus::InProgress),
        proto::OperationStatus::Complete => Some(OperationStatus::Complete),
        proto::OperationStatus::Failed => Some(OperationStatus::Failed),
    }
}

pub fn status_to_proto(status: OperationStatus) -> proto::OperationStatus {
    match status {
        OperationStatus::Idle => proto::OperationStatus::Idle,
        OperationStatus::Started => proto::OperationStatus::Started,
        OperationStatus::InProgress => proto::OperationStatus::InProgress,
        OperationStatus::Complete => proto::OperationStatus::Complete,
        OperationStatus::Failed => proto::OperationStatus::Failed,
    }
}

pub fn server_event_to_push(event: proto::ServerEvent) -> Result<PushEvent, ProtocolViolation> {
    let details = event
        .details_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(PushEvent {
        name: event.event,
        status: event.status.and_then(status_from_proto),
        progress: event.progress,
        message: event.message,
        details,
        error: event.error,
        sequence: event.sequence_num,
    })
}

pub fn push_to_server_event(event: &PushEvent, sequence_num: u64) -> proto::ServerEvent {
    proto::ServerEvent {
        event: event.name.clone(),
        status: event.status.map(|s| status_to_proto(s) as i32),
        progress: event.progress,
        message: event.message.clone(),
        details_json: event
            .details
            .as_ref()
            .map(|details| details.to_string()),
        error: event.error.clone(),
        sequence_num,
    }
}

pub fn subscribe_frame(channel_id: &str) -> proto::AttachRequest {
    proto::AttachRequest {
        channel_id: channel_id.to_string(),
        message: Some(proto::attach_request::Message::Subscribe(
            proto::SubscribeRequest {
                channel_id: channel_id.to_string(),
            },
        )),
    }
}

pub fn emit_frame(channel_id: &str, outbound: &OutboundEvent) -> proto::AttachRequest {
    proto::AttachRequest {
        channel_id: channel_id.to_string(),
        message: Some(proto::attach_request::Message::Emit(proto::EmitRequest {
            event: outbound.event.clone(),
            payload_json: outbound.payload.as_ref().map(|p| p.to_string()),
        })),
    }
}
