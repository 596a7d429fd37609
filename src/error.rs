use crate::domain::models::{Channel, DeviceId, PayloadType};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by device sessions and the fleet registry.
///
/// Every variant is cloneable so the same failure can be returned to the
/// caller and re-published on the fleet error stream.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DotError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("unknown payload type: {0}")]
    UnknownPayloadType(String),

    #[error("characteristic unavailable: {0}")]
    CharacteristicUnavailable(String),

    #[error("protocol conflict on {channel} channel: {active} is active, {requested} was requested")]
    ProtocolConflict {
        channel: Channel,
        active: PayloadType,
        requested: PayloadType,
    },

    #[error("decode error in {context}: {reason}")]
    Decode { context: String, reason: String },

    #[error("read error: {0}")]
    Read(String),
}

impl DotError {
    /// Buffer shorter than the layout being decoded.
    pub fn short_buffer(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::Decode {
            context: context.into(),
            reason: format!("expected at least {} bytes, got {}", expected, actual),
        }
    }
}

pub type Result<T> = std::result::Result<T, DotError>;
