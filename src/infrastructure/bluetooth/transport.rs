//! Transport Abstraction
//!
//! The BLE stack is consumed through these traits. A platform adapter (or
//! the in-memory [`sim`](super::sim) transport) implements them; sessions
//! and the fleet registry only ever talk to `dyn` handles.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failed(String),

    #[error("peripheral is not connected")]
    NotConnected,

    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Radio state reported by the central
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Resetting,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// Scanning side of the transport
#[async_trait]
pub trait Central: Send + Sync {
    fn adapter_state(&self) -> AdapterState;

    /// Start scanning; every advertisement is delivered on the returned channel
    async fn start_scan(&self) -> TransportResult<mpsc::UnboundedReceiver<Arc<dyn Peripheral>>>;

    async fn stop_scan(&self) -> TransportResult<()>;
}

/// A discovered peripheral
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Stable address of the physical device, used to drop duplicate advertisements
    fn address(&self) -> String;

    fn local_name(&self) -> Option<String>;

    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    /// Discover every service and return all characteristics
    async fn discover_characteristics(&self) -> TransportResult<Vec<Arc<dyn Characteristic>>>;

    /// Fires when the link drops, whether requested or not
    fn disconnect_events(&self) -> broadcast::Receiver<()>;
}

/// A GATT characteristic handle
#[async_trait]
pub trait Characteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn read(&self) -> TransportResult<Vec<u8>>;

    async fn write(&self, data: &[u8], needs_response: bool) -> TransportResult<()>;

    /// Enable notifications
    async fn subscribe(&self) -> TransportResult<()>;

    /// Disable notifications
    async fn unsubscribe(&self) -> TransportResult<()>;

    /// Notification values pushed by the peripheral
    fn notifications(&self) -> broadcast::Receiver<Vec<u8>>;
}
