//! Bluetooth Module
//!
//! Provides BLE communication with a fleet of Movella DOT sensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     FleetRegistry                        │
//! │   (discovery, fan-out, fleet-wide tagged event stream)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Scanner  │  │DeviceSession │  │  Protocol /  │
//! │           │  │              │  │    Codec     │
//! │ - window  │  │ - state      │  │ - UUIDs      │
//! │ - name    │  │ - GATT table │  │ - payloads   │
//! │   filter  │  │ - streams    │  │ - decoding   │
//! └─────┬─────┘  └──────┬───────┘  └──────────────┘
//!       │               │
//!       ▼               ▼
//! ┌─────────────────────────────┐
//! │ Transport (Central /        │
//! │ Peripheral / Characteristic)│
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, control frames and the payload table
//! - [`codec`] - Measurement, battery, status and configuration decoding
//! - [`transport`] - Traits the BLE stack is consumed through
//! - [`session`] - Per-device connection state machine and subscriptions
//! - [`scanner`] - Discovery window and local-name filter
//! - [`service`] - Fleet registry
//! - [`sim`] - In-memory transport

pub mod codec;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod sim;
pub mod transport;

pub use service::{FanOutReport, FleetRegistry};
pub use session::{DeviceSession, SessionOptions, Subscription};
