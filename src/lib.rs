//! Client-side driver for a fleet of Movella DOT (formerly Xsens DOT)
//! motion sensors over Bluetooth LE.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    BatteryEvent, Configuration, ConnectionState, DeviceEvent, DeviceId, DeviceStatus, FleetEvent,
    MeasurementFrame, PayloadType, StatusEvent, SubscriptionKind,
};
pub use error::{DotError, Result};
pub use infrastructure::bluetooth::{DeviceSession, FanOutReport, FleetRegistry, Subscription};
