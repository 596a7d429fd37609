//! In-memory DOT Transport
//!
//! Simulated central, peripherals and characteristics implementing the
//! transport traits. Used by the unit tests and by the demo binary when no
//! radio is involved. Peripherals record every connect call and control
//! write, and tests can inject notifications, failed or delayed connects
//! and unsolicited link loss.

use crate::domain::models::{PayloadType, Quaternion, Vector3};
use crate::infrastructure::bluetooth::protocol::{
    self, Field, BATTERY_UUID, DEVICE_CONTROL_UUID, DEVICE_INFO_UUID, DEVICE_REPORT_UUID,
    LONG_PAYLOAD_UUID, MEASUREMENT_CONTROL_UUID, MEDIUM_PAYLOAD_UUID, SHORT_PAYLOAD_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    AdapterState, Central, Characteristic, Peripheral, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

const NOTIFICATION_BUFFER: usize = 64;

/// Every characteristic a real DOT exposes
pub const DOT_PROFILE: [Uuid; 8] = [
    DEVICE_INFO_UUID,
    DEVICE_CONTROL_UUID,
    DEVICE_REPORT_UUID,
    MEASUREMENT_CONTROL_UUID,
    LONG_PAYLOAD_UUID,
    MEDIUM_PAYLOAD_UUID,
    SHORT_PAYLOAD_UUID,
    BATTERY_UUID,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Values written into a synthetic frame, one per field kind so a decoder
/// reading the wrong offset gets the wrong value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticSample {
    pub timestamp: u32,
    pub quaternion: Quaternion,
    pub euler: Vector3,
    pub free_acceleration: Vector3,
    pub acceleration: Vector3,
    pub angular_velocity: Vector3,
    pub dv: Vector3,
    pub magnetic_raw: [i16; 3],
    pub status_raw: u16,
    pub clip_count_acc: i8,
    pub clip_count_gyr: i8,
}

impl SyntheticSample {
    /// A sensor slowly spinning about its z axis
    pub fn at(timestamp: u32) -> Self {
        let angle = timestamp as f32 / 1000.0;
        let (sin, cos) = angle.sin_cos();
        Self {
            timestamp,
            quaternion: Quaternion {
                w: (angle / 2.0).cos(),
                x: 0.0,
                y: 0.0,
                z: (angle / 2.0).sin(),
            },
            euler: Vector3 {
                x: 0.0,
                y: 0.0,
                z: angle.to_degrees() % 360.0,
            },
            free_acceleration: Vector3 {
                x: -sin,
                y: cos,
                z: 0.0,
            },
            acceleration: Vector3 {
                x: -sin,
                y: cos,
                z: 9.81,
            },
            angular_velocity: Vector3 {
                x: 0.0,
                y: 0.0,
                z: 57.3,
            },
            dv: Vector3 {
                x: -sin / 60.0,
                y: cos / 60.0,
                z: 9.81 / 60.0,
            },
            magnetic_raw: [(cos * 2048.0) as i16, (sin * 2048.0) as i16, -1024],
            status_raw: 0,
            clip_count_acc: 0,
            clip_count_gyr: 0,
        }
    }
}

fn vector_bytes(v: Vector3) -> Vec<u8> {
    [v.x, v.y, v.z].iter().flat_map(|c| c.to_le_bytes()).collect()
}

/// Encode a measurement frame following the protocol table layout
pub fn encode_frame(payload: PayloadType, sample: &SyntheticSample) -> Vec<u8> {
    let entry = protocol::protocol_entry(payload);
    let mut data = vec![0u8; entry.frame_len()];

    for (field, offset) in entry.layout {
        let bytes: Vec<u8> = match field {
            Field::Timestamp => sample.timestamp.to_le_bytes().to_vec(),
            Field::Quaternion | Field::Dq => {
                let q = sample.quaternion;
                [q.w, q.x, q.y, q.z]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect()
            }
            Field::Euler => vector_bytes(sample.euler),
            Field::FreeAcceleration => vector_bytes(sample.free_acceleration),
            Field::Acceleration => vector_bytes(sample.acceleration),
            Field::AngularVelocity => vector_bytes(sample.angular_velocity),
            Field::Dv => vector_bytes(sample.dv),
            Field::MagneticField => sample
                .magnetic_raw
                .iter()
                .flat_map(|c| c.to_le_bytes())
                .collect(),
            Field::Status => sample.status_raw.to_le_bytes().to_vec(),
            Field::ClipCountAcc => sample.clip_count_acc.to_le_bytes().to_vec(),
            Field::ClipCountGyr => sample.clip_count_gyr.to_le_bytes().to_vec(),
        };
        data[*offset..*offset + bytes.len()].copy_from_slice(&bytes);
    }

    data
}

/// Device information read value: firmware 2.0.0 built 2021-06-15 10:30:00
pub fn device_information(mac: [u8; 6], serial: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(34);
    data.extend_from_slice(&mac);
    data.extend_from_slice(&[2, 0, 0]);
    data.extend_from_slice(&2021i16.to_le_bytes());
    data.extend_from_slice(&[6, 15, 10, 30, 0]);
    data.extend_from_slice(&7_002_000u32.to_le_bytes());
    data.extend_from_slice(&serial.to_le_bytes());
    data.extend_from_slice(b"XS-T01");
    data
}

/// Device control read value
pub fn device_control(tag: &str, output_rate: u8, filter_index: u8) -> Vec<u8> {
    let mut data = vec![0u8; 27];
    let tag = tag.as_bytes();
    let len = tag.len().min(16);
    data[8..8 + len].copy_from_slice(&tag[..len]);
    data[24] = output_rate;
    data[26] = filter_index;
    data
}

/// Simulated characteristic
pub struct SimCharacteristic {
    uuid: Uuid,
    link: Arc<AtomicBool>,
    value: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(Vec<u8>, bool)>>,
    subscribed: AtomicBool,
    subscribe_calls: AtomicUsize,
    fail_reads: AtomicBool,
    fail_subscribe: AtomicBool,
    io_calls: AtomicUsize,
    io_gate: Mutex<Option<Arc<Notify>>>,
    notifier: broadcast::Sender<Vec<u8>>,
}

impl SimCharacteristic {
    fn new(uuid: Uuid, link: Arc<AtomicBool>, value: Vec<u8>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            uuid,
            link,
            value: Mutex::new(value),
            writes: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
            subscribe_calls: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            io_calls: AtomicUsize::new(0),
            io_gate: Mutex::new(None),
            notifier,
        }
    }

    fn ensure_link(&self) -> TransportResult<()> {
        if self.link.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    pub fn set_value(&self, value: Vec<u8>) {
        *lock(&self.value) = value;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Reject requests to enable notifications
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make reads and writes wait until the returned gate is notified
    pub fn hold_io(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.io_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Reads and writes started, including ones still waiting on the gate
    pub fn io_calls(&self) -> usize {
        self.io_calls.load(Ordering::SeqCst)
    }

    async fn pass_io_gate(&self) {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.io_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    /// Every write as `(bytes, needs_response)`
    pub fn writes(&self) -> Vec<(Vec<u8>, bool)> {
        lock(&self.writes).clone()
    }

    pub fn last_write(&self) -> Option<Vec<u8>> {
        lock(&self.writes).last().map(|(data, _)| data.clone())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Push a notification; dropped unless notifications are enabled
    pub fn notify(&self, data: Vec<u8>) -> bool {
        if !self.is_subscribed() || !self.link.load(Ordering::SeqCst) {
            return false;
        }
        trace!("sim {} notify {:02X?}", protocol::characteristic_name(&self.uuid), data);
        self.notifier.send(data).is_ok()
    }
}

#[async_trait]
impl Characteristic for SimCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn read(&self) -> TransportResult<Vec<u8>> {
        self.pass_io_gate().await;
        self.ensure_link()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("read rejected".to_string()));
        }
        Ok(lock(&self.value).clone())
    }

    async fn write(&self, data: &[u8], needs_response: bool) -> TransportResult<()> {
        self.pass_io_gate().await;
        self.ensure_link()?;
        lock(&self.writes).push((data.to_vec(), needs_response));
        Ok(())
    }

    async fn subscribe(&self) -> TransportResult<()> {
        self.ensure_link()?;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("notifications rejected".to_string()));
        }
        self.subscribed.store(true, Ordering::SeqCst);
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) -> TransportResult<()> {
        self.ensure_link()?;
        self.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notifier.subscribe()
    }
}

/// Simulated DOT peripheral
pub struct SimPeripheral {
    address: String,
    local_name: Option<String>,
    link: Arc<AtomicBool>,
    characteristics: Vec<Arc<SimCharacteristic>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fail_connect: AtomicBool,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    link_events: broadcast::Sender<()>,
}

impl SimPeripheral {
    /// A peripheral exposing the full DOT profile
    pub fn dot(address: &str, local_name: &str) -> Arc<Self> {
        Self::with_characteristics(address, Some(local_name), &DOT_PROFILE)
    }

    /// A peripheral exposing only the given characteristics
    pub fn with_characteristics(
        address: &str,
        local_name: Option<&str>,
        uuids: &[Uuid],
    ) -> Arc<Self> {
        let link = Arc::new(AtomicBool::new(false));
        let mac = mac_from_address(address);
        let characteristics = uuids
            .iter()
            .map(|uuid| {
                let value = match *uuid {
                    DEVICE_INFO_UUID => device_information(mac, u64::from_le_bytes([
                        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5], 0, 0,
                    ])),
                    DEVICE_CONTROL_UUID => device_control("", 60, 0),
                    BATTERY_UUID => vec![100, 0],
                    _ => Vec::new(),
                };
                Arc::new(SimCharacteristic::new(*uuid, Arc::clone(&link), value))
            })
            .collect();
        let (link_events, _) = broadcast::channel(4);

        Arc::new(Self {
            address: address.to_string(),
            local_name: local_name.map(str::to_string),
            link,
            characteristics,
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            connect_gate: Mutex::new(None),
            link_events,
        })
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Arc<SimCharacteristic>> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make the next connects wait until the returned gate is notified
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.connect_gate) = Some(Arc::clone(&gate));
        gate
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }

    /// Lose the link without the central asking for it
    pub fn drop_link(&self) {
        debug!("sim {} link lost", self.address);
        self.reset_link();
        let _ = self.link_events.send(());
    }

    /// Push a notification on a characteristic
    pub fn notify(&self, uuid: Uuid, data: Vec<u8>) -> bool {
        self.characteristic(uuid)
            .map(|c| c.notify(data))
            .unwrap_or(false)
    }

    pub fn set_battery(&self, level: u8, charging: bool) {
        if let Some(battery) = self.characteristic(BATTERY_UUID) {
            let value = vec![level, charging as u8];
            battery.set_value(value.clone());
            battery.notify(value);
        }
    }

    /// Payload type currently started through the measurement control characteristic
    pub fn active_payload(&self) -> Option<PayloadType> {
        let control = self.characteristic(MEASUREMENT_CONTROL_UUID)?;
        match control.last_write()?.as_slice() {
            [protocol::MEASUREMENT_COMMAND, 0x01, code] => protocol::payload_from_code(*code),
            _ => None,
        }
    }

    /// Stream synthetic frames for whatever payload is started
    pub fn spawn_streamer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let peripheral = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let step = period.as_millis() as u32;
            let mut timestamp = 0u32;
            loop {
                interval.tick().await;
                timestamp = timestamp.wrapping_add(step);
                if let Some(payload) = peripheral.active_payload() {
                    let channel = protocol::protocol_entry(payload).channel;
                    let frame = encode_frame(payload, &SyntheticSample::at(timestamp));
                    peripheral.notify(protocol::channel_uuid(channel), frame);
                }
            }
        })
    }

    fn reset_link(&self) {
        self.link.store(false, Ordering::SeqCst);
        for characteristic in &self.characteristics {
            characteristic.subscribed.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Peripheral for SimPeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn local_name(&self) -> Option<String> {
        self.local_name.clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.connect_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Failed(format!(
                "{} did not answer the connection request",
                self.address
            )));
        }
        self.link.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.is_connected();
        self.reset_link();
        if was_connected {
            let _ = self.link_events.send(());
        }
        Ok(())
    }

    async fn discover_characteristics(&self) -> TransportResult<Vec<Arc<dyn Characteristic>>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self
            .characteristics
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Characteristic>)
            .collect())
    }

    fn disconnect_events(&self) -> broadcast::Receiver<()> {
        self.link_events.subscribe()
    }
}

/// Simulated central advertising a fixed set of peripherals
pub struct SimCentral {
    peripherals: Mutex<Vec<Arc<SimPeripheral>>>,
    state: Mutex<AdapterState>,
    scan: Mutex<Option<mpsc::UnboundedSender<Arc<dyn Peripheral>>>>,
    advertisements_per_scan: usize,
}

impl SimCentral {
    pub fn new(peripherals: Vec<Arc<SimPeripheral>>) -> Self {
        Self {
            peripherals: Mutex::new(peripherals),
            state: Mutex::new(AdapterState::PoweredOn),
            scan: Mutex::new(None),
            advertisements_per_scan: 2,
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).is_some()
    }

    /// Add a peripheral; it is advertised right away if a scan is running
    pub fn add_peripheral(&self, peripheral: Arc<SimPeripheral>) {
        if let Some(sender) = lock(&self.scan).as_ref() {
            let _ = sender.send(Arc::clone(&peripheral) as Arc<dyn Peripheral>);
        }
        lock(&self.peripherals).push(peripheral);
    }
}

#[async_trait]
impl Central for SimCentral {
    fn adapter_state(&self) -> AdapterState {
        *lock(&self.state)
    }

    async fn start_scan(&self) -> TransportResult<mpsc::UnboundedReceiver<Arc<dyn Peripheral>>> {
        let state = self.adapter_state();
        if state != AdapterState::PoweredOn {
            return Err(TransportError::AdapterUnavailable(format!("{:?}", state)));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // Advertisements repeat while scanning, so every peripheral shows up more than once
        for _ in 0..self.advertisements_per_scan {
            for peripheral in lock(&self.peripherals).iter() {
                let _ = sender.send(Arc::clone(peripheral) as Arc<dyn Peripheral>);
            }
        }
        *lock(&self.scan) = Some(sender);
        Ok(receiver)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        lock(&self.scan).take();
        Ok(())
    }
}

fn mac_from_address(address: &str) -> [u8; 6] {
    let mut mac = [0u8; 6];
    let parts = address
        .split(':')
        .rev()
        .filter_map(|part| u8::from_str_radix(part, 16).ok());
    for (slot, byte) in mac.iter_mut().zip(parts) {
        *slot = byte;
    }
    mac
}
