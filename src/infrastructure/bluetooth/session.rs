//! Device Session
//!
//! Connection state machine and notification subscriptions for one DOT.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                 |
//!      +--------failure-----------+                 |
//!      +--------------- Disconnecting <--disconnect()
//!      +---------------------- link lost -----------+
//! ```
//!
//! Operations on one session are serialized through a single async mutex.
//! Disconnecting (or losing the link) bumps a cancellation epoch so whatever
//! is in flight fails with [`DotError::Connection`] instead of touching
//! stale characteristic handles.

use crate::domain::models::{
    Configuration, ConnectionState, DeviceEvent, DeviceId, PayloadType, SubscriptionKind,
};
use crate::domain::settings::FleetSettings;
use crate::error::{DotError, Result};
use crate::infrastructure::bluetooth::codec;
use crate::infrastructure::bluetooth::protocol::{
    self, ControlAction, BATTERY_UUID, DEVICE_CONTROL_UUID, DEVICE_INFO_UUID, DEVICE_REPORT_UUID,
    MEASUREMENT_CONTROL_UUID,
};
use crate::infrastructure::bluetooth::transport::{Characteristic, Peripheral, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Per-session behaviour
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Read the configuration as the last step of `connect()`
    pub query_configuration_on_connect: bool,
    pub event_channel_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            query_configuration_on_connect: true,
            event_channel_capacity: 256,
        }
    }
}

impl From<&FleetSettings> for SessionOptions {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            query_configuration_on_connect: settings.query_configuration_on_connect,
            event_channel_capacity: settings.event_channel_capacity.max(1),
        }
    }
}

/// Discovered characteristics keyed by UUID; only populated while connected
#[derive(Default)]
struct CharacteristicTable {
    by_uuid: HashMap<Uuid, Arc<dyn Characteristic>>,
}

impl CharacteristicTable {
    fn rebuild(characteristics: Vec<Arc<dyn Characteristic>>) -> Self {
        Self {
            by_uuid: characteristics
                .into_iter()
                .map(|c| (c.uuid(), c))
                .collect(),
        }
    }

    fn get(&self, uuid: &Uuid) -> Result<Arc<dyn Characteristic>> {
        self.by_uuid.get(uuid).cloned().ok_or_else(|| {
            DotError::CharacteristicUnavailable(format!(
                "{} characteristic ({}) not found",
                protocol::characteristic_name(uuid),
                uuid
            ))
        })
    }

    fn len(&self) -> usize {
        self.by_uuid.len()
    }

    fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    fn clear(&mut self) {
        self.by_uuid.clear();
    }
}

/// A notification listener forwarding decoded values to the session events
struct Binding {
    id: u64,
    characteristic: Arc<dyn Characteristic>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionInner {
    characteristics: CharacteristicTable,
    bindings: HashMap<SubscriptionKind, Binding>,
    link_watch: Option<JoinHandle<()>>,
    next_binding: u64,
}

impl SessionInner {
    fn release_bindings(&mut self) {
        for (_, binding) in self.bindings.drain() {
            binding.task.abort();
        }
    }

    fn abort_link_watch(&mut self) {
        if let Some(watch) = self.link_watch.take() {
            watch.abort();
        }
    }

    fn teardown(&mut self) {
        self.abort_link_watch();
        self.release_bindings();
        self.characteristics.clear();
    }

    /// Measurement payload currently holding a notification channel
    fn channel_owner(&self, payload: PayloadType) -> Option<PayloadType> {
        let channel = protocol::protocol_entry(payload).channel;
        self.bindings.keys().find_map(|kind| match kind {
            SubscriptionKind::Measurement(active)
                if protocol::protocol_entry(*active).channel == channel =>
            {
                Some(*active)
            }
            _ => None,
        })
    }
}

struct SessionCore {
    id: DeviceId,
    peripheral: Arc<dyn Peripheral>,
    options: SessionOptions,
    state: watch::Sender<ConnectionState>,
    cancel: watch::Sender<u64>,
    events: broadcast::Sender<DeviceEvent>,
    configuration: StdMutex<Option<Configuration>>,
    inner: Mutex<SessionInner>,
}

enum ConnectClaim {
    Claimed,
    AlreadyConnected,
    Busy(ConnectionState),
}

impl SessionCore {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("{} state -> {}", self.id, next);
            self.emit(DeviceEvent::ConnectionChanged(next));
        }
    }

    /// Move Disconnected -> Connecting atomically
    fn claim_connect(&self) -> ConnectClaim {
        let mut claim = ConnectClaim::Claimed;
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                true
            }
            ConnectionState::Connected => {
                claim = ConnectClaim::AlreadyConnected;
                false
            }
            other => {
                claim = ConnectClaim::Busy(other);
                false
            }
        });
        if matches!(claim, ConnectClaim::Claimed) {
            debug!("{} state -> {}", self.id, ConnectionState::Connecting);
            self.emit(DeviceEvent::ConnectionChanged(ConnectionState::Connecting));
        }
        claim
    }

    /// Fail every operation currently waiting on the transport
    fn cancel_pending(&self) {
        self.cancel.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    fn cached_configuration(&self) -> Option<Configuration> {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_configuration(&self, configuration: Option<Configuration>) {
        *self
            .configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = configuration;
    }
}

fn aborted() -> DotError {
    DotError::Connection("operation aborted: device disconnected".to_string())
}

fn transport_error(context: &str, error: TransportError) -> DotError {
    match error {
        TransportError::NotConnected => {
            DotError::CharacteristicUnavailable(format!("{}: device not connected", context))
        }
        other => DotError::Connection(format!("{}: {}", context, other)),
    }
}

fn into_connection_error(error: DotError) -> DotError {
    match error {
        DotError::Connection(_) => error,
        other => DotError::Connection(other.to_string()),
    }
}

/// Run a transport operation unless the session gets disconnected first
async fn guarded<T, F>(cancel: &mut watch::Receiver<u64>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.changed() => Err(aborted()),
        result = operation => result,
    }
}

/// Connection and subscription handling for one sensor
#[derive(Clone)]
pub struct DeviceSession {
    core: Arc<SessionCore>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

impl DeviceSession {
    pub fn new(id: DeviceId, peripheral: Arc<dyn Peripheral>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (cancel, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(options.event_channel_capacity.max(1));
        debug!("{} session created", id);

        Self {
            core: Arc::new(SessionCore {
                id,
                peripheral,
                options,
                state,
                cancel,
                events,
                configuration: StdMutex::new(None),
                inner: Mutex::new(SessionInner::default()),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.core.id
    }

    pub fn local_name(&self) -> Option<String> {
        self.core.peripheral.local_name()
    }

    pub fn address(&self) -> String {
        self.core.peripheral.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Connection changes, decoded notifications and notification errors
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.core.events.subscribe()
    }

    /// Configuration read during the last connect or query
    pub fn configuration(&self) -> Option<Configuration> {
        self.core.cached_configuration()
    }

    pub async fn characteristic_count(&self) -> usize {
        self.core.inner.lock().await.characteristics.len()
    }

    pub async fn active_subscriptions(&self) -> Vec<SubscriptionKind> {
        self.core.inner.lock().await.bindings.keys().copied().collect()
    }

    /// Lock the session for an operation, failing if a disconnect happened while waiting
    async fn begin(&self) -> Result<(watch::Receiver<u64>, MutexGuard<'_, SessionInner>)> {
        let cancel = self.core.cancel.subscribe();
        let inner = self.core.inner.lock().await;
        if cancel.has_changed().unwrap_or(true) {
            return Err(aborted());
        }
        Ok((cancel, inner))
    }

    fn require_connected(&self, inner: &SessionInner) -> Result<()> {
        if self.state() != ConnectionState::Connected || inner.characteristics.is_empty() {
            return Err(DotError::CharacteristicUnavailable(format!(
                "{} is not connected",
                self.core.id
            )));
        }
        Ok(())
    }

    /// Connect, discover characteristics and optionally read the configuration.
    ///
    /// Returns immediately when already connected. A second call while a
    /// connection attempt is in flight fails with [`DotError::Busy`].
    pub async fn connect(&self) -> Result<()> {
        let core = &self.core;
        let mut cancel = core.cancel.subscribe();

        match core.claim_connect() {
            ConnectClaim::AlreadyConnected => {
                debug!("{} already connected", core.id);
                return Ok(());
            }
            ConnectClaim::Busy(state) => {
                warn!("{} connect rejected while {}", core.id, state);
                return Err(DotError::Busy(format!("{} is {}", core.id, state)));
            }
            ConnectClaim::Claimed => {}
        }

        info!("{} connecting", core.id);
        let mut inner = core.inner.lock().await;

        match self.establish(&mut inner, &mut cancel).await {
            Ok(configuration) => {
                core.store_configuration(configuration);
                core.set_state(ConnectionState::Connected);
                info!(
                    "{} connected ({} characteristics)",
                    core.id,
                    inner.characteristics.len()
                );
                Ok(())
            }
            Err(error) => {
                warn!("{} connection failed: {}", core.id, error);
                inner.teardown();
                core.store_configuration(None);
                if let Err(e) = core.peripheral.disconnect().await {
                    debug!("{} cleanup disconnect failed: {}", core.id, e);
                }
                core.set_state(ConnectionState::Disconnected);
                Err(into_connection_error(error))
            }
        }
    }

    async fn establish(
        &self,
        inner: &mut SessionInner,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<Option<Configuration>> {
        let core = &self.core;

        inner.teardown();
        core.store_configuration(None);
        inner.link_watch = Some(self.watch_link());

        guarded(cancel, async {
            core.peripheral
                .connect()
                .await
                .map_err(|e| DotError::Connection(e.to_string()))
        })
        .await?;

        let characteristics = guarded(cancel, async {
            core.peripheral
                .discover_characteristics()
                .await
                .map_err(|e| DotError::Connection(format!("discovery failed: {}", e)))
        })
        .await?;

        if characteristics.is_empty() {
            return Err(DotError::Connection(
                "no characteristics discovered".to_string(),
            ));
        }
        inner.characteristics = CharacteristicTable::rebuild(characteristics);
        debug!(
            "{} discovered {} characteristics",
            core.id,
            inner.characteristics.len()
        );

        if !core.options.query_configuration_on_connect {
            return Ok(None);
        }

        let configuration =
            guarded(cancel, self.read_configuration(&inner.characteristics)).await?;
        Ok(Some(configuration))
    }

    /// React to link loss reported by the transport
    fn watch_link(&self) -> JoinHandle<()> {
        let mut link = self.core.peripheral.disconnect_events();
        let core = Arc::clone(&self.core);

        tokio::spawn(async move {
            match link.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }

            warn!("{} link lost", core.id);
            core.cancel_pending();

            let mut inner = core.inner.lock().await;
            // dropping our own handle detaches this task instead of aborting it
            inner.link_watch.take();
            inner.release_bindings();
            inner.characteristics.clear();
            core.store_configuration(None);
            core.set_state(ConnectionState::Disconnected);
        })
    }

    /// Disconnect and drop every subscription. No-op unless connecting or connected.
    pub async fn disconnect(&self) -> Result<()> {
        let core = &self.core;
        if !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("{} disconnect ignored while {}", core.id, self.state());
            return Ok(());
        }

        core.cancel_pending();
        let mut inner = core.inner.lock().await;

        // an aborted connect may already have cleaned up
        if !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }

        core.set_state(ConnectionState::Disconnecting);
        inner.abort_link_watch();
        let result = core.peripheral.disconnect().await;
        inner.teardown();
        core.store_configuration(None);
        core.set_state(ConnectionState::Disconnected);

        match result {
            Ok(()) => {
                info!("{} disconnected", core.id);
                Ok(())
            }
            Err(e) => {
                warn!("{} transport disconnect failed: {}", core.id, e);
                Err(DotError::Connection(format!("disconnect failed: {}", e)))
            }
        }
    }

    /// Configuration of the connected device, read once and cached until it disconnects
    pub async fn query_configuration(&self) -> Result<Configuration> {
        let not_connected = || DotError::Read(format!("{} is not connected", self.core.id));
        if !self.is_connected() {
            return Err(not_connected());
        }
        if let Some(configuration) = self.configuration() {
            return Ok(configuration);
        }

        let (mut cancel, inner) = self.begin().await?;
        if !self.is_connected() || inner.characteristics.is_empty() {
            return Err(not_connected());
        }

        let configuration =
            guarded(&mut cancel, self.read_configuration(&inner.characteristics)).await?;
        self.core.store_configuration(Some(configuration.clone()));
        debug!("{} configuration: {:?}", self.core.id, configuration);
        Ok(configuration)
    }

    async fn read_configuration(&self, table: &CharacteristicTable) -> Result<Configuration> {
        let as_read = |e: DotError| DotError::Read(e.to_string());
        let information = table.get(&DEVICE_INFO_UUID).map_err(as_read)?;
        let control = table.get(&DEVICE_CONTROL_UUID).map_err(as_read)?;

        let information = information
            .read()
            .await
            .map_err(|e| DotError::Read(format!("device information: {}", e)))?;
        let control = control
            .read()
            .await
            .map_err(|e| DotError::Read(format!("device control: {}", e)))?;

        codec::decode_configuration(&information, &control).map_err(as_read)
    }

    /// Start a measurement stream.
    ///
    /// Writes `[0x01, 0x01, code]` to the measurement control characteristic
    /// and enables notifications on the payload's channel. Re-subscribing the
    /// active payload returns the existing binding; a different payload on an
    /// occupied channel is a [`DotError::ProtocolConflict`].
    pub async fn subscribe_measurement(&self, payload: PayloadType) -> Result<Subscription> {
        let entry = protocol::protocol_entry(payload);
        let kind = SubscriptionKind::Measurement(payload);
        let (mut cancel, mut inner) = self.begin().await?;
        self.require_connected(&inner)?;

        if let Some(binding) = inner.bindings.get(&kind) {
            debug!("{} already streaming {}", self.core.id, payload);
            return Ok(self.handle(kind, binding.id));
        }
        if let Some(active) = inner.channel_owner(payload) {
            return Err(DotError::ProtocolConflict {
                channel: entry.channel,
                active,
                requested: payload,
            });
        }

        let control = inner.characteristics.get(&MEASUREMENT_CONTROL_UUID)?;
        let target = inner
            .characteristics
            .get(&protocol::channel_uuid(entry.channel))?;

        // listen before starting so the first frame is not missed
        let listener = target.notifications();
        let frame = protocol::control_frame(payload, ControlAction::Start);
        guarded(&mut cancel, async {
            control
                .write(&frame, false)
                .await
                .map_err(|e| transport_error("measurement control write", e))
        })
        .await?;
        let enabled = guarded(&mut cancel, async {
            target
                .subscribe()
                .await
                .map_err(|e| transport_error("enable measurement notifications", e))
        })
        .await;
        if let Err(error) = enabled {
            // the device is already streaming; stop it so nothing runs unbound
            let stop = protocol::control_frame(payload, ControlAction::Stop);
            if let Err(e) = control.write(&stop, false).await {
                warn!("{} could not stop {} after failed subscribe: {}", self.core.id, payload, e);
            }
            return Err(error);
        }

        let id = self.bind(&mut inner, kind, target, listener, move |data| {
            codec::decode_measurement(payload, data).map(DeviceEvent::Measurement)
        });
        info!(
            "{} measurement notifications enabled ({} on {} channel)",
            self.core.id, payload, entry.channel
        );
        Ok(self.handle(kind, id))
    }

    /// Stop a measurement stream: stop frame, disable notifications, drop the listener
    pub async fn unsubscribe_measurement(&self, payload: PayloadType) -> Result<()> {
        self.unbind(SubscriptionKind::Measurement(payload), None)
            .await
    }

    /// Enable device report notifications
    pub async fn subscribe_status(&self) -> Result<Subscription> {
        self.subscribe_notify(SubscriptionKind::Status, DEVICE_REPORT_UUID, |data| {
            codec::decode_status(data).map(DeviceEvent::Status)
        })
        .await
    }

    pub async fn unsubscribe_status(&self) -> Result<()> {
        self.unbind(SubscriptionKind::Status, None).await
    }

    /// Enable battery notifications and publish the current level right away
    pub async fn subscribe_battery(&self) -> Result<Subscription> {
        let subscription = self
            .subscribe_notify(SubscriptionKind::Battery, BATTERY_UUID, |data| {
                codec::decode_battery(data).map(DeviceEvent::Battery)
            })
            .await?;

        let (mut cancel, inner) = self.begin().await?;
        let battery = inner.characteristics.get(&BATTERY_UUID)?;
        let initial = guarded(&mut cancel, async {
            battery
                .read()
                .await
                .map_err(|e| DotError::Read(format!("battery: {}", e)))
        })
        .await
        .and_then(|data| codec::decode_battery(&data));

        match initial {
            Ok(level) => self.core.emit(DeviceEvent::Battery(level)),
            Err(e) => warn!("{} initial battery read failed: {}", self.core.id, e),
        }
        Ok(subscription)
    }

    pub async fn unsubscribe_battery(&self) -> Result<()> {
        self.unbind(SubscriptionKind::Battery, None).await
    }

    async fn subscribe_notify<F>(
        &self,
        kind: SubscriptionKind,
        uuid: Uuid,
        decode: F,
    ) -> Result<Subscription>
    where
        F: Fn(&[u8]) -> Result<DeviceEvent> + Send + 'static,
    {
        let (mut cancel, mut inner) = self.begin().await?;
        self.require_connected(&inner)?;

        if let Some(binding) = inner.bindings.get(&kind) {
            return Ok(self.handle(kind, binding.id));
        }

        let characteristic = inner.characteristics.get(&uuid)?;
        let listener = characteristic.notifications();
        guarded(&mut cancel, async {
            characteristic
                .subscribe()
                .await
                .map_err(|e| transport_error("enable notifications", e))
        })
        .await?;

        let id = self.bind(&mut inner, kind, characteristic, listener, decode);
        info!("{} {:?} notifications enabled", self.core.id, kind);
        Ok(self.handle(kind, id))
    }

    /// Tear down a subscription. `only` restricts it to one binding so stale
    /// handles cannot cancel a newer subscription.
    async fn unbind(&self, kind: SubscriptionKind, only: Option<u64>) -> Result<()> {
        let (mut cancel, mut inner) = self.begin().await?;

        let current = match inner.bindings.get(&kind) {
            Some(binding) => binding.id,
            None => {
                if let SubscriptionKind::Measurement(payload) = kind {
                    if let Some(active) = inner.channel_owner(payload) {
                        if only.is_none() {
                            return Err(DotError::ProtocolConflict {
                                channel: protocol::protocol_entry(payload).channel,
                                active,
                                requested: payload,
                            });
                        }
                    }
                }
                debug!("{} {:?} is not subscribed", self.core.id, kind);
                return Ok(());
            }
        };
        if only.is_some_and(|id| id != current) {
            debug!("{} stale {:?} handle ignored", self.core.id, kind);
            return Ok(());
        }

        if let SubscriptionKind::Measurement(payload) = kind {
            let control = inner.characteristics.get(&MEASUREMENT_CONTROL_UUID)?;
            let frame = protocol::control_frame(payload, ControlAction::Stop);
            guarded(&mut cancel, async {
                control
                    .write(&frame, false)
                    .await
                    .map_err(|e| transport_error("measurement control write", e))
            })
            .await?;
        }

        if let Some(binding) = inner.bindings.remove(&kind) {
            binding.task.abort();
            guarded(&mut cancel, async {
                binding
                    .characteristic
                    .unsubscribe()
                    .await
                    .map_err(|e| transport_error("disable notifications", e))
            })
            .await?;
        }

        info!("{} {:?} notifications disabled", self.core.id, kind);
        Ok(())
    }

    fn bind<F>(
        &self,
        inner: &mut SessionInner,
        kind: SubscriptionKind,
        characteristic: Arc<dyn Characteristic>,
        mut listener: broadcast::Receiver<Vec<u8>>,
        decode: F,
    ) -> u64
    where
        F: Fn(&[u8]) -> Result<DeviceEvent> + Send + 'static,
    {
        inner.next_binding += 1;
        let id = inner.next_binding;
        let device = self.core.id;
        let events = self.core.events.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(data) => match decode(&data) {
                        Ok(event) => {
                            trace!("{} {:?}: {:?}", device, kind, event);
                            let _ = events.send(event);
                        }
                        Err(error) => {
                            warn!("{} dropped {:?} notification: {}", device, kind, error);
                            let _ = events.send(DeviceEvent::Error(error));
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} {:?} listener skipped {} notifications", device, kind, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        inner.bindings.insert(
            kind,
            Binding {
                id,
                characteristic,
                task,
            },
        );
        id
    }

    fn handle(&self, kind: SubscriptionKind, binding: u64) -> Subscription {
        Subscription {
            session: self.clone(),
            kind,
            binding,
        }
    }
}

/// Handle to one notification binding. Cancelling it is a no-op once the
/// binding was replaced or the device disconnected.
#[derive(Debug, Clone)]
pub struct Subscription {
    session: DeviceSession,
    kind: SubscriptionKind,
    binding: u64,
}

impl Subscription {
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn device(&self) -> DeviceId {
        self.session.id()
    }

    pub async fn is_active(&self) -> bool {
        self.session
            .core
            .inner
            .lock()
            .await
            .bindings
            .get(&self.kind)
            .is_some_and(|binding| binding.id == self.binding)
    }

    pub async fn cancel(self) -> Result<()> {
        self.session.unbind(self.kind, Some(self.binding)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BatteryEvent, DeviceStatus, MeasurementFrame};
    use crate::infrastructure::bluetooth::protocol::{MEDIUM_PAYLOAD_UUID, SHORT_PAYLOAD_UUID};
    use crate::infrastructure::bluetooth::sim::{self, SimPeripheral, SyntheticSample, DOT_PROFILE};
    use std::time::Duration;

    fn session_for(peripheral: &Arc<SimPeripheral>) -> DeviceSession {
        DeviceSession::new(
            DeviceId::new(),
            Arc::clone(peripheral) as Arc<dyn Peripheral>,
            SessionOptions::default(),
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<DeviceEvent>, predicate: F) -> DeviceEvent
    where
        F: Fn(&DeviceEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if predicate(&event) {
                return event;
            }
        }
    }

    async fn wait_for_connect_call(peripheral: &SimPeripheral) {
        for _ in 0..100 {
            if peripheral.connect_calls() > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connect was never called");
    }

    #[tokio::test]
    async fn test_connect_discovers_and_reads_configuration() {
        let peripheral = SimPeripheral::dot("d4:22:cd:00:0a:01", "Xsens DOT");
        let session = session_for(&peripheral);

        session.connect().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.characteristic_count().await, DOT_PROFILE.len());
        let configuration = session.configuration().unwrap();
        assert_eq!(configuration.mac_address, "d4:22:cd:00:0a:01");
        assert_eq!(session.query_configuration().await.unwrap(), configuration);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:01", "Xsens DOT");
        let session = session_for(&peripheral);

        session.connect().await.unwrap();
        session.connect().await.unwrap();

        assert_eq!(peripheral.connect_calls(), 1);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_session_disconnected() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:02", "Xsens DOT");
        peripheral.set_fail_connect(true);
        let session = session_for(&peripheral);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, DotError::Connection(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.characteristic_count().await, 0);

        // no automatic retry, but a later attempt may succeed
        peripheral.set_fail_connect(false);
        session.connect().await.unwrap();
        assert_eq!(peripheral.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_configuration_failure_fails_connect() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:03", "Xsens DOT");
        peripheral
            .characteristic(DEVICE_INFO_UUID)
            .unwrap()
            .set_value(vec![0; 10]);
        let session = session_for(&peripheral);

        assert!(matches!(
            session.connect().await,
            Err(DotError::Connection(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!peripheral.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_connect_is_busy() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:04", "Xsens DOT");
        let gate = peripheral.hold_connect();
        let session = session_for(&peripheral);

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        wait_for_connect_call(&peripheral).await;
        assert_eq!(session.state(), ConnectionState::Connecting);

        assert!(matches!(session.connect().await, Err(DotError::Busy(_))));
        assert_eq!(peripheral.connect_calls(), 1);

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(session.is_connected());
        assert_eq!(peripheral.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_pending_connect() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:05", "Xsens DOT");
        let _gate = peripheral.hold_connect();
        let session = session_for(&peripheral);

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        wait_for_connect_call(&peripheral).await;

        session.disconnect().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(DotError::Connection(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.characteristic_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_table_and_subscriptions() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:06", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        session
            .subscribe_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();
        let mut events = session.events();

        session.disconnect().await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::ConnectionChanged(ConnectionState::Disconnecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::ConnectionChanged(ConnectionState::Disconnected)
        );
        assert_eq!(session.characteristic_count().await, 0);
        assert!(session.active_subscriptions().await.is_empty());

        // disconnecting again does not reach the transport
        session.disconnect().await.unwrap();
        assert_eq!(peripheral.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_measurement_writes_control_frame() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:07", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        let mut events = session.events();

        let subscription = session
            .subscribe_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();
        assert_eq!(
            subscription.kind(),
            SubscriptionKind::Measurement(PayloadType::CompleteQuaternion)
        );

        let control = peripheral.characteristic(MEASUREMENT_CONTROL_UUID).unwrap();
        assert_eq!(control.writes(), vec![(vec![0x01, 0x01, 0x03], false)]);
        let medium = peripheral.characteristic(MEDIUM_PAYLOAD_UUID).unwrap();
        assert!(medium.is_subscribed());

        let sample = SyntheticSample::at(2_000);
        assert!(peripheral.notify(
            MEDIUM_PAYLOAD_UUID,
            sim::encode_frame(PayloadType::CompleteQuaternion, &sample)
        ));
        match next_event(&mut events).await {
            DeviceEvent::Measurement(MeasurementFrame::CompleteQuaternion {
                timestamp,
                quaternion,
                ..
            }) => {
                assert_eq!(timestamp, 2_000);
                assert_eq!(quaternion, sample.quaternion);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_resubscribe() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:08", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        let payload = PayloadType::OrientationEuler;
        let short = peripheral.characteristic(SHORT_PAYLOAD_UUID).unwrap();
        let control = peripheral.characteristic(MEASUREMENT_CONTROL_UUID).unwrap();

        session.subscribe_measurement(payload).await.unwrap();
        let subscribed = session.active_subscriptions().await;

        session.unsubscribe_measurement(payload).await.unwrap();
        assert_eq!(control.last_write(), Some(vec![0x01, 0x00, 0x06]));
        assert!(!short.is_subscribed());
        assert!(session.active_subscriptions().await.is_empty());

        let mut events = session.events();
        session.subscribe_measurement(payload).await.unwrap();
        assert_eq!(session.active_subscriptions().await, subscribed);
        assert_eq!(control.last_write(), Some(vec![0x01, 0x01, 0x06]));
        assert!(short.is_subscribed());

        // exactly one listener after rebinding
        peripheral.notify(
            SHORT_PAYLOAD_UUID,
            sim::encode_frame(payload, &SyntheticSample::at(10)),
        );
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Measurement(_)
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribing_active_payload_reuses_binding() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:09", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();

        let first = session
            .subscribe_measurement(PayloadType::CustomMode5)
            .await
            .unwrap();
        let second = session
            .subscribe_measurement(PayloadType::CustomMode5)
            .await
            .unwrap();

        assert!(first.is_active().await);
        assert!(second.is_active().await);
        let control = peripheral.characteristic(MEASUREMENT_CONTROL_UUID).unwrap();
        assert_eq!(control.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_same_channel_subscription_conflicts() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:0a", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();

        session
            .subscribe_measurement(PayloadType::CompleteQuaternion)
            .await
            .unwrap();

        let err = session
            .subscribe_measurement(PayloadType::ExtendedEuler)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DotError::ProtocolConflict {
                channel: crate::domain::models::Channel::Medium,
                active: PayloadType::CompleteQuaternion,
                requested: PayloadType::ExtendedEuler,
            }
        );
        assert!(matches!(
            session.unsubscribe_measurement(PayloadType::ExtendedEuler).await,
            Err(DotError::ProtocolConflict { .. })
        ));

        // the short channel is still free
        session
            .subscribe_measurement(PayloadType::FreeAcceleration)
            .await
            .unwrap();
        assert_eq!(session.active_subscriptions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_cancel_new_binding() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:0b", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();

        let stale = session
            .subscribe_measurement(PayloadType::RateQuantities)
            .await
            .unwrap();
        session
            .unsubscribe_measurement(PayloadType::RateQuantities)
            .await
            .unwrap();
        let current = session
            .subscribe_measurement(PayloadType::RateQuantities)
            .await
            .unwrap();

        stale.cancel().await.unwrap();
        assert!(current.is_active().await);

        current.clone().cancel().await.unwrap();
        assert!(!current.is_active().await);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:0c", "Xsens DOT");
        let session = session_for(&peripheral);

        assert!(matches!(
            session
                .subscribe_measurement(PayloadType::CompleteEuler)
                .await,
            Err(DotError::CharacteristicUnavailable(_))
        ));
        assert!(matches!(
            session.subscribe_battery().await,
            Err(DotError::CharacteristicUnavailable(_))
        ));
        assert!(matches!(
            session.query_configuration().await,
            Err(DotError::Read(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_reported() {
        let profile: Vec<Uuid> = DOT_PROFILE
            .iter()
            .copied()
            .filter(|uuid| *uuid != SHORT_PAYLOAD_UUID && *uuid != DEVICE_INFO_UUID)
            .collect();
        let peripheral = SimPeripheral::with_characteristics("00:00:00:00:00:0d", None, &profile);
        let session = DeviceSession::new(
            DeviceId::new(),
            Arc::clone(&peripheral) as Arc<dyn Peripheral>,
            SessionOptions {
                query_configuration_on_connect: false,
                ..Default::default()
            },
        );
        session.connect().await.unwrap();

        assert!(matches!(
            session
                .subscribe_measurement(PayloadType::OrientationQuaternion)
                .await,
            Err(DotError::CharacteristicUnavailable(_))
        ));
        assert!(session.active_subscriptions().await.is_empty());
        assert!(matches!(
            session.query_configuration().await,
            Err(DotError::Read(_))
        ));
    }

    #[tokio::test]
    async fn test_link_loss_disconnects_session() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:0e", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        session.subscribe_status().await.unwrap();
        let mut events = session.events();

        peripheral.drop_link();

        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::ConnectionChanged(ConnectionState::Disconnected)
        );
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.characteristic_count().await, 0);
        assert!(session.active_subscriptions().await.is_empty());

        // reconnecting works after an unsolicited disconnect
        session.connect().await.unwrap();
        assert_eq!(peripheral.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_configuration_is_dropped_when_the_device_goes_away() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:11", "Xsens DOT");
        let session = session_for(&peripheral);

        session.connect().await.unwrap();
        assert!(session.query_configuration().await.is_ok());
        session.disconnect().await.unwrap();
        assert!(session.configuration().is_none());
        assert!(matches!(
            session.query_configuration().await,
            Err(DotError::Read(_))
        ));

        session.connect().await.unwrap();
        assert!(session.configuration().is_some());
        let mut events = session.events();
        peripheral.drop_link();
        next_matching(&mut events, |event| {
            *event == DeviceEvent::ConnectionChanged(ConnectionState::Disconnected)
        })
        .await;
        assert!(session.configuration().is_none());
        assert!(matches!(
            session.query_configuration().await,
            Err(DotError::Read(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_notification_enable_stops_the_stream() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:12", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        let medium = peripheral.characteristic(MEDIUM_PAYLOAD_UUID).unwrap();
        medium.set_fail_subscribe(true);

        assert!(matches!(
            session
                .subscribe_measurement(PayloadType::CompleteQuaternion)
                .await,
            Err(DotError::Connection(_))
        ));

        let control = peripheral.characteristic(MEASUREMENT_CONTROL_UUID).unwrap();
        assert_eq!(
            control.writes(),
            vec![(vec![0x01, 0x01, 0x03], false), (vec![0x01, 0x00, 0x03], false)]
        );
        assert!(!medium.is_subscribed());
        assert!(session.active_subscriptions().await.is_empty());

        // the channel is free for another payload
        medium.set_fail_subscribe(false);
        session
            .subscribe_measurement(PayloadType::ExtendedQuaternion)
            .await
            .unwrap();
        assert!(medium.is_subscribed());
    }

    async fn wait_for_io(characteristic: &sim::SimCharacteristic) {
        for _ in 0..100 {
            if characteristic.io_calls() > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("characteristic was never read or written");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_subscribe() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:13", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        let control = peripheral.characteristic(MEASUREMENT_CONTROL_UUID).unwrap();
        let _gate = control.hold_io();

        let pending = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .subscribe_measurement(PayloadType::CompleteEuler)
                    .await
            }
        });
        wait_for_io(&control).await;

        session.disconnect().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(DotError::Connection(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.active_subscriptions().await.is_empty());
        assert!(control.writes().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_configuration_read() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:14", "Xsens DOT");
        let session = DeviceSession::new(
            DeviceId::new(),
            Arc::clone(&peripheral) as Arc<dyn Peripheral>,
            SessionOptions {
                query_configuration_on_connect: false,
                ..SessionOptions::default()
            },
        );
        session.connect().await.unwrap();
        let info = peripheral.characteristic(DEVICE_INFO_UUID).unwrap();
        let _gate = info.hold_io();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.query_configuration().await }
        });
        wait_for_io(&info).await;

        session.disconnect().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(DotError::Connection(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.configuration().is_none());
    }

    #[tokio::test]
    async fn test_battery_subscription_publishes_initial_level() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:0f", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        let mut events = session.events();

        session.subscribe_battery().await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Battery(BatteryEvent {
                level: 100,
                charging: false
            })
        );

        peripheral.set_battery(42, true);
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Battery(BatteryEvent {
                level: 42,
                charging: true
            })
        );

        session.unsubscribe_battery().await.unwrap();
        assert!(!peripheral
            .characteristic(BATTERY_UUID)
            .unwrap()
            .is_subscribed());
    }

    #[tokio::test]
    async fn test_status_button_callback_carries_timestamp() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:10", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        session.subscribe_status().await.unwrap();
        let mut events = session.events();

        let mut report = vec![0x34, 0x04];
        report.extend_from_slice(&9_000u32.to_le_bytes());
        peripheral.notify(DEVICE_REPORT_UUID, report);

        match next_event(&mut events).await {
            DeviceEvent::Status(status) => {
                assert_eq!(status.status, DeviceStatus::ButtonCallback);
                assert_eq!(status.timestamp, Some(9_000));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_notification_is_reported() {
        let peripheral = SimPeripheral::dot("00:00:00:00:00:11", "Xsens DOT");
        let session = session_for(&peripheral);
        session.connect().await.unwrap();
        session
            .subscribe_measurement(PayloadType::DeltaQuantitiesWithMag)
            .await
            .unwrap();
        let mut events = session.events();

        peripheral.notify(MEDIUM_PAYLOAD_UUID, vec![0u8; 37]);

        let event = next_matching(&mut events, |e| matches!(e, DeviceEvent::Error(_))).await;
        assert!(matches!(
            event,
            DeviceEvent::Error(DotError::Decode { .. })
        ));
        // the stream keeps running
        assert_eq!(
            session.active_subscriptions().await,
            vec![SubscriptionKind::Measurement(
                PayloadType::DeltaQuantitiesWithMag
            )]
        );
    }
}
