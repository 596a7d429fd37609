//! Fleet Registry Module
//!
//! Owns every discovered DOT, turns discovery into device sessions and fans
//! operations out across the fleet. Per-device events are re-published on
//! one fleet stream, tagged with the device identifier.

use crate::domain::models::{
    Configuration, DeviceEvent, DeviceId, FleetEvent, PayloadType, SubscriptionKind,
};
use crate::domain::settings::FleetSettings;
use crate::error::{DotError, Result};
use crate::infrastructure::bluetooth::{
    scanner::DotScanner,
    session::{DeviceSession, SessionOptions, Subscription},
    transport::{Central, Peripheral},
};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-device outcome of a fan-out operation
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub outcomes: Vec<(DeviceId, Result<T>)>,
}

impl<T> FanOutReport<T> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failures(&self) -> Vec<(DeviceId, &DotError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (*id, e)))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    pub fn outcome(&self, id: DeviceId) -> Option<&Result<T>> {
        self.outcomes
            .iter()
            .find(|(device, _)| *device == id)
            .map(|(_, r)| r)
    }
}

/// Sessions in discovery order, plus the address index used to drop
/// repeated advertisements
#[derive(Default)]
struct Roster {
    sessions: HashMap<DeviceId, DeviceSession>,
    order: Vec<DeviceId>,
    by_address: HashMap<String, DeviceId>,
}

struct FleetInner {
    roster: RwLock<Roster>,
    events: broadcast::Sender<FleetEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    scanner: DotScanner,
    settings: FleetSettings,
}

impl Drop for FleetInner {
    fn drop(&mut self) {
        let forwarders = self
            .forwarders
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for forwarder in forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

/// Fleet of DOT sensors sharing one event stream
#[derive(Clone)]
pub struct FleetRegistry {
    inner: Arc<FleetInner>,
}

impl FleetRegistry {
    /// Create an empty registry
    pub fn new(settings: FleetSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(FleetInner {
                roster: RwLock::new(Roster::default()),
                events,
                forwarders: Mutex::new(Vec::new()),
                scanner: DotScanner::from_settings(&settings),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    /// Fleet-wide event stream
    pub fn events(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.inner.events.send(event);
    }

    fn roster(&self) -> std::sync::RwLockReadGuard<'_, Roster> {
        self.inner
            .roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Discovery
    // ============================================

    /// Scan for the configured window and register every DOT found.
    ///
    /// Returns the identifiers registered during this scan. Adapter problems
    /// are also published on the error stream without a device id.
    pub async fn scan(&self, central: &dyn Central) -> Result<Vec<DeviceId>> {
        let duration = Duration::from_millis(self.inner.settings.scan_duration_ms);
        self.scan_for(central, duration).await
    }

    pub async fn scan_for(&self, central: &dyn Central, duration: Duration) -> Result<Vec<DeviceId>> {
        let mut registered = Vec::new();
        let result = self
            .inner
            .scanner
            .run(central, duration, |peripheral| {
                if let Some(id) = self.handle_discovery(peripheral) {
                    registered.push(id);
                }
            })
            .await;

        match result {
            Ok(_) => {
                info!(
                    "Scan finished: {} new, {} available",
                    registered.len(),
                    self.available_count()
                );
                Ok(registered)
            }
            Err(error) => {
                warn!("Scan failed: {}", error);
                self.emit(FleetEvent::Error {
                    id: None,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// End a running scan early
    pub async fn stop_scan(&self, central: &dyn Central) -> Result<()> {
        info!("Stopping scan");
        central
            .stop_scan()
            .await
            .map_err(|e| DotError::Connection(e.to_string()))
    }

    /// Register a discovered peripheral.
    ///
    /// Returns the new identifier, or `None` when the name does not match or
    /// the peripheral is already registered. Spawns the event forwarder, so it
    /// must run inside a Tokio runtime.
    pub(crate) fn handle_discovery(&self, peripheral: Arc<dyn Peripheral>) -> Option<DeviceId> {
        let local_name = peripheral.local_name();
        if !self.inner.scanner.matches(local_name.as_deref()) {
            return None;
        }

        let address = peripheral.address();
        let session = {
            let mut roster = self
                .inner
                .roster
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = roster.by_address.get(&address) {
                debug!("Duplicate advertisement from {} ({})", address, existing);
                return None;
            }

            let id = DeviceId::new();
            let session = DeviceSession::new(
                id,
                peripheral,
                SessionOptions::from(&self.inner.settings),
            );
            roster.by_address.insert(address.clone(), id);
            roster.order.push(id);
            roster.sessions.insert(id, session.clone());
            session
        };

        let id = session.id();
        self.forward_events(&session);
        info!("Discovered {} as {} ({:?})", address, id, local_name);
        self.emit(FleetEvent::Discovered { id, local_name });
        Some(id)
    }

    /// Re-publish session events on the fleet stream
    fn forward_events(&self, session: &DeviceSession) {
        let id = session.id();
        let mut device_events = session.events();
        let fleet_events = self.inner.events.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match device_events.recv().await {
                    Ok(event) => {
                        let _ = fleet_events.send(FleetEvent::tagged(id, event));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} fleet forwarder skipped {} events", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.inner
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(forwarder);
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn device(&self, id: DeviceId) -> Result<DeviceSession> {
        self.roster()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(DotError::UnknownDevice(id))
    }

    /// Identifiers of every registered device, in discovery order
    pub fn identifiers(&self) -> Vec<DeviceId> {
        self.roster().order.clone()
    }

    pub fn available_count(&self) -> usize {
        self.roster().sessions.len()
    }

    pub fn connected_count(&self) -> usize {
        self.roster()
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Cached configuration; `None` until it was read
    pub fn configuration(&self, id: DeviceId) -> Result<Option<Configuration>> {
        Ok(self.device(id)?.configuration())
    }

    fn snapshot(&self) -> Vec<DeviceSession> {
        let roster = self.roster();
        let sessions = roster
            .order
            .iter()
            .filter_map(|id| roster.sessions.get(id).cloned())
            .collect();
        sessions
    }

    // ============================================
    // Per-device operations
    // ============================================

    /// Report a failed per-device operation on the error stream
    fn report<T>(&self, id: DeviceId, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            warn!("{} {} failed: {}", id, operation, error);
            self.emit(FleetEvent::tagged(id, DeviceEvent::Error(error.clone())));
        }
        result
    }

    async fn on_device<T, F, Fut>(&self, id: DeviceId, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce(DeviceSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match self.device(id) {
            Ok(session) => op(session).await,
            Err(error) => Err(error),
        };
        self.report(id, operation, result)
    }

    pub async fn connect(&self, id: DeviceId) -> Result<()> {
        self.on_device(id, "connect", |s| async move { s.connect().await })
            .await
    }

    pub async fn disconnect(&self, id: DeviceId) -> Result<()> {
        self.on_device(id, "disconnect", |s| async move { s.disconnect().await })
            .await
    }

    pub async fn query_configuration(&self, id: DeviceId) -> Result<Configuration> {
        self.on_device(id, "configuration read", |s| async move {
            s.query_configuration().await
        })
        .await
    }

    pub async fn subscribe_measurement(
        &self,
        id: DeviceId,
        payload: PayloadType,
    ) -> Result<Subscription> {
        self.on_device(id, "measurement subscribe", |s| async move {
            s.subscribe_measurement(payload).await
        })
        .await
    }

    pub async fn unsubscribe_measurement(&self, id: DeviceId, payload: PayloadType) -> Result<()> {
        self.on_device(id, "measurement unsubscribe", |s| async move {
            s.unsubscribe_measurement(payload).await
        })
        .await
    }

    pub async fn subscribe_battery(&self, id: DeviceId) -> Result<Subscription> {
        self.on_device(id, "battery subscribe", |s| async move {
            s.subscribe_battery().await
        })
        .await
    }

    pub async fn unsubscribe_battery(&self, id: DeviceId) -> Result<()> {
        self.on_device(id, "battery unsubscribe", |s| async move {
            s.unsubscribe_battery().await
        })
        .await
    }

    pub async fn subscribe_status(&self, id: DeviceId) -> Result<Subscription> {
        self.on_device(id, "status subscribe", |s| async move {
            s.subscribe_status().await
        })
        .await
    }

    pub async fn unsubscribe_status(&self, id: DeviceId) -> Result<()> {
        self.on_device(id, "status unsubscribe", |s| async move {
            s.unsubscribe_status().await
        })
        .await
    }

    // ============================================
    // Fan-out
    // ============================================

    /// Run `op` on a snapshot of the fleet concurrently and collect every outcome.
    /// One device failing never stops the others.
    async fn fan_out<T, F, Fut>(&self, operation: &str, op: F) -> FanOutReport<T>
    where
        F: Fn(DeviceSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let sessions = self.snapshot();
        debug!("{} on {} devices", operation, sessions.len());

        let outcomes = join_all(sessions.into_iter().map(|session| {
            let id = session.id();
            let pending = op(session);
            async move { (id, pending.await) }
        }))
        .await;

        let outcomes = outcomes
            .into_iter()
            .map(|(id, result)| (id, self.report(id, operation, result)))
            .collect::<Vec<_>>();

        let report = FanOutReport { outcomes };
        info!(
            "{}: {}/{} devices succeeded",
            operation,
            report.succeeded(),
            report.len()
        );
        report
    }

    pub async fn connect_all(&self) -> FanOutReport<()> {
        self.fan_out("connect", |s| async move { s.connect().await })
            .await
    }

    pub async fn disconnect_all(&self) -> FanOutReport<()> {
        self.fan_out("disconnect", |s| async move { s.disconnect().await })
            .await
    }

    pub async fn subscribe_measurement_all(&self, payload: PayloadType) -> FanOutReport<Subscription> {
        self.fan_out("measurement subscribe", |s| async move {
            s.subscribe_measurement(payload).await
        })
        .await
    }

    pub async fn unsubscribe_measurement_all(&self, payload: PayloadType) -> FanOutReport<()> {
        self.fan_out("measurement unsubscribe", |s| async move {
            s.unsubscribe_measurement(payload).await
        })
        .await
    }

    pub async fn subscribe_battery_all(&self) -> FanOutReport<Subscription> {
        self.fan_out("battery subscribe", |s| async move {
            s.subscribe_battery().await
        })
        .await
    }

    pub async fn unsubscribe_battery_all(&self) -> FanOutReport<()> {
        self.fan_out("battery unsubscribe", |s| async move {
            s.unsubscribe_battery().await
        })
        .await
    }

    pub async fn subscribe_status_all(&self) -> FanOutReport<Subscription> {
        self.fan_out("status subscribe", |s| async move {
            s.subscribe_status().await
        })
        .await
    }

    pub async fn unsubscribe_status_all(&self) -> FanOutReport<()> {
        self.fan_out("status unsubscribe", |s| async move {
            s.unsubscribe_status().await
        })
        .await
    }

    /// Active subscriptions per device
    pub async fn active_subscriptions(&self) -> Vec<(DeviceId, Vec<SubscriptionKind>)> {
        let sessions = self.snapshot();
        join_all(sessions.into_iter().map(|session| async move {
            (session.id(), session.active_subscriptions().await)
        }))
        .await
    }
}

impl Default for FleetRegistry {
    fn default() -> Self {
        Self::new(FleetSettings::default())
    }
}
