//! BLE Scanner Module
//!
//! Handles discovery of DOT sensors by advertised local name.

use crate::domain::settings::FleetSettings;
use crate::error::{DotError, Result};
use crate::infrastructure::bluetooth::transport::{AdapterState, Central, Peripheral};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scanner for discovering DOT sensors
#[derive(Debug, Clone)]
pub struct DotScanner {
    accepted_names: Vec<String>,
}

impl DotScanner {
    /// Create a scanner accepting the given local names (exact match)
    pub fn new(accepted_names: Vec<String>) -> Self {
        Self { accepted_names }
    }

    pub fn from_settings(settings: &FleetSettings) -> Self {
        Self::new(settings.accepted_local_names.clone())
    }

    /// Whether an advertised local name belongs to a DOT
    pub fn matches(&self, local_name: Option<&str>) -> bool {
        local_name.is_some_and(|name| self.accepted_names.iter().any(|accepted| accepted == name))
    }

    /// Scan for `duration`, handing every advertisement to `on_found`.
    ///
    /// Advertisements are not filtered or de-duplicated here; the scan is
    /// stopped when the window closes or the transport ends the stream.
    pub async fn run<F>(
        &self,
        central: &dyn Central,
        duration: Duration,
        mut on_found: F,
    ) -> Result<usize>
    where
        F: FnMut(Arc<dyn Peripheral>),
    {
        let state = central.adapter_state();
        if state != AdapterState::PoweredOn {
            warn!("Bluetooth adapter not ready: {:?}", state);
            return Err(DotError::Connection(format!(
                "bluetooth adapter not ready ({:?})",
                state
            )));
        }

        info!("Starting BLE scan for {:?}", duration);
        let mut advertisements = central
            .start_scan()
            .await
            .map_err(|e| DotError::Connection(e.to_string()))?;

        let deadline = Instant::now() + duration;
        let mut seen = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, advertisements.recv()).await {
                Ok(Some(peripheral)) => {
                    seen += 1;
                    debug!(
                        "Advertisement from {} ({:?})",
                        peripheral.address(),
                        peripheral.local_name()
                    );
                    on_found(peripheral);
                }
                Ok(None) => {
                    debug!("Scan stream ended by transport");
                    break;
                }
                Err(_) => break,
            }
        }

        info!("Stopping BLE scan ({} advertisements)", seen);
        central
            .stop_scan()
            .await
            .map_err(|e| DotError::Connection(e.to_string()))?;
        Ok(seen)
    }
}

impl Default for DotScanner {
    fn default() -> Self {
        Self::from_settings(&FleetSettings::default())
    }
}
