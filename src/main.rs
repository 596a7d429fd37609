use anyhow::Context;
use dot_fleet::domain::settings::SettingsService;
use dot_fleet::infrastructure::bluetooth::sim::{SimCentral, SimPeripheral};
use dot_fleet::infrastructure::logging::init_logger;
use dot_fleet::{FleetEvent, FleetRegistry};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const STREAM_PERIOD: Duration = Duration::from_millis(100);
const RUN_TIME: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting DOT fleet demo ({})", settings_service.path().display());

    // Simulated sensors standing in for the radio
    let peripherals = vec![
        SimPeripheral::dot("d4:22:cd:00:10:01", "Xsens DOT"),
        SimPeripheral::dot("d4:22:cd:00:10:02", "Movella DOT"),
        SimPeripheral::dot("d4:22:cd:00:10:03", "Xsens DOT"),
    ];
    let streamers: Vec<_> = peripherals
        .iter()
        .map(|p| p.spawn_streamer(STREAM_PERIOD))
        .collect();
    let central = SimCentral::new(peripherals);

    let fleet = FleetRegistry::new(settings.fleet.clone());
    let mut events = fleet.events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Event printer skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let scan_window = Duration::from_millis(settings.fleet.scan_duration_ms).min(Duration::from_secs(1));
    fleet.scan_for(&central, scan_window).await?;

    let connected = fleet.connect_all().await;
    info!("{}/{} devices connected", connected.succeeded(), connected.len());

    for id in fleet.identifiers() {
        if let Ok(Some(configuration)) = fleet.configuration(id) {
            info!(
                "{} {} firmware {} serial {}",
                id,
                configuration.mac_address,
                configuration.firmware.version,
                configuration.serial_hex()
            );
        }
    }

    let payload = settings.fleet.default_payload;
    fleet.subscribe_battery_all().await;
    fleet.subscribe_measurement_all(payload).await;

    tokio::time::sleep(RUN_TIME).await;

    fleet.unsubscribe_measurement_all(payload).await;
    fleet.unsubscribe_battery_all().await;
    let disconnected = fleet.disconnect_all().await;
    info!(
        "{}/{} devices disconnected",
        disconnected.succeeded(),
        disconnected.len()
    );

    for streamer in streamers {
        streamer.abort();
    }
    // let the printer drain what is already queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    Ok(())
}

fn print_event(event: &FleetEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Could not serialize event: {}", e),
    }
}
