// Notify walkthrough against a simulated heart rate monitor
//
// Runs the same scan -> connect -> notify -> unsubscribe -> disconnect flow as
// `bluebridge notify`, with the native library replaced by the in-process
// mock backend so it works on machines without a radio.

use crate::{
    connect_and_wait, disconnect_and_wait, print_services, scan_until, ConnectionPrinter,
    ScanPrinter,
};
use anyhow::{Context, Result};
use bluebridge_core::native::MockBackend;
use bluebridge_core::{
    AdapterListener, BluetoothAddress, BluetoothUuid, Characteristic, CharacteristicCapabilities,
    Descriptor, Handle, NotifyListener, PeripheralListener, Service, Session, StopSignal,
};
use colored::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MONITOR_ADDRESS: &str = "C0:FF:EE:15:BE:A7";
const SAMPLES: u8 = 10;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
const SCAN_WINDOW: Duration = Duration::from_millis(500);

fn heart_rate() -> BluetoothUuid {
    BluetoothUuid::from_u16(0x180d)
}

fn measurement() -> BluetoothUuid {
    BluetoothUuid::from_u16(0x2a37)
}

fn body_location() -> BluetoothUuid {
    BluetoothUuid::from_u16(0x2a38)
}

fn monitor_services() -> Vec<Service> {
    vec![Service {
        uuid: heart_rate(),
        data: Vec::new(),
        characteristics: vec![
            Characteristic {
                uuid: measurement(),
                capabilities: CharacteristicCapabilities {
                    notify: true,
                    ..Default::default()
                },
                descriptors: vec![Descriptor {
                    uuid: BluetoothUuid::from_u16(0x2902),
                }],
            },
            Characteristic {
                uuid: body_location(),
                capabilities: CharacteristicCapabilities {
                    read: true,
                    ..Default::default()
                },
                descriptors: Vec::new(),
            },
        ],
    }]
}

/// Program one adapter and one monitor into the mock
fn stage(mock: &MockBackend) -> (Handle, Handle) {
    let adapter = mock.add_adapter("demo0", "00:1A:7D:DA:71:13");
    let monitor = mock.add_peripheral("HRM-Demo", MONITOR_ADDRESS, -61);
    mock.set_tx_power(monitor, Some(0));
    mock.set_manufacturer_data(monitor, 0xffff, &[0xbe, 0xa7]);
    mock.set_services(monitor, monitor_services());
    // Wrist
    mock.set_value(monitor, heart_rate(), body_location(), &[0x02]);
    (adapter, monitor)
}

pub fn run(stop: &StopSignal) -> Result<()> {
    let mock = Arc::new(MockBackend::new());
    let (adapter_handle, monitor) = stage(&mock);
    let session = Session::with_backend(mock.clone()).context("Failed to open demo session")?;
    let adapter = session
        .adapters()
        .first()
        .cloned()
        .context("Demo adapter missing")?;

    println!("{}", "bluebridge demo (simulated radio)".bold());
    println!();

    let scan_listener: Arc<dyn AdapterListener> = Arc::new(ScanPrinter);
    adapter.set_event_listener(&scan_listener);

    let advertiser = {
        let mock = mock.clone();
        let adapter = adapter.clone();
        std::thread::Builder::new()
            .name("bluebridge-demo-advertiser".to_string())
            .spawn(move || {
                let deadline = Instant::now() + SCAN_WINDOW;
                while !adapter.scan_is_active() {
                    if Instant::now() >= deadline {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                mock.emit_scan_found(adapter_handle, monitor);
                mock.set_rssi(monitor, -57);
                mock.emit_scan_updated(adapter_handle, monitor);
            })
            .context("Failed to start advertiser")?
    };
    let scanned = scan_until(&adapter, SCAN_WINDOW, stop);
    advertiser
        .join()
        .map_err(|_| anyhow::anyhow!("Advertiser thread panicked"))?;
    scanned?;
    if stop.is_cancelled() {
        return Ok(());
    }

    let wanted = BluetoothAddress::new(MONITOR_ADDRESS);
    let peripheral = adapter
        .scan_get_results()?
        .into_iter()
        .find(|p| p.address() == &wanted)
        .context("Monitor was not discovered")?;

    let connection: Arc<dyn PeripheralListener> = Arc::new(ConnectionPrinter);
    peripheral.set_event_listener(&connection);
    connect_and_wait(&peripheral, Duration::from_secs(5), stop)?;
    print_services(&peripheral.services()?);

    let location = peripheral.read(&heart_rate(), &body_location())?;
    println!("  Body sensor location: {}", hex::encode(&location));

    let printer: Arc<dyn NotifyListener> = Arc::new(|data: &[u8]| {
        let bpm = data.get(1).copied().unwrap_or_default();
        println!("  {} {} ({} bpm)", "←".bright_blue(), hex::encode(data), bpm);
    });
    peripheral.notify(&heart_rate(), &measurement(), &printer)?;

    for sample in 0..SAMPLES {
        if stop.wait_timeout(SAMPLE_INTERVAL) {
            break;
        }
        // Flags byte 0x00: 8-bit heart rate value follows
        mock.emit_value(monitor, heart_rate(), measurement(), &[0x00, 68 + sample % 5]);
    }

    peripheral.unsubscribe(&heart_rate(), &measurement())?;
    disconnect_and_wait(&peripheral, Duration::from_secs(5));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_runs_to_completion() {
        let stop = StopSignal::new();
        run(&stop).unwrap();
    }

    #[test]
    fn test_interrupted_demo_does_not_hang() {
        let stop = StopSignal::new();
        stop.cancel();

        let started = Instant::now();
        run(&stop).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
