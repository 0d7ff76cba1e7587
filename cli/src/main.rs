// bluebridge CLI
//
// Cross-platform (macOS, Linux, Windows) driver for the bluebridge core:
// list adapters, scan, connect and stream notifications.

mod config;
mod demo;

use anyhow::{Context, Result};
use bluebridge_core::{
    subscribe_failures, Adapter, AdapterListener, BluetoothAddress, BluetoothUuid,
    ConnectionState, NotifyListener, Peripheral, PeripheralListener, Service, Session, StopSignal,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often blocking waits check for Ctrl-C
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "bluebridge")]
#[command(about = "bluebridge: native BLE bridge driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Adapter identifier or address (overrides the config file)
    #[arg(short, long, global = true)]
    adapter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List Bluetooth adapters
    Adapters,
    /// Scan for peripherals
    Scan {
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },
    /// Connect to a peripheral and print its services
    Connect { address: String },
    /// Subscribe to a characteristic and print incoming values
    Notify {
        address: String,
        service: String,
        characteristic: String,
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the notify walkthrough against a simulated heart rate monitor
    Demo,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Config { action } => return cmd_config(action),
        command => command,
    };

    let mut config = config::Config::load()?;
    if cli.adapter.is_some() {
        config.adapter = cli.adapter;
    }

    let stop = StopSignal::new();
    spawn_interrupt_handler(stop.clone());
    spawn_failure_reporter();

    tokio::task::spawn_blocking(move || match command {
        Commands::Adapters => cmd_adapters(&config),
        Commands::Scan { duration_ms } => cmd_scan(&config, &stop, duration_ms),
        Commands::Connect { address } => cmd_connect(&config, &stop, &address),
        Commands::Notify {
            address,
            service,
            characteristic,
            seconds,
        } => cmd_notify(&config, &stop, &address, &service, &characteristic, seconds),
        Commands::Demo => demo::run(&stop),
        Commands::Config { .. } => Ok(()),
    })
    .await
    .context("Command worker panicked")?
}

/// Cancel `stop` on Ctrl-C so long-running commands can wind down cleanly
fn spawn_interrupt_handler(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("{}", "Interrupted, shutting down...".yellow());
            stop.cancel();
        }
    });
}

/// Print listener panics reported by the core
fn spawn_failure_reporter() {
    let mut failures = subscribe_failures();
    tokio::spawn(async move {
        while let Ok(failure) = failures.recv().await {
            eprintln!(
                "{} {} on #{} panicked: {}",
                "⚠".bright_red(),
                failure.callback,
                failure.handle,
                failure.message
            );
        }
    });
}

fn open_session(config: &config::Config) -> Result<Session> {
    let bridge = config.effective_bridge();
    let session = Session::load(&bridge).context("Failed to load the native BLE library")?;
    if !session.bluetooth_enabled() {
        println!("{}", "Bluetooth is disabled on this host".bright_red());
    }
    Ok(session)
}

fn select_adapter(session: &Session, config: &config::Config) -> Result<Adapter> {
    match &config.adapter {
        Some(name) => session
            .adapter(name)
            .with_context(|| format!("No adapter named {}", name)),
        None => session
            .adapters()
            .first()
            .cloned()
            .context("No Bluetooth adapters found"),
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

struct ScanPrinter;

impl AdapterListener for ScanPrinter {
    fn on_scan_start(&self) {
        println!("{}", "Scan started".dimmed());
    }

    fn on_scan_stop(&self) {
        println!("{}", "Scan stopped".dimmed());
    }

    fn on_scan_found(&self, peripheral: &Peripheral) {
        println!(
            "  {} {} {} {} dBm",
            "+".bright_green(),
            peripheral.address().as_str().bright_cyan(),
            display_name(peripheral),
            peripheral.rssi()
        );
    }

    fn on_scan_updated(&self, peripheral: &Peripheral) {
        tracing::debug!(
            "Updated {} rssi={}",
            peripheral.address(),
            peripheral.rssi()
        );
    }
}

struct ConnectionPrinter;

impl PeripheralListener for ConnectionPrinter {
    fn on_connected(&self, peripheral: &Peripheral) {
        println!(
            "{} Connected to {}",
            "✓".green(),
            peripheral.address().as_str().bright_cyan()
        );
    }

    fn on_disconnected(&self, peripheral: &Peripheral) {
        println!(
            "{} Disconnected from {}",
            "•".yellow(),
            peripheral.address().as_str().bright_cyan()
        );
    }
}

fn display_name(peripheral: &Peripheral) -> String {
    if peripheral.identifier().is_empty() {
        "(unnamed)".dimmed().to_string()
    } else {
        peripheral.identifier().to_string()
    }
}

fn print_services(services: &[Service]) {
    for service in services {
        println!("  {} {}", "Service".bold(), service.uuid);
        for characteristic in &service.characteristics {
            let caps = characteristic.capabilities;
            let mut flags = Vec::new();
            if caps.read {
                flags.push("read");
            }
            if caps.write_request {
                flags.push("write");
            }
            if caps.write_command {
                flags.push("write-no-rsp");
            }
            if caps.notify {
                flags.push("notify");
            }
            if caps.indicate {
                flags.push("indicate");
            }
            println!(
                "    {} {} [{}]",
                "•".bright_green(),
                characteristic.uuid,
                flags.join(", ").dimmed()
            );
            for descriptor in &characteristic.descriptors {
                println!("      {}", descriptor.uuid.to_string().dimmed());
            }
        }
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn cmd_adapters(config: &config::Config) -> Result<()> {
    let session = open_session(config)?;

    if session.adapters().is_empty() {
        println!("{}", "No adapters found.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Adapters".bold(), session.adapters().len());
    for adapter in session.adapters() {
        let caps = adapter.capabilities();
        println!(
            "  {} {} {} {}",
            "•".bright_green(),
            adapter.identifier().bright_cyan(),
            adapter.address(),
            if caps.powered {
                "powered".green()
            } else {
                "off".red()
            }
        );
    }
    Ok(())
}

/// Scan for up to `duration`; Ctrl-C or a native stop ends it early
fn scan_until(adapter: &Adapter, duration: Duration, stop: &StopSignal) -> Result<()> {
    adapter.scan_start().context("Scan failed")?;
    let deadline = Instant::now() + duration;
    while adapter.scan_is_active() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stop.wait_timeout(remaining.min(POLL_INTERVAL)) {
            break;
        }
    }
    adapter.scan_stop()?;
    Ok(())
}

fn cmd_scan(config: &config::Config, stop: &StopSignal, duration_ms: Option<u64>) -> Result<()> {
    let session = open_session(config)?;
    let adapter = select_adapter(&session, config)?;
    let duration = duration_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.bridge.scan_duration());

    let listener: Arc<dyn AdapterListener> = Arc::new(ScanPrinter);
    adapter.set_event_listener(&listener);

    println!(
        "{} on {} for {} ms",
        "Scanning".bold(),
        adapter.identifier().bright_cyan(),
        duration.as_millis()
    );
    scan_until(&adapter, duration, stop)?;

    let results = adapter.scan_get_results()?;
    println!();
    println!("{} ({} peripherals)", "Results".bold(), results.len());
    for peripheral in results {
        let connectable = if peripheral.is_connectable() {
            "connectable".green()
        } else {
            "non-connectable".dimmed()
        };
        println!(
            "  {} {} {} {} dBm {}",
            "•".bright_green(),
            peripheral.address().as_str().bright_cyan(),
            display_name(&peripheral),
            peripheral.rssi(),
            connectable
        );
        for (company, data) in peripheral.manufacturer_data() {
            println!("      mfr 0x{:04x}: {}", company, hex::encode(data).dimmed());
        }
    }
    Ok(())
}

/// Locate a peripheral by address among paired devices, then by scanning
fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    config: &config::Config,
    stop: &StopSignal,
) -> Result<Peripheral> {
    let wanted = BluetoothAddress::new(address);

    if let Some(found) = adapter
        .get_paired_peripherals()?
        .into_iter()
        .find(|p| p.address() == &wanted)
    {
        return Ok(found);
    }

    println!("{} for {}...", "Scanning".bold(), address.bright_cyan());
    scan_until(adapter, config.bridge.scan_duration(), stop)?;
    if stop.is_cancelled() {
        anyhow::bail!("Interrupted");
    }
    adapter
        .scan_get_results()?
        .into_iter()
        .find(|p| p.address() == &wanted)
        .with_context(|| format!("Peripheral {} not found", address))
}

fn connect_and_wait(peripheral: &Peripheral, timeout: Duration, stop: &StopSignal) -> Result<()> {
    peripheral.connect().context("Failed to start connecting")?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if peripheral.wait_for_state(ConnectionState::Connected, remaining.min(POLL_INTERVAL)) {
            return Ok(());
        }
        if stop.is_cancelled() || remaining.is_zero() {
            break;
        }
    }
    // Cancel a still-pending attempt before giving up
    if peripheral.connection_state() == ConnectionState::Connecting {
        if let Err(e) = peripheral.disconnect() {
            tracing::debug!("Cancel of pending connect skipped: {}", e);
        }
    }
    if stop.is_cancelled() {
        anyhow::bail!("Interrupted while connecting to {}", peripheral.address());
    }
    anyhow::bail!("Could not connect to {}", peripheral.address())
}

fn disconnect_and_wait(peripheral: &Peripheral, timeout: Duration) {
    if let Err(e) = peripheral.disconnect() {
        tracing::debug!("Disconnect skipped: {}", e);
        return;
    }
    if !peripheral.wait_for_state(ConnectionState::Disconnected, timeout) {
        println!("{}", "Peripheral did not confirm the disconnect".yellow());
    }
}

fn cmd_connect(config: &config::Config, stop: &StopSignal, address: &str) -> Result<()> {
    let session = open_session(config)?;
    let adapter = select_adapter(&session, config)?;
    let peripheral = find_peripheral(&adapter, address, config, stop)?;

    let listener: Arc<dyn PeripheralListener> = Arc::new(ConnectionPrinter);
    peripheral.set_event_listener(&listener);

    let timeout = config.bridge.connect_timeout();
    connect_and_wait(&peripheral, timeout, stop)?;

    println!("  MTU: {}", peripheral.mtu()?);
    print_services(&peripheral.services()?);

    disconnect_and_wait(&peripheral, timeout);
    Ok(())
}

fn cmd_notify(
    config: &config::Config,
    stop: &StopSignal,
    address: &str,
    service: &str,
    characteristic: &str,
    seconds: Option<u64>,
) -> Result<()> {
    let service: BluetoothUuid = service.parse().context("Invalid service UUID")?;
    let characteristic: BluetoothUuid =
        characteristic.parse().context("Invalid characteristic UUID")?;
    let seconds = seconds.unwrap_or(config.notify_seconds);

    let session = open_session(config)?;
    let adapter = select_adapter(&session, config)?;
    let peripheral = find_peripheral(&adapter, address, config, stop)?;

    let connection: Arc<dyn PeripheralListener> = Arc::new(ConnectionPrinter);
    peripheral.set_event_listener(&connection);

    let timeout = config.bridge.connect_timeout();
    connect_and_wait(&peripheral, timeout, stop)?;

    let printer: Arc<dyn NotifyListener> = Arc::new(|data: &[u8]| {
        println!("  {} {}", "←".bright_blue(), hex::encode(data));
    });
    peripheral
        .notify(&service, &characteristic, &printer)
        .with_context(|| format!("Cannot subscribe to {}/{}", service, characteristic))?;

    println!(
        "{} to {} for {}s (Ctrl-C to stop)",
        "Listening".bold(),
        characteristic.to_string().bright_cyan(),
        seconds
    );
    stop.wait_timeout(Duration::from_secs(seconds));

    peripheral.unsubscribe(&service, &characteristic)?;
    disconnect_and_wait(&peripheral, timeout);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown or unset config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  {}",
                format!("file: {}", config::Config::config_file()?.display()).dimmed()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluebridge_core::native::mock::ConnectOutcome;
    use bluebridge_core::native::MockBackend;

    fn mock_adapter() -> (Arc<MockBackend>, Session, Adapter) {
        let mock = Arc::new(MockBackend::new());
        mock.add_adapter("hci0", "00:1A:7D:DA:71:13");
        let session = Session::with_backend(mock.clone()).unwrap();
        let adapter = session.adapters()[0].clone();
        (mock, session, adapter)
    }

    #[test]
    fn test_interrupt_ends_scan_early() {
        let (_mock, _session, adapter) = mock_adapter();
        let stop = StopSignal::new();
        let canceller = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.cancel();
            })
        };

        let started = Instant::now();
        scan_until(&adapter, Duration::from_secs(30), &stop).unwrap();
        canceller.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!adapter.scan_is_active());
    }

    #[test]
    fn test_scan_runs_until_deadline_without_interrupt() {
        let (_mock, _session, adapter) = mock_adapter();
        let stop = StopSignal::new();

        let started = Instant::now();
        scan_until(&adapter, Duration::from_millis(120), &stop).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert!(!adapter.scan_is_active());
    }

    #[test]
    fn test_interrupt_cancels_pending_connect() {
        let (mock, _session, adapter) = mock_adapter();
        let handle = mock.add_peripheral("slow", "C0:FF:EE:00:00:09", -60);
        mock.set_paired(handle, true);
        mock.set_connect_outcome(handle, ConnectOutcome::Hold);
        let peripheral = adapter.get_paired_peripherals().unwrap().remove(0);

        let stop = StopSignal::new();
        stop.cancel();
        let started = Instant::now();
        let result = connect_and_wait(&peripheral, Duration::from_secs(30), &stop);

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
        mock.release_connect(handle, false);
    }
}
