//! Native binding surface
//!
//! `NativeBackend` is the fixed set of entry points the host needs from the
//! native BLE stack. Calls are synchronous; connect and disconnect may block
//! until the radio settles. Asynchronous native callbacks are converted into
//! [`NativeEvent`] values and pushed into the bound [`EventSink`] from
//! whatever thread the native stack uses.

pub mod ffi;
pub mod mock;
pub mod simpleble;

use crate::model::{BluetoothUuid, PeripheralSnapshot, Service};
use crate::Result;
use std::fmt;
use std::sync::Arc;

pub use mock::MockBackend;
pub use simpleble::SimpleBleBackend;

/// Opaque native object identifier, stable for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback raised by the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    ScanStart {
        adapter: Handle,
    },
    ScanStop {
        adapter: Handle,
    },
    ScanFound {
        adapter: Handle,
        peripheral: Handle,
    },
    ScanUpdated {
        adapter: Handle,
        peripheral: Handle,
    },
    Connected {
        peripheral: Handle,
    },
    Disconnected {
        peripheral: Handle,
    },
    ValueChanged {
        peripheral: Handle,
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
        data: Vec<u8>,
    },
}

impl NativeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NativeEvent::ScanStart { .. } => "scan_start",
            NativeEvent::ScanStop { .. } => "scan_stop",
            NativeEvent::ScanFound { .. } => "scan_found",
            NativeEvent::ScanUpdated { .. } => "scan_updated",
            NativeEvent::Connected { .. } => "connected",
            NativeEvent::Disconnected { .. } => "disconnected",
            NativeEvent::ValueChanged { .. } => "value_changed",
        }
    }
}

/// Receiver for native callbacks; invoked from native threads.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: NativeEvent);
}

/// Entry points into the native BLE stack
pub trait NativeBackend: Send + Sync {
    /// Register the receiver for every subsequent native callback
    fn bind(&self, sink: Arc<dyn EventSink>);

    fn bluetooth_enabled(&self) -> bool;

    /// Enumerate adapters; called once per session
    fn adapters(&self) -> Result<Vec<Handle>>;

    fn adapter_identifier(&self, adapter: Handle) -> Result<String>;
    fn adapter_address(&self, adapter: Handle) -> Result<String>;
    fn adapter_is_powered(&self, adapter: Handle) -> Result<bool>;

    fn scan_start(&self, adapter: Handle) -> Result<()>;
    fn scan_stop(&self, adapter: Handle) -> Result<()>;
    fn scan_is_active(&self, adapter: Handle) -> Result<bool>;
    fn scan_results(&self, adapter: Handle) -> Result<Vec<Handle>>;
    fn paired_peripherals(&self, adapter: Handle) -> Result<Vec<Handle>>;

    /// Current advertised metadata of a peripheral
    fn peripheral_info(&self, peripheral: Handle) -> Result<PeripheralSnapshot>;

    fn connect(&self, peripheral: Handle) -> Result<()>;
    fn disconnect(&self, peripheral: Handle) -> Result<()>;
    fn is_connected(&self, peripheral: Handle) -> Result<bool>;
    fn is_paired(&self, peripheral: Handle) -> Result<bool>;
    fn unpair(&self, peripheral: Handle) -> Result<()>;
    fn mtu(&self, peripheral: Handle) -> Result<u16>;

    /// GATT discovery result for a connected peripheral
    fn services(&self, peripheral: Handle) -> Result<Vec<Service>>;

    fn read(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<Vec<u8>>;
    fn write_request(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()>;
    fn write_command(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()>;

    fn notify(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()>;
    fn indicate(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()>;
    fn unsubscribe(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()>;

    fn read_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
    ) -> Result<Vec<u8>>;
    fn write_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()>;
}
