// bluebridge core: native BLE interop and event bridging
//
// Loads the bundled native BLE library, binds its C surface and turns its
// asynchronous callbacks into ordered, panic-isolated listener events on
// adapters and peripherals.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod loader;
pub mod model;
pub mod native;
pub mod peripheral;
pub mod registry;
pub mod session;
pub mod signal;

use thiserror::Error;

pub use adapter::{Adapter, AdapterListener, ScanState};
pub use config::BridgeConfig;
pub use dispatch::{subscribe_failures, ListenerFailure};
pub use loader::{resolve_and_load, LoaderError, Platform, ResourceRoot};
pub use model::{
    AdapterCapabilities, AddressType, BluetoothAddress, BluetoothUuid, Characteristic,
    CharacteristicCapabilities, Descriptor, ManufacturerData, Service,
};
pub use native::Handle;
pub use peripheral::{ConnectionState, NotifyListener, Peripheral, PeripheralListener};
pub use session::Session;
pub use signal::StopSignal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("A scan is already in progress on this adapter")]
    ScanAlreadyInProgress,

    #[error("Characteristic {characteristic} in service {service} cannot notify or indicate")]
    CharacteristicNotNotifiable {
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
    },

    #[error("Cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Peripheral is not connected")]
    NotConnected,

    #[error("Unknown characteristic {characteristic} in service {service}")]
    UnknownCharacteristic {
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
    },

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Native call failed: {0}")]
    Native(String),

    #[error("Native symbol missing: {0}")]
    MissingSymbol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
