//! Value types that cross the native boundary
//!
//! These are plain data holders: UUID and address wrappers, the GATT tree
//! (services, characteristics, descriptors) and the per-observation snapshot
//! of a peripheral's advertised metadata.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Manufacturer-specific advertisement payloads keyed by company identifier
pub type ManufacturerData = BTreeMap<u16, Vec<u8>>;

// ============================================================================
// UUID
// ============================================================================

/// 128-bit Bluetooth UUID, displayed in canonical lowercase hyphenated form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BluetoothUuid(Uuid);

impl BluetoothUuid {
    /// Expand a 16-bit assigned number against the Bluetooth base UUID
    pub fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Expand a 32-bit assigned number against the Bluetooth base UUID
    pub fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The assigned number, if this UUID lives in the Bluetooth base range
    pub fn as_short(&self) -> Option<u32> {
        let value = self.0.as_u128();
        if value & ((1u128 << 96) - 1) == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

impl FromStr for BluetoothUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches(char::from(0)).trim();
        let is_short = matches!(trimmed.len(), 4 | 8)
            && trimmed.chars().all(|c| c.is_ascii_hexdigit());
        if is_short {
            let short = u32::from_str_radix(trimmed, 16)
                .map_err(|_| Error::InvalidUuid(s.to_string()))?;
            return Ok(Self::from_u32(short));
        }
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|_| Error::InvalidUuid(s.to_string()))
    }
}

impl TryFrom<String> for BluetoothUuid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BluetoothUuid> for String {
    fn from(uuid: BluetoothUuid) -> Self {
        uuid.to_string()
    }
}

impl From<Uuid> for BluetoothUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<u16> for BluetoothUuid {
    fn from(short: u16) -> Self {
        Self::from_u16(short)
    }
}

impl fmt::Display for BluetoothUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for BluetoothUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BluetoothUuid({})", self.0.hyphenated())
    }
}

// ============================================================================
// ADDRESS
// ============================================================================

/// Device address as reported by the native stack.
///
/// Platforms disagree on formatting (`AA:BB:..`, `aa-bb-..`, or an opaque
/// UUID on macOS), so equality ignores case and separators.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BluetoothAddress(String);

impl BluetoothAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Uppercase alphanumerics with separators removed
    pub fn normalized(&self) -> String {
        self.0
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }
}

impl PartialEq for BluetoothAddress {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for BluetoothAddress {}

impl Hash for BluetoothAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BluetoothAddress({})", self.0)
    }
}

/// Address type advertised by a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AddressType {
    Public,
    Random,
    #[default]
    Unspecified,
}

impl AddressType {
    /// Map the native enum value; anything unknown is `Unspecified`
    pub fn from_native(value: i32) -> Self {
        match value {
            0 => AddressType::Public,
            1 => AddressType::Random,
            _ => AddressType::Unspecified,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
            AddressType::Unspecified => write!(f, "unspecified"),
        }
    }
}

// ============================================================================
// GATT TREE
// ============================================================================

/// What a characteristic supports, fixed at discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicCapabilities {
    pub read: bool,
    pub write_request: bool,
    pub write_command: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicCapabilities {
    /// Whether value pushes (notify or indicate) can be subscribed to
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: BluetoothUuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: BluetoothUuid,
    pub capabilities: CharacteristicCapabilities,
    pub descriptors: Vec<Descriptor>,
}

/// A discovered GATT service with its raw advertised service data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: BluetoothUuid,
    pub data: Vec<u8>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: &BluetoothUuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Adapter capability flags captured at enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub bluetooth_enabled: bool,
    pub powered: bool,
}

/// Everything the native stack reports about a peripheral in one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralSnapshot {
    pub identifier: String,
    pub address: BluetoothAddress,
    pub address_type: AddressType,
    pub rssi: i16,
    pub tx_power: Option<i16>,
    pub connectable: bool,
    pub manufacturer_data: ManufacturerData,
}
