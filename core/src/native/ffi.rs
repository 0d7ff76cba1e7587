//! C layout of the simplecble API and its resolved symbol table

use crate::model::{BluetoothUuid, Characteristic, CharacteristicCapabilities, Descriptor, Service};
use crate::{Error, Result};
use std::ffi::{c_char, c_int, c_void, CStr};

pub const SIMPLEBLE_SUCCESS: c_int = 0;
pub const UUID_STR_LEN: usize = 37;
pub const CHARACTERISTIC_MAX_COUNT: usize = 16;
pub const DESCRIPTOR_MAX_COUNT: usize = 16;
pub const DATA_MAX_SIZE: usize = 27;
/// `tx_power` when the peripheral did not advertise one
pub const TX_POWER_UNAVAILABLE: i16 = i16::MIN;

pub type AdapterPtr = *mut c_void;
pub type PeripheralPtr = *mut c_void;
pub type ErrT = c_int;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawUuid {
    pub value: [c_char; UUID_STR_LEN],
}

impl RawUuid {
    pub fn from_uuid(uuid: &BluetoothUuid) -> Self {
        let mut value = [0 as c_char; UUID_STR_LEN];
        for (slot, byte) in value.iter_mut().zip(uuid.to_string().bytes()) {
            *slot = byte as c_char;
        }
        Self { value }
    }

    pub fn to_uuid(&self) -> Result<BluetoothUuid> {
        let bytes: Vec<u8> = self
            .value
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).parse()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawDescriptor {
    pub uuid: RawUuid,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawCharacteristic {
    pub uuid: RawUuid,
    pub can_read: bool,
    pub can_write_request: bool,
    pub can_write_command: bool,
    pub can_notify: bool,
    pub can_indicate: bool,
    pub descriptor_count: usize,
    pub descriptors: [RawDescriptor; DESCRIPTOR_MAX_COUNT],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawService {
    pub uuid: RawUuid,
    pub data_length: usize,
    pub data: [u8; DATA_MAX_SIZE],
    pub characteristic_count: usize,
    pub characteristics: [RawCharacteristic; CHARACTERISTIC_MAX_COUNT],
}

impl RawService {
    pub fn zeroed() -> Self {
        // SAFETY: plain-old-data struct; all-zero is a valid bit pattern
        unsafe { std::mem::zeroed() }
    }

    pub fn to_service(&self) -> Result<Service> {
        let data_len = self.data_length.min(DATA_MAX_SIZE);
        let count = self.characteristic_count.min(CHARACTERISTIC_MAX_COUNT);
        let characteristics = self.characteristics[..count]
            .iter()
            .map(|raw| {
                let descriptor_count = raw.descriptor_count.min(DESCRIPTOR_MAX_COUNT);
                let descriptors = raw.descriptors[..descriptor_count]
                    .iter()
                    .map(|d| d.uuid.to_uuid().map(|uuid| Descriptor { uuid }))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Characteristic {
                    uuid: raw.uuid.to_uuid()?,
                    capabilities: CharacteristicCapabilities {
                        read: raw.can_read,
                        write_request: raw.can_write_request,
                        write_command: raw.can_write_command,
                        notify: raw.can_notify,
                        indicate: raw.can_indicate,
                    },
                    descriptors,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Service {
            uuid: self.uuid.to_uuid()?,
            data: self.data[..data_len].to_vec(),
            characteristics,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawManufacturerData {
    pub manufacturer_id: u16,
    pub data_length: usize,
    pub data: [u8; DATA_MAX_SIZE],
}

impl RawManufacturerData {
    pub fn zeroed() -> Self {
        // SAFETY: plain-old-data struct; all-zero is a valid bit pattern
        unsafe { std::mem::zeroed() }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.data[..self.data_length.min(DATA_MAX_SIZE)].to_vec()
    }
}

pub type AdapterCallback = extern "C" fn(adapter: AdapterPtr, userdata: *mut c_void);
pub type AdapterPeripheralCallback =
    extern "C" fn(adapter: AdapterPtr, peripheral: PeripheralPtr, userdata: *mut c_void);
pub type PeripheralCallback = extern "C" fn(peripheral: PeripheralPtr, userdata: *mut c_void);
pub type ValueCallback = extern "C" fn(
    peripheral: PeripheralPtr,
    service: RawUuid,
    characteristic: RawUuid,
    data: *const u8,
    data_length: usize,
    userdata: *mut c_void,
);

/// Resolve every symbol into a plain function pointer table.
macro_rules! native_api {
    ($($field:ident: $sym:literal => $ty:ty;)*) => {
        #[derive(Clone, Copy)]
        pub struct Api {
            $(pub $field: $ty,)*
        }

        impl Api {
            /// # Safety
            /// `library` must export the simplecble C API with these exact
            /// signatures, and must outlive the returned table.
            pub unsafe fn load(library: &libloading::Library) -> Result<Self> {
                Ok(Self {
                    $($field: *library
                        .get::<$ty>(concat!($sym, "\0").as_bytes())
                        .map_err(|_| Error::MissingSymbol($sym.to_string()))?,)*
                })
            }
        }
    };
}

native_api! {
    free: "simpleble_free" => unsafe extern "C" fn(*mut c_void);

    adapter_is_bluetooth_enabled: "simpleble_adapter_is_bluetooth_enabled" => unsafe extern "C" fn() -> bool;
    adapter_get_count: "simpleble_adapter_get_count" => unsafe extern "C" fn() -> usize;
    adapter_get_handle: "simpleble_adapter_get_handle" => unsafe extern "C" fn(usize) -> AdapterPtr;
    adapter_release_handle: "simpleble_adapter_release_handle" => unsafe extern "C" fn(AdapterPtr);
    adapter_identifier: "simpleble_adapter_identifier" => unsafe extern "C" fn(AdapterPtr) -> *mut c_char;
    adapter_address: "simpleble_adapter_address" => unsafe extern "C" fn(AdapterPtr) -> *mut c_char;
    adapter_is_powered: "simpleble_adapter_is_powered" => unsafe extern "C" fn(AdapterPtr, *mut bool) -> ErrT;
    adapter_scan_start: "simpleble_adapter_scan_start" => unsafe extern "C" fn(AdapterPtr) -> ErrT;
    adapter_scan_stop: "simpleble_adapter_scan_stop" => unsafe extern "C" fn(AdapterPtr) -> ErrT;
    adapter_scan_is_active: "simpleble_adapter_scan_is_active" => unsafe extern "C" fn(AdapterPtr, *mut bool) -> ErrT;
    adapter_scan_get_results_count: "simpleble_adapter_scan_get_results_count" => unsafe extern "C" fn(AdapterPtr) -> usize;
    adapter_scan_get_results_handle: "simpleble_adapter_scan_get_results_handle" => unsafe extern "C" fn(AdapterPtr, usize) -> PeripheralPtr;
    adapter_get_paired_peripherals_count: "simpleble_adapter_get_paired_peripherals_count" => unsafe extern "C" fn(AdapterPtr) -> usize;
    adapter_get_paired_peripherals_handle: "simpleble_adapter_get_paired_peripherals_handle" => unsafe extern "C" fn(AdapterPtr, usize) -> PeripheralPtr;
    adapter_set_callback_on_scan_start: "simpleble_adapter_set_callback_on_scan_start" => unsafe extern "C" fn(AdapterPtr, AdapterCallback, *mut c_void) -> ErrT;
    adapter_set_callback_on_scan_stop: "simpleble_adapter_set_callback_on_scan_stop" => unsafe extern "C" fn(AdapterPtr, AdapterCallback, *mut c_void) -> ErrT;
    adapter_set_callback_on_scan_found: "simpleble_adapter_set_callback_on_scan_found" => unsafe extern "C" fn(AdapterPtr, AdapterPeripheralCallback, *mut c_void) -> ErrT;
    adapter_set_callback_on_scan_updated: "simpleble_adapter_set_callback_on_scan_updated" => unsafe extern "C" fn(AdapterPtr, AdapterPeripheralCallback, *mut c_void) -> ErrT;

    peripheral_release_handle: "simpleble_peripheral_release_handle" => unsafe extern "C" fn(PeripheralPtr);
    peripheral_identifier: "simpleble_peripheral_identifier" => unsafe extern "C" fn(PeripheralPtr) -> *mut c_char;
    peripheral_address: "simpleble_peripheral_address" => unsafe extern "C" fn(PeripheralPtr) -> *mut c_char;
    peripheral_address_type: "simpleble_peripheral_address_type" => unsafe extern "C" fn(PeripheralPtr) -> c_int;
    peripheral_rssi: "simpleble_peripheral_rssi" => unsafe extern "C" fn(PeripheralPtr) -> i16;
    peripheral_tx_power: "simpleble_peripheral_tx_power" => unsafe extern "C" fn(PeripheralPtr) -> i16;
    peripheral_mtu: "simpleble_peripheral_mtu" => unsafe extern "C" fn(PeripheralPtr) -> u16;
    peripheral_connect: "simpleble_peripheral_connect" => unsafe extern "C" fn(PeripheralPtr) -> ErrT;
    peripheral_disconnect: "simpleble_peripheral_disconnect" => unsafe extern "C" fn(PeripheralPtr) -> ErrT;
    peripheral_is_connected: "simpleble_peripheral_is_connected" => unsafe extern "C" fn(PeripheralPtr, *mut bool) -> ErrT;
    peripheral_is_connectable: "simpleble_peripheral_is_connectable" => unsafe extern "C" fn(PeripheralPtr, *mut bool) -> ErrT;
    peripheral_is_paired: "simpleble_peripheral_is_paired" => unsafe extern "C" fn(PeripheralPtr, *mut bool) -> ErrT;
    peripheral_unpair: "simpleble_peripheral_unpair" => unsafe extern "C" fn(PeripheralPtr) -> ErrT;
    peripheral_services_count: "simpleble_peripheral_services_count" => unsafe extern "C" fn(PeripheralPtr) -> usize;
    peripheral_services_get: "simpleble_peripheral_services_get" => unsafe extern "C" fn(PeripheralPtr, usize, *mut RawService) -> ErrT;
    peripheral_manufacturer_data_count: "simpleble_peripheral_manufacturer_data_count" => unsafe extern "C" fn(PeripheralPtr) -> usize;
    peripheral_manufacturer_data_get: "simpleble_peripheral_manufacturer_data_get" => unsafe extern "C" fn(PeripheralPtr, usize, *mut RawManufacturerData) -> ErrT;
    peripheral_read: "simpleble_peripheral_read" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, *mut *mut u8, *mut usize) -> ErrT;
    peripheral_write_request: "simpleble_peripheral_write_request" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, *const u8, usize) -> ErrT;
    peripheral_write_command: "simpleble_peripheral_write_command" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, *const u8, usize) -> ErrT;
    peripheral_notify: "simpleble_peripheral_notify" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, ValueCallback, *mut c_void) -> ErrT;
    peripheral_indicate: "simpleble_peripheral_indicate" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, ValueCallback, *mut c_void) -> ErrT;
    peripheral_unsubscribe: "simpleble_peripheral_unsubscribe" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid) -> ErrT;
    peripheral_read_descriptor: "simpleble_peripheral_read_descriptor" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, RawUuid, *mut *mut u8, *mut usize) -> ErrT;
    peripheral_write_descriptor: "simpleble_peripheral_write_descriptor" => unsafe extern "C" fn(PeripheralPtr, RawUuid, RawUuid, RawUuid, *const u8, usize) -> ErrT;
    peripheral_set_callback_on_connected: "simpleble_peripheral_set_callback_on_connected" => unsafe extern "C" fn(PeripheralPtr, PeripheralCallback, *mut c_void) -> ErrT;
    peripheral_set_callback_on_disconnected: "simpleble_peripheral_set_callback_on_disconnected" => unsafe extern "C" fn(PeripheralPtr, PeripheralCallback, *mut c_void) -> ErrT;
}

impl Api {
    /// Copy a library-owned C string and release it
    ///
    /// # Safety
    /// `ptr` must be null or a NUL-terminated string allocated by the library.
    pub unsafe fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let owned = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        (self.free)(ptr as *mut c_void);
        Some(owned)
    }

    /// Copy a library-owned byte buffer and release it
    ///
    /// # Safety
    /// `ptr` must be null or point to `len` bytes allocated by the library.
    pub unsafe fn take_bytes(&self, ptr: *mut u8, len: usize) -> Vec<u8> {
        if ptr.is_null() {
            return Vec::new();
        }
        let owned = std::slice::from_raw_parts(ptr, len).to_vec();
        (self.free)(ptr as *mut c_void);
        owned
    }
}

/// Map a native status code to a crate error naming the failed call
pub fn check(status: ErrT, call: &str) -> Result<()> {
    if status == SIMPLEBLE_SUCCESS {
        Ok(())
    } else {
        Err(Error::Native(format!("{} failed", call)))
    }
}
