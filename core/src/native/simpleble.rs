//! `NativeBackend` over the dynamically loaded simplecble library
//!
//! The C API hands out a fresh heap handle for every scan callback, so raw
//! pointers are not stable identities. The backend keeps one retained
//! pointer per device (keyed by adapter identifier or peripheral address)
//! and gives the host a stable [`Handle`] for it. Duplicate pointers are
//! released immediately.

use super::ffi::{self, check, AdapterPtr, Api, PeripheralPtr, RawManufacturerData, RawService, RawUuid};
use super::{EventSink, Handle, NativeBackend, NativeEvent};
use crate::loader::LoadedLibrary;
use crate::model::{AddressType, BluetoothAddress, BluetoothUuid, ManufacturerData, PeripheralSnapshot, Service};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

/// Raw native handle that may be moved across threads
#[derive(Clone, Copy, PartialEq, Eq)]
struct RawHandle(*mut c_void);

// SAFETY: simplecble handles are heap objects guarded internally by the
// library; the library allows calls on them from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

#[derive(Default)]
struct HandleTable {
    next: u64,
    adapters: HashMap<Handle, RawHandle>,
    adapter_keys: HashMap<String, Handle>,
    peripherals: HashMap<Handle, RawHandle>,
    peripheral_keys: HashMap<PeripheralKey, Handle>,
    by_ptr: HashMap<usize, Handle>,
}

/// Identity used to fold fresh native pointers onto one handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PeripheralKey {
    Address(BluetoothAddress),
    Identifier(String),
    /// Neither address nor identifier reported; the pointer is all we have
    Pointer(usize),
}

fn peripheral_key(address: Option<String>, identifier: Option<String>, ptr: usize) -> PeripheralKey {
    if let Some(address) = address.map(BluetoothAddress::new) {
        if !address.normalized().is_empty() {
            return PeripheralKey::Address(address);
        }
    }
    match identifier {
        Some(identifier) if !identifier.trim().is_empty() => PeripheralKey::Identifier(identifier),
        _ => PeripheralKey::Pointer(ptr),
    }
}

impl HandleTable {
    fn allocate(&mut self) -> Handle {
        self.next += 1;
        Handle(self.next)
    }
}

/// State reachable from native callbacks through the `userdata` pointer
struct CallbackHub {
    api: Api,
    handles: Mutex<HandleTable>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl CallbackHub {
    fn emit(&self, event: NativeEvent) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.deliver(event),
            None => tracing::debug!("No sink bound, dropping native {}", event.kind()),
        }
    }

    fn userdata(&self) -> *mut c_void {
        self as *const CallbackHub as *mut c_void
    }

    fn adapter_ptr(&self, handle: Handle) -> Result<AdapterPtr> {
        self.handles
            .lock()
            .adapters
            .get(&handle)
            .map(|raw| raw.0)
            .ok_or_else(|| Error::AdapterNotFound(handle.to_string()))
    }

    fn peripheral_ptr(&self, handle: Handle) -> Result<PeripheralPtr> {
        self.handles
            .lock()
            .peripherals
            .get(&handle)
            .map(|raw| raw.0)
            .ok_or_else(|| Error::Native(format!("unknown peripheral handle {}", handle)))
    }

    fn handle_for_ptr(&self, ptr: *mut c_void) -> Option<Handle> {
        self.handles.lock().by_ptr.get(&(ptr as usize)).copied()
    }

    /// Map a (possibly fresh) adapter pointer to its stable handle
    fn register_adapter(&self, ptr: AdapterPtr) -> Option<Handle> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null adapter handle returned by the library
        let identifier = unsafe { self.api.take_string((self.api.adapter_identifier)(ptr)) }
            .unwrap_or_default();

        let mut table = self.handles.lock();
        if let Some(handle) = table.adapter_keys.get(&identifier).copied() {
            let retained = table.adapters.get(&handle).copied();
            drop(table);
            if retained != Some(RawHandle(ptr)) {
                // SAFETY: duplicate handle owned by us, never used again
                unsafe { (self.api.adapter_release_handle)(ptr) };
            }
            return Some(handle);
        }
        let handle = table.allocate();
        table.adapters.insert(handle, RawHandle(ptr));
        table.adapter_keys.insert(identifier, handle);
        table.by_ptr.insert(ptr as usize, handle);
        drop(table);

        let userdata = self.userdata();
        // SAFETY: the hub outlives every registration (see `SimpleBleBackend::new`)
        let status = unsafe {
            [
                (self.api.adapter_set_callback_on_scan_start)(ptr, on_scan_start, userdata),
                (self.api.adapter_set_callback_on_scan_stop)(ptr, on_scan_stop, userdata),
                (self.api.adapter_set_callback_on_scan_found)(ptr, on_scan_found, userdata),
                (self.api.adapter_set_callback_on_scan_updated)(ptr, on_scan_updated, userdata),
            ]
        };
        if status.iter().any(|s| *s != ffi::SIMPLEBLE_SUCCESS) {
            tracing::warn!("Failed to register scan callbacks for adapter {}", handle);
        }
        Some(handle)
    }

    /// Map a (possibly fresh) peripheral pointer to its stable handle
    fn register_peripheral(&self, ptr: PeripheralPtr) -> Option<Handle> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null peripheral handle returned by the library
        let address = unsafe { self.api.take_string((self.api.peripheral_address)(ptr)) };
        let key = match peripheral_key(address, None, ptr as usize) {
            PeripheralKey::Address(address) => PeripheralKey::Address(address),
            _ => {
                // SAFETY: as above
                let identifier =
                    unsafe { self.api.take_string((self.api.peripheral_identifier)(ptr)) };
                peripheral_key(None, identifier, ptr as usize)
            }
        };

        let mut table = self.handles.lock();
        if let Some(handle) = table.peripheral_keys.get(&key).copied() {
            let retained = table.peripherals.get(&handle).copied();
            drop(table);
            if retained != Some(RawHandle(ptr)) {
                // SAFETY: duplicate handle owned by us, never used again
                unsafe { (self.api.peripheral_release_handle)(ptr) };
            }
            return Some(handle);
        }
        let handle = table.allocate();
        table.peripherals.insert(handle, RawHandle(ptr));
        table.peripheral_keys.insert(key, handle);
        table.by_ptr.insert(ptr as usize, handle);
        drop(table);

        let userdata = self.userdata();
        // SAFETY: the hub outlives every registration (see `SimpleBleBackend::new`)
        let status = unsafe {
            [
                (self.api.peripheral_set_callback_on_connected)(ptr, on_connected, userdata),
                (self.api.peripheral_set_callback_on_disconnected)(ptr, on_disconnected, userdata),
            ]
        };
        if status.iter().any(|s| *s != ffi::SIMPLEBLE_SUCCESS) {
            tracing::warn!("Failed to register connection callbacks for peripheral {}", handle);
        }
        Some(handle)
    }
}

// ============================================================================
// TRAMPOLINES
// ============================================================================

/// Run a callback body without letting a panic unwind into C
fn guarded(name: &str, body: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(body)).is_err() {
        tracing::error!("Panic in native {} callback", name);
    }
}

/// # Safety
/// `userdata` must be null or the pointer produced by `CallbackHub::userdata`.
unsafe fn hub_from<'a>(userdata: *mut c_void) -> Option<&'a CallbackHub> {
    (userdata as *const CallbackHub).as_ref()
}

extern "C" fn on_scan_start(adapter: AdapterPtr, userdata: *mut c_void) {
    guarded("scan_start", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        if let Some(adapter) = hub.handle_for_ptr(adapter) {
            hub.emit(NativeEvent::ScanStart { adapter });
        }
    });
}

extern "C" fn on_scan_stop(adapter: AdapterPtr, userdata: *mut c_void) {
    guarded("scan_stop", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        if let Some(adapter) = hub.handle_for_ptr(adapter) {
            hub.emit(NativeEvent::ScanStop { adapter });
        }
    });
}

extern "C" fn on_scan_found(adapter: AdapterPtr, peripheral: PeripheralPtr, userdata: *mut c_void) {
    guarded("scan_found", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        let (Some(adapter), Some(peripheral)) =
            (hub.handle_for_ptr(adapter), hub.register_peripheral(peripheral))
        else {
            return;
        };
        hub.emit(NativeEvent::ScanFound { adapter, peripheral });
    });
}

extern "C" fn on_scan_updated(adapter: AdapterPtr, peripheral: PeripheralPtr, userdata: *mut c_void) {
    guarded("scan_updated", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        let (Some(adapter), Some(peripheral)) =
            (hub.handle_for_ptr(adapter), hub.register_peripheral(peripheral))
        else {
            return;
        };
        hub.emit(NativeEvent::ScanUpdated { adapter, peripheral });
    });
}

extern "C" fn on_connected(peripheral: PeripheralPtr, userdata: *mut c_void) {
    guarded("connected", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        if let Some(peripheral) = hub.handle_for_ptr(peripheral) {
            hub.emit(NativeEvent::Connected { peripheral });
        }
    });
}

extern "C" fn on_disconnected(peripheral: PeripheralPtr, userdata: *mut c_void) {
    guarded("disconnected", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        if let Some(peripheral) = hub.handle_for_ptr(peripheral) {
            hub.emit(NativeEvent::Disconnected { peripheral });
        }
    });
}

extern "C" fn on_value_changed(
    peripheral: PeripheralPtr,
    service: RawUuid,
    characteristic: RawUuid,
    data: *const u8,
    data_length: usize,
    userdata: *mut c_void,
) {
    guarded("value_changed", || {
        // SAFETY: userdata was registered together with this trampoline
        let Some(hub) = (unsafe { hub_from(userdata) }) else { return };
        let Some(peripheral) = hub.handle_for_ptr(peripheral) else { return };
        let (Ok(service), Ok(characteristic)) = (service.to_uuid(), characteristic.to_uuid()) else {
            tracing::warn!("Dropping notification with malformed UUID from {}", peripheral);
            return;
        };
        let payload = if data.is_null() || data_length == 0 {
            Vec::new()
        } else {
            // SAFETY: the library passes `data_length` readable bytes for the
            // duration of the callback
            unsafe { std::slice::from_raw_parts(data, data_length) }.to_vec()
        };
        hub.emit(NativeEvent::ValueChanged {
            peripheral,
            service,
            characteristic,
            data: payload,
        });
    });
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct SimpleBleBackend {
    hub: &'static CallbackHub,
    _library: Arc<LoadedLibrary>,
}

impl SimpleBleBackend {
    /// Resolve the C API from an already-loaded library.
    ///
    /// The callback hub is leaked: native threads may still hold its address
    /// after the backend is dropped, and the library itself is never unloaded.
    pub fn new(library: Arc<LoadedLibrary>) -> Result<Self> {
        // SAFETY: `library` is the simplecble artifact and is kept alive by
        // the resolver for the rest of the process.
        let api = unsafe { Api::load(&library.library)? };
        let hub = Box::leak(Box::new(CallbackHub {
            api,
            handles: Mutex::new(HandleTable::default()),
            sink: RwLock::new(None),
        }));
        Ok(Self {
            hub,
            _library: library,
        })
    }

    fn api(&self) -> &Api {
        &self.hub.api
    }

    fn collect_peripherals(
        &self,
        adapter: Handle,
        count: unsafe extern "C" fn(AdapterPtr) -> usize,
        get: unsafe extern "C" fn(AdapterPtr, usize) -> PeripheralPtr,
    ) -> Result<Vec<Handle>> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        // SAFETY: `ptr` is a retained adapter handle
        let total = unsafe { count(ptr) };
        let mut handles = Vec::with_capacity(total);
        for index in 0..total {
            // SAFETY: index is within the count the library just reported
            let peripheral = unsafe { get(ptr, index) };
            if let Some(handle) = self.hub.register_peripheral(peripheral) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    fn query_bool(
        &self,
        ptr: *mut c_void,
        call: unsafe extern "C" fn(*mut c_void, *mut bool) -> ffi::ErrT,
        name: &str,
    ) -> Result<bool> {
        let mut value = false;
        // SAFETY: `ptr` is a retained handle and `value` is a valid out pointer
        check(unsafe { call(ptr, &mut value) }, name)?;
        Ok(value)
    }

    fn manufacturer_data(&self, ptr: PeripheralPtr) -> ManufacturerData {
        let mut data = ManufacturerData::new();
        // SAFETY: `ptr` is a retained peripheral handle
        let count = unsafe { (self.api().peripheral_manufacturer_data_count)(ptr) };
        for index in 0..count {
            let mut raw = RawManufacturerData::zeroed();
            // SAFETY: `raw` is a valid out struct of the expected layout
            let status = unsafe { (self.api().peripheral_manufacturer_data_get)(ptr, index, &mut raw) };
            if status == ffi::SIMPLEBLE_SUCCESS {
                data.insert(raw.manufacturer_id, raw.payload());
            }
        }
        data
    }
}

impl NativeBackend for SimpleBleBackend {
    fn bind(&self, sink: Arc<dyn EventSink>) {
        *self.hub.sink.write() = Some(sink);
    }

    fn bluetooth_enabled(&self) -> bool {
        // SAFETY: no arguments
        unsafe { (self.api().adapter_is_bluetooth_enabled)() }
    }

    fn adapters(&self) -> Result<Vec<Handle>> {
        // SAFETY: no arguments
        let count = unsafe { (self.api().adapter_get_count)() };
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            // SAFETY: index is within the reported count
            let ptr = unsafe { (self.api().adapter_get_handle)(index) };
            if let Some(handle) = self.hub.register_adapter(ptr) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    fn adapter_identifier(&self, adapter: Handle) -> Result<String> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        // SAFETY: retained adapter handle
        unsafe { self.api().take_string((self.api().adapter_identifier)(ptr)) }
            .ok_or_else(|| Error::Native("simpleble_adapter_identifier returned null".to_string()))
    }

    fn adapter_address(&self, adapter: Handle) -> Result<String> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        // SAFETY: retained adapter handle
        unsafe { self.api().take_string((self.api().adapter_address)(ptr)) }
            .ok_or_else(|| Error::Native("simpleble_adapter_address returned null".to_string()))
    }

    fn adapter_is_powered(&self, adapter: Handle) -> Result<bool> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        self.query_bool(ptr, self.api().adapter_is_powered, "simpleble_adapter_is_powered")
    }

    fn scan_start(&self, adapter: Handle) -> Result<()> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        // SAFETY: retained adapter handle
        check(unsafe { (self.api().adapter_scan_start)(ptr) }, "simpleble_adapter_scan_start")
    }

    fn scan_stop(&self, adapter: Handle) -> Result<()> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        // SAFETY: retained adapter handle
        check(unsafe { (self.api().adapter_scan_stop)(ptr) }, "simpleble_adapter_scan_stop")
    }

    fn scan_is_active(&self, adapter: Handle) -> Result<bool> {
        let ptr = self.hub.adapter_ptr(adapter)?;
        self.query_bool(ptr, self.api().adapter_scan_is_active, "simpleble_adapter_scan_is_active")
    }

    fn scan_results(&self, adapter: Handle) -> Result<Vec<Handle>> {
        self.collect_peripherals(
            adapter,
            self.api().adapter_scan_get_results_count,
            self.api().adapter_scan_get_results_handle,
        )
    }

    fn paired_peripherals(&self, adapter: Handle) -> Result<Vec<Handle>> {
        self.collect_peripherals(
            adapter,
            self.api().adapter_get_paired_peripherals_count,
            self.api().adapter_get_paired_peripherals_handle,
        )
    }

    fn peripheral_info(&self, peripheral: Handle) -> Result<PeripheralSnapshot> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        let api = self.api();
        // SAFETY: retained peripheral handle; returned strings are freed by take_string
        let (identifier, address, address_type, rssi, tx_power) = unsafe {
            (
                api.take_string((api.peripheral_identifier)(ptr)).unwrap_or_default(),
                api.take_string((api.peripheral_address)(ptr)).unwrap_or_default(),
                (api.peripheral_address_type)(ptr),
                (api.peripheral_rssi)(ptr),
                (api.peripheral_tx_power)(ptr),
            )
        };
        let connectable = self
            .query_bool(ptr, api.peripheral_is_connectable, "simpleble_peripheral_is_connectable")
            .unwrap_or(false);

        Ok(PeripheralSnapshot {
            identifier,
            address: BluetoothAddress::new(address),
            address_type: AddressType::from_native(address_type),
            rssi,
            tx_power: (tx_power != ffi::TX_POWER_UNAVAILABLE).then_some(tx_power),
            connectable,
            manufacturer_data: self.manufacturer_data(ptr),
        })
    }

    fn connect(&self, peripheral: Handle) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        check(unsafe { (self.api().peripheral_connect)(ptr) }, "simpleble_peripheral_connect")
    }

    fn disconnect(&self, peripheral: Handle) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        check(unsafe { (self.api().peripheral_disconnect)(ptr) }, "simpleble_peripheral_disconnect")
    }

    fn is_connected(&self, peripheral: Handle) -> Result<bool> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        self.query_bool(ptr, self.api().peripheral_is_connected, "simpleble_peripheral_is_connected")
    }

    fn is_paired(&self, peripheral: Handle) -> Result<bool> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        self.query_bool(ptr, self.api().peripheral_is_paired, "simpleble_peripheral_is_paired")
    }

    fn unpair(&self, peripheral: Handle) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        check(unsafe { (self.api().peripheral_unpair)(ptr) }, "simpleble_peripheral_unpair")
    }

    fn mtu(&self, peripheral: Handle) -> Result<u16> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        Ok(unsafe { (self.api().peripheral_mtu)(ptr) })
    }

    fn services(&self, peripheral: Handle) -> Result<Vec<Service>> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        let count = unsafe { (self.api().peripheral_services_count)(ptr) };
        let mut services = Vec::with_capacity(count);
        for index in 0..count {
            let mut raw = RawService::zeroed();
            // SAFETY: `raw` is a valid out struct of the expected layout
            check(
                unsafe { (self.api().peripheral_services_get)(ptr, index, &mut raw) },
                "simpleble_peripheral_services_get",
            )?;
            services.push(raw.to_service()?);
        }
        Ok(services)
    }

    fn read(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<Vec<u8>> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        let mut data: *mut u8 = ptr::null_mut();
        let mut len = 0usize;
        // SAFETY: out pointers are valid; the buffer is released by take_bytes
        unsafe {
            check(
                (self.api().peripheral_read)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    &mut data,
                    &mut len,
                ),
                "simpleble_peripheral_read",
            )?;
            Ok(self.api().take_bytes(data, len))
        }
    }

    fn write_request(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: `data` is valid for `data.len()` bytes for the duration of the call
        check(
            unsafe {
                (self.api().peripheral_write_request)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    data.as_ptr(),
                    data.len(),
                )
            },
            "simpleble_peripheral_write_request",
        )
    }

    fn write_command(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: `data` is valid for `data.len()` bytes for the duration of the call
        check(
            unsafe {
                (self.api().peripheral_write_command)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    data.as_ptr(),
                    data.len(),
                )
            },
            "simpleble_peripheral_write_command",
        )
    }

    fn notify(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: the hub outlives the subscription
        check(
            unsafe {
                (self.api().peripheral_notify)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    on_value_changed,
                    self.hub.userdata(),
                )
            },
            "simpleble_peripheral_notify",
        )
    }

    fn indicate(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: the hub outlives the subscription
        check(
            unsafe {
                (self.api().peripheral_indicate)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    on_value_changed,
                    self.hub.userdata(),
                )
            },
            "simpleble_peripheral_indicate",
        )
    }

    fn unsubscribe(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: retained peripheral handle
        check(
            unsafe {
                (self.api().peripheral_unsubscribe)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                )
            },
            "simpleble_peripheral_unsubscribe",
        )
    }

    fn read_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
    ) -> Result<Vec<u8>> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        let mut data: *mut u8 = ptr::null_mut();
        let mut len = 0usize;
        // SAFETY: out pointers are valid; the buffer is released by take_bytes
        unsafe {
            check(
                (self.api().peripheral_read_descriptor)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    RawUuid::from_uuid(descriptor),
                    &mut data,
                    &mut len,
                ),
                "simpleble_peripheral_read_descriptor",
            )?;
            Ok(self.api().take_bytes(data, len))
        }
    }

    fn write_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let ptr = self.hub.peripheral_ptr(peripheral)?;
        // SAFETY: `data` is valid for `data.len()` bytes for the duration of the call
        check(
            unsafe {
                (self.api().peripheral_write_descriptor)(
                    ptr,
                    RawUuid::from_uuid(service),
                    RawUuid::from_uuid(characteristic),
                    RawUuid::from_uuid(descriptor),
                    data.as_ptr(),
                    data.len(),
                )
            },
            "simpleble_peripheral_write_descriptor",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_key_prefers_address() {
        let a = peripheral_key(Some("aa:bb:cc:dd:ee:01".into()), Some("x".into()), 1);
        let b = peripheral_key(Some("AA-BB-CC-DD-EE-01".into()), Some("y".into()), 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_addresses_do_not_merge_devices() {
        let a = peripheral_key(Some(String::new()), Some("sensor-a".into()), 1);
        let b = peripheral_key(Some(String::new()), Some("sensor-b".into()), 2);
        assert_ne!(a, b);
        assert_eq!(a, PeripheralKey::Identifier("sensor-a".to_string()));

        let c = peripheral_key(None, None, 0x10);
        let d = peripheral_key(Some(":".into()), Some(" ".into()), 0x20);
        assert_eq!(c, PeripheralKey::Pointer(0x10));
        assert_ne!(c, d);
    }
}
