//! Scriptable in-process backend
//!
//! `MockBackend` stands in for the native library in tests and demos.
//! Devices, service trees and connect outcomes are programmed up front; the
//! `emit_*` helpers play native callbacks into the bound sink from whichever
//! thread calls them.

use super::{EventSink, Handle, NativeBackend, NativeEvent};
use crate::model::{
    AddressType, BluetoothAddress, BluetoothUuid, ManufacturerData, PeripheralSnapshot, Service,
};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

type CharacteristicKey = (BluetoothUuid, BluetoothUuid);

/// How a programmed peripheral answers `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectOutcome {
    #[default]
    Succeed,
    Fail,
    /// Block inside `connect` until [`MockBackend::release_connect`]
    Hold,
}

/// Backend call recorded for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ScanStart(Handle),
    ScanStop(Handle),
    Connect(Handle),
    Disconnect(Handle),
    Notify(Handle, BluetoothUuid, BluetoothUuid),
    Indicate(Handle, BluetoothUuid, BluetoothUuid),
    Unsubscribe(Handle, BluetoothUuid, BluetoothUuid),
    WriteRequest(Handle, BluetoothUuid, BluetoothUuid, Vec<u8>),
    WriteCommand(Handle, BluetoothUuid, BluetoothUuid, Vec<u8>),
    WriteDescriptor(Handle, BluetoothUuid, BluetoothUuid, BluetoothUuid, Vec<u8>),
    Unpair(Handle),
}

struct MockAdapter {
    identifier: String,
    address: String,
    powered: bool,
    scanning: bool,
    seen: Vec<Handle>,
}

struct MockPeripheral {
    snapshot: PeripheralSnapshot,
    services: Vec<Service>,
    outcome: ConnectOutcome,
    fail_discovery: bool,
    connected: bool,
    paired: bool,
    mtu: u16,
    values: HashMap<CharacteristicKey, Vec<u8>>,
    descriptors: HashMap<(BluetoothUuid, BluetoothUuid, BluetoothUuid), Vec<u8>>,
    subscriptions: HashSet<CharacteristicKey>,
    /// `Some(result)` once a held connect has been released
    held: Option<Option<bool>>,
    hold_subscribe: bool,
    /// Same protocol as `held`, for notify/indicate
    subscribe_held: Option<Option<bool>>,
}

struct MockState {
    next: u64,
    bluetooth_enabled: bool,
    auto_scan_events: bool,
    auto_connection_events: bool,
    adapters: BTreeMap<Handle, MockAdapter>,
    peripherals: HashMap<Handle, MockPeripheral>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn allocate(&mut self) -> Handle {
        self.next += 1;
        Handle(self.next)
    }

    fn adapter(&mut self, handle: Handle) -> Result<&mut MockAdapter> {
        self.adapters
            .get_mut(&handle)
            .ok_or_else(|| Error::AdapterNotFound(handle.to_string()))
    }

    fn peripheral(&mut self, handle: Handle) -> Result<&mut MockPeripheral> {
        self.peripherals
            .get_mut(&handle)
            .ok_or_else(|| Error::Native(format!("unknown peripheral handle {}", handle)))
    }

    fn connected_peripheral(&mut self, handle: Handle) -> Result<&mut MockPeripheral> {
        let peripheral = self.peripheral(handle)?;
        if !peripheral.connected {
            return Err(Error::Native(format!("peripheral {} is not connected", handle)));
        }
        Ok(peripheral)
    }
}

pub struct MockBackend {
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    state: Mutex<MockState>,
    released: Condvar,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            sink: RwLock::new(None),
            state: Mutex::new(MockState {
                next: 0,
                bluetooth_enabled: true,
                auto_scan_events: true,
                auto_connection_events: true,
                adapters: BTreeMap::new(),
                peripherals: HashMap::new(),
                calls: Vec::new(),
            }),
            released: Condvar::new(),
        }
    }

    // ------------------------------------------------------------------
    // Programming
    // ------------------------------------------------------------------

    pub fn add_adapter(&self, identifier: &str, address: &str) -> Handle {
        let mut state = self.state.lock();
        let handle = state.allocate();
        state.adapters.insert(
            handle,
            MockAdapter {
                identifier: identifier.to_string(),
                address: address.to_string(),
                powered: true,
                scanning: false,
                seen: Vec::new(),
            },
        );
        handle
    }

    pub fn add_peripheral(&self, identifier: &str, address: &str, rssi: i16) -> Handle {
        let mut state = self.state.lock();
        let handle = state.allocate();
        state.peripherals.insert(
            handle,
            MockPeripheral {
                snapshot: PeripheralSnapshot {
                    identifier: identifier.to_string(),
                    address: BluetoothAddress::new(address),
                    address_type: AddressType::Public,
                    rssi,
                    tx_power: None,
                    connectable: true,
                    manufacturer_data: ManufacturerData::new(),
                },
                services: Vec::new(),
                outcome: ConnectOutcome::Succeed,
                fail_discovery: false,
                connected: false,
                paired: false,
                mtu: 23,
                values: HashMap::new(),
                descriptors: HashMap::new(),
                subscriptions: HashSet::new(),
                held: None,
                hold_subscribe: false,
                subscribe_held: None,
            },
        );
        handle
    }

    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        self.state.lock().bluetooth_enabled = enabled;
    }

    /// Whether `scan_start`/`scan_stop` raise their native callbacks
    pub fn set_auto_scan_events(&self, enabled: bool) {
        self.state.lock().auto_scan_events = enabled;
    }

    /// Whether `connect`/`disconnect` raise their native callbacks
    pub fn set_auto_connection_events(&self, enabled: bool) {
        self.state.lock().auto_connection_events = enabled;
    }

    pub fn set_services(&self, peripheral: Handle, services: Vec<Service>) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.services = services;
        }
    }

    pub fn set_connect_outcome(&self, peripheral: Handle, outcome: ConnectOutcome) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.outcome = outcome;
        }
    }

    pub fn set_discovery_failure(&self, peripheral: Handle, fail: bool) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.fail_discovery = fail;
        }
    }

    pub fn set_rssi(&self, peripheral: Handle, rssi: i16) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.snapshot.rssi = rssi;
        }
    }

    pub fn set_tx_power(&self, peripheral: Handle, tx_power: Option<i16>) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.snapshot.tx_power = tx_power;
        }
    }

    pub fn set_manufacturer_data(&self, peripheral: Handle, company: u16, data: &[u8]) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.snapshot.manufacturer_data.insert(company, data.to_vec());
        }
    }

    pub fn set_paired(&self, peripheral: Handle, paired: bool) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.paired = paired;
        }
    }

    pub fn set_value(
        &self,
        peripheral: Handle,
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
        data: &[u8],
    ) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.values.insert((service, characteristic), data.to_vec());
        }
    }

    /// Finish a connect blocked by [`ConnectOutcome::Hold`]
    pub fn release_connect(&self, peripheral: Handle, succeed: bool) {
        let mut state = self.state.lock();
        if let Some(p) = state.peripherals.get_mut(&peripheral) {
            p.held = Some(Some(succeed));
        }
        self.released.notify_all();
    }

    /// True while a held connect is waiting for release
    pub fn is_connect_pending(&self, peripheral: Handle) -> bool {
        matches!(
            self.state.lock().peripherals.get(&peripheral).map(|p| p.held),
            Some(Some(None))
        )
    }

    /// Make notify/indicate block until [`MockBackend::release_subscribe`]
    pub fn set_hold_subscribe(&self, peripheral: Handle, hold: bool) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.hold_subscribe = hold;
        }
    }

    pub fn release_subscribe(&self, peripheral: Handle, succeed: bool) {
        let mut state = self.state.lock();
        if let Some(p) = state.peripherals.get_mut(&peripheral) {
            p.subscribe_held = Some(Some(succeed));
        }
        self.released.notify_all();
    }

    pub fn is_subscribe_pending(&self, peripheral: Handle) -> bool {
        matches!(
            self.state
                .lock()
                .peripherals
                .get(&peripheral)
                .map(|p| p.subscribe_held),
            Some(Some(None))
        )
    }

    fn subscribe(&self, call: MockCall, peripheral: Handle, key: CharacteristicKey) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.connected_peripheral(peripheral)?.hold_subscribe {
            state.peripheral(peripheral)?.subscribe_held = Some(None);
            let succeed = loop {
                if let Some(Some(result)) = state.peripheral(peripheral)?.subscribe_held {
                    state.peripheral(peripheral)?.subscribe_held = None;
                    break result;
                }
                self.released.wait(&mut state);
            };
            if !succeed {
                return Err(Error::Native("simpleble_peripheral_notify failed".to_string()));
            }
        }
        state.connected_peripheral(peripheral)?.subscriptions.insert(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn is_subscribed(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> bool {
        self.state
            .lock()
            .peripherals
            .get(&peripheral)
            .map(|p| p.subscriptions.contains(&(*service, *characteristic)))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Native callbacks
    // ------------------------------------------------------------------

    pub fn emit(&self, event: NativeEvent) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }

    pub fn emit_scan_start(&self, adapter: Handle) {
        self.emit(NativeEvent::ScanStart { adapter });
    }

    pub fn emit_scan_stop(&self, adapter: Handle) {
        self.emit(NativeEvent::ScanStop { adapter });
    }

    pub fn emit_scan_found(&self, adapter: Handle, peripheral: Handle) {
        if let Some(a) = self.state.lock().adapters.get_mut(&adapter) {
            if !a.seen.contains(&peripheral) {
                a.seen.push(peripheral);
            }
        }
        self.emit(NativeEvent::ScanFound { adapter, peripheral });
    }

    pub fn emit_scan_updated(&self, adapter: Handle, peripheral: Handle) {
        self.emit(NativeEvent::ScanUpdated { adapter, peripheral });
    }

    pub fn emit_connected(&self, peripheral: Handle) {
        self.emit(NativeEvent::Connected { peripheral });
    }

    /// Peer-initiated link loss
    pub fn emit_disconnected(&self, peripheral: Handle) {
        if let Some(p) = self.state.lock().peripherals.get_mut(&peripheral) {
            p.connected = false;
            p.subscriptions.clear();
        }
        self.emit(NativeEvent::Disconnected { peripheral });
    }

    pub fn emit_value(
        &self,
        peripheral: Handle,
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
        data: &[u8],
    ) {
        self.emit(NativeEvent::ValueChanged {
            peripheral,
            service,
            characteristic,
            data: data.to_vec(),
        });
    }
}

impl NativeBackend for MockBackend {
    fn bind(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    fn bluetooth_enabled(&self) -> bool {
        self.state.lock().bluetooth_enabled
    }

    fn adapters(&self) -> Result<Vec<Handle>> {
        Ok(self.state.lock().adapters.keys().copied().collect())
    }

    fn adapter_identifier(&self, adapter: Handle) -> Result<String> {
        Ok(self.state.lock().adapter(adapter)?.identifier.clone())
    }

    fn adapter_address(&self, adapter: Handle) -> Result<String> {
        Ok(self.state.lock().adapter(adapter)?.address.clone())
    }

    fn adapter_is_powered(&self, adapter: Handle) -> Result<bool> {
        Ok(self.state.lock().adapter(adapter)?.powered)
    }

    fn scan_start(&self, adapter: Handle) -> Result<()> {
        let emit = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::ScanStart(adapter));
            let auto = state.auto_scan_events;
            let a = state.adapter(adapter)?;
            a.scanning = true;
            a.seen.clear();
            auto
        };
        if emit {
            self.emit_scan_start(adapter);
        }
        Ok(())
    }

    fn scan_stop(&self, adapter: Handle) -> Result<()> {
        let emit = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::ScanStop(adapter));
            let auto = state.auto_scan_events;
            let a = state.adapter(adapter)?;
            let was_scanning = std::mem::replace(&mut a.scanning, false);
            auto && was_scanning
        };
        if emit {
            self.emit_scan_stop(adapter);
        }
        Ok(())
    }

    fn scan_is_active(&self, adapter: Handle) -> Result<bool> {
        Ok(self.state.lock().adapter(adapter)?.scanning)
    }

    fn scan_results(&self, adapter: Handle) -> Result<Vec<Handle>> {
        Ok(self.state.lock().adapter(adapter)?.seen.clone())
    }

    fn paired_peripherals(&self, adapter: Handle) -> Result<Vec<Handle>> {
        let state = self.state.lock();
        if !state.adapters.contains_key(&adapter) {
            return Err(Error::AdapterNotFound(adapter.to_string()));
        }
        let mut paired: Vec<Handle> = state
            .peripherals
            .iter()
            .filter(|(_, p)| p.paired)
            .map(|(h, _)| *h)
            .collect();
        paired.sort();
        Ok(paired)
    }

    fn peripheral_info(&self, peripheral: Handle) -> Result<PeripheralSnapshot> {
        Ok(self.state.lock().peripheral(peripheral)?.snapshot.clone())
    }

    fn connect(&self, peripheral: Handle) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Connect(peripheral));
        let outcome = state.peripheral(peripheral)?.outcome;

        let succeed = match outcome {
            ConnectOutcome::Succeed => true,
            ConnectOutcome::Fail => false,
            ConnectOutcome::Hold => {
                state.peripheral(peripheral)?.held = Some(None);
                loop {
                    let held = state.peripheral(peripheral)?.held;
                    if let Some(Some(result)) = held {
                        state.peripheral(peripheral)?.held = None;
                        break result;
                    }
                    self.released.wait(&mut state);
                }
            }
        };

        if !succeed {
            return Err(Error::Native("simpleble_peripheral_connect failed".to_string()));
        }
        state.peripheral(peripheral)?.connected = true;
        let emit = state.auto_connection_events;
        drop(state);
        if emit {
            self.emit_connected(peripheral);
        }
        Ok(())
    }

    fn disconnect(&self, peripheral: Handle) -> Result<()> {
        let emit = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Disconnect(peripheral));
            let auto = state.auto_connection_events;
            let p = state.peripheral(peripheral)?;
            let was_connected = std::mem::replace(&mut p.connected, false);
            p.subscriptions.clear();
            auto && was_connected
        };
        if emit {
            self.emit(NativeEvent::Disconnected { peripheral });
        }
        Ok(())
    }

    fn is_connected(&self, peripheral: Handle) -> Result<bool> {
        Ok(self.state.lock().peripheral(peripheral)?.connected)
    }

    fn is_paired(&self, peripheral: Handle) -> Result<bool> {
        Ok(self.state.lock().peripheral(peripheral)?.paired)
    }

    fn unpair(&self, peripheral: Handle) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Unpair(peripheral));
        state.peripheral(peripheral)?.paired = false;
        Ok(())
    }

    fn mtu(&self, peripheral: Handle) -> Result<u16> {
        Ok(self.state.lock().connected_peripheral(peripheral)?.mtu)
    }

    fn services(&self, peripheral: Handle) -> Result<Vec<Service>> {
        let mut state = self.state.lock();
        let p = state.connected_peripheral(peripheral)?;
        if p.fail_discovery {
            return Err(Error::Native("simpleble_peripheral_services_get failed".to_string()));
        }
        Ok(p.services.clone())
    }

    fn read(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<Vec<u8>> {
        self.state
            .lock()
            .connected_peripheral(peripheral)?
            .values
            .get(&(*service, *characteristic))
            .cloned()
            .ok_or_else(|| Error::Native("simpleble_peripheral_read failed".to_string()))
    }

    fn write_request(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::WriteRequest(
            peripheral,
            *service,
            *characteristic,
            data.to_vec(),
        ));
        state
            .connected_peripheral(peripheral)?
            .values
            .insert((*service, *characteristic), data.to_vec());
        Ok(())
    }

    fn write_command(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::WriteCommand(
            peripheral,
            *service,
            *characteristic,
            data.to_vec(),
        ));
        state
            .connected_peripheral(peripheral)?
            .values
            .insert((*service, *characteristic), data.to_vec());
        Ok(())
    }

    fn notify(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        self.subscribe(
            MockCall::Notify(peripheral, *service, *characteristic),
            peripheral,
            (*service, *characteristic),
        )
    }

    fn indicate(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        self.subscribe(
            MockCall::Indicate(peripheral, *service, *characteristic),
            peripheral,
            (*service, *characteristic),
        )
    }

    fn unsubscribe(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(MockCall::Unsubscribe(peripheral, *service, *characteristic));
        state
            .peripheral(peripheral)?
            .subscriptions
            .remove(&(*service, *characteristic));
        Ok(())
    }

    fn read_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
    ) -> Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .connected_peripheral(peripheral)?
            .descriptors
            .get(&(*service, *characteristic, *descriptor))
            .cloned()
            .unwrap_or_default())
    }

    fn write_descriptor(
        &self,
        peripheral: Handle,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::WriteDescriptor(
            peripheral,
            *service,
            *characteristic,
            *descriptor,
            data.to_vec(),
        ));
        state
            .connected_peripheral(peripheral)?
            .descriptors
            .insert((*service, *characteristic, *descriptor), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Mutex<Vec<NativeEvent>>);

    impl EventSink for Collect {
        fn deliver(&self, event: NativeEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_scan_start_emits_callbacks() {
        let mock = MockBackend::new();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        mock.bind(sink.clone());
        let adapter = mock.add_adapter("hci0", "00:11:22:33:44:55");

        mock.scan_start(adapter).unwrap();
        mock.scan_stop(adapter).unwrap();
        mock.scan_stop(adapter).unwrap();

        let events = sink.0.lock().clone();
        assert_eq!(
            events,
            vec![
                NativeEvent::ScanStart { adapter },
                NativeEvent::ScanStop { adapter },
            ]
        );
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::ScanStop(_))), 2);
    }

    #[test]
    fn test_failed_connect_stays_disconnected() {
        let mock = MockBackend::new();
        let peripheral = mock.add_peripheral("dev", "AA:BB:CC:DD:EE:FF", -60);
        mock.set_connect_outcome(peripheral, ConnectOutcome::Fail);

        assert!(mock.connect(peripheral).is_err());
        assert!(!mock.is_connected(peripheral).unwrap());
        assert!(mock.services(peripheral).is_err());
    }

    #[test]
    fn test_held_connect_waits_for_release() {
        let mock = Arc::new(MockBackend::new());
        let peripheral = mock.add_peripheral("dev", "AA:BB:CC:DD:EE:FF", -60);
        mock.set_connect_outcome(peripheral, ConnectOutcome::Hold);

        let worker = {
            let mock = mock.clone();
            std::thread::spawn(move || mock.connect(peripheral))
        };
        while !mock.is_connect_pending(peripheral) {
            std::thread::yield_now();
        }
        mock.release_connect(peripheral, true);
        assert!(worker.join().unwrap().is_ok());
        assert!(mock.is_connected(peripheral).unwrap());
    }
}
