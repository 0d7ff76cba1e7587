//! Handle -> host object registry
//!
//! Exactly one host object exists per native handle for the whole session.
//! Entries are never evicted, so a handle cannot be reused while a host
//! object for it is still reachable.

use crate::adapter::AdapterInner;
use crate::model::PeripheralSnapshot;
use crate::native::Handle;
use crate::peripheral::PeripheralInner;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a scan observation introduced a new peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Known,
}

#[derive(Default)]
struct Maps {
    adapters: HashMap<Handle, Arc<AdapterInner>>,
    peripherals: HashMap<Handle, Arc<PeripheralInner>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    maps: Mutex<Maps>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_adapter(&self, adapter: Arc<AdapterInner>) {
        self.maps.lock().adapters.insert(adapter.handle, adapter);
    }

    pub(crate) fn adapter(&self, handle: Handle) -> Option<Arc<AdapterInner>> {
        self.maps.lock().adapters.get(&handle).cloned()
    }

    pub(crate) fn peripheral(&self, handle: Handle) -> Option<Arc<PeripheralInner>> {
        self.maps.lock().peripherals.get(&handle).cloned()
    }

    /// Resolve-or-insert for a scan observation.
    ///
    /// A known peripheral keeps its identity; its advertised metadata (RSSI,
    /// TX power, connectable flag and manufacturer data) is refreshed in place.
    pub(crate) fn resolve_peripheral(
        &self,
        handle: Handle,
        snapshot: PeripheralSnapshot,
    ) -> (Arc<PeripheralInner>, Observation) {
        let mut maps = self.maps.lock();
        if let Some(existing) = maps.peripherals.get(&handle).cloned() {
            drop(maps);
            existing.refresh(snapshot);
            return (existing, Observation::Known);
        }
        let inner = Arc::new(PeripheralInner::new(handle, snapshot));
        maps.peripherals.insert(handle, inner.clone());
        tracing::debug!("Registered peripheral {} ({})", handle, inner.address);
        (inner, Observation::New)
    }

    pub(crate) fn peripheral_count(&self) -> usize {
        self.maps.lock().peripherals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressType, BluetoothAddress, ManufacturerData};
    use std::time::Duration;

    fn snapshot(rssi: i16) -> PeripheralSnapshot {
        PeripheralSnapshot {
            identifier: "thermo".to_string(),
            address: BluetoothAddress::new("AA:BB:CC:DD:EE:01"),
            address_type: AddressType::Random,
            rssi,
            tx_power: None,
            connectable: true,
            manufacturer_data: ManufacturerData::new(),
        }
    }

    #[test]
    fn test_resolve_inserts_then_refreshes() {
        let registry = Registry::new();
        let (first, obs) = registry.resolve_peripheral(Handle(3), snapshot(-80));
        assert_eq!(obs, Observation::New);

        let mut updated = snapshot(-42);
        updated.manufacturer_data.insert(0x004c, vec![1, 2, 3]);
        updated.tx_power = Some(4);
        let (second, obs) = registry.resolve_peripheral(Handle(3), updated);
        assert_eq!(obs, Observation::Known);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.advertisement().rssi, -42);
        assert_eq!(first.advertisement().tx_power, Some(4));
        assert_eq!(
            first.advertisement().manufacturer_data.get(&0x004c),
            Some(&vec![1, 2, 3])
        );
        assert_eq!(registry.peripheral_count(), 1);
    }

    #[test]
    fn test_distinct_handles_are_distinct_objects() {
        let registry = Registry::new();
        let (a, _) = registry.resolve_peripheral(Handle(1), snapshot(-50));
        let (b, _) = registry.resolve_peripheral(Handle(2), snapshot(-50));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(registry.peripheral(Handle(1)).is_some());
        assert!(registry.peripheral(Handle(9)).is_none());
    }

    #[test]
    fn test_refresh_does_not_block_registry() {
        let registry = Arc::new(Registry::new());
        let (busy, _) = registry.resolve_peripheral(Handle(1), snapshot(-60));
        registry.resolve_peripheral(Handle(2), snapshot(-60));

        // Another thread is reading the advertisement while a refresh is queued
        let guard = busy.lock_advertisement();
        let refresher = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry.resolve_peripheral(Handle(1), snapshot(-30));
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let _ = tx.send(registry.peripheral(Handle(2)).is_some());
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));

        drop(guard);
        refresher.join().unwrap();
        assert_eq!(busy.advertisement().rssi, -30);
    }
}
