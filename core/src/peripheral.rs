//! Peripheral object, connection state machine and notification routing
//!
//! ```text
//! Disconnected --connect--> Connecting --native success + discovery--> Connected
//!      ^                        |                                          |
//!      |                  disconnect / failure / link loss            disconnect
//!      |                        v                                          v
//!      +-------------------- Disconnected <------------------------ Disconnecting
//! ```
//!
//! Transitions are checked and applied under one per-peripheral mutex. Each
//! connect attempt is numbered so late native results from an abandoned
//! attempt are recognised and discarded. Every attempt ends in exactly one
//! `on_disconnected` (or reaches `on_connected` first and then ends in one).
//!
//! The service tree is discovered before `on_connected` is raised and is
//! discarded, together with all subscriptions, when the link goes down.

use crate::dispatch::{self, EventLane};
use crate::model::{
    AddressType, BluetoothAddress, BluetoothUuid, CharacteristicCapabilities, ManufacturerData,
    PeripheralSnapshot, Service,
};
use crate::native::Handle;
use crate::session::Shared;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Receives connection events for one peripheral. Defaults are no-ops.
pub trait PeripheralListener: Send + Sync {
    fn on_connected(&self, peripheral: &Peripheral) {
        let _ = peripheral;
    }
    fn on_disconnected(&self, peripheral: &Peripheral) {
        let _ = peripheral;
    }
}

/// Receives value pushes for one subscribed characteristic
pub trait NotifyListener: Send + Sync {
    fn on_notify(&self, data: &[u8]);
}

impl<F> NotifyListener for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_notify(&self, data: &[u8]) {
        self(data)
    }
}

/// Connection state of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

type SubscriptionKey = (BluetoothUuid, BluetoothUuid);

/// Latest advertised metadata, refreshed on every scan observation
#[derive(Debug, Clone)]
pub(crate) struct Advertisement {
    pub(crate) rssi: i16,
    pub(crate) tx_power: Option<i16>,
    pub(crate) connectable: bool,
    pub(crate) manufacturer_data: ManufacturerData,
}

struct Link {
    state: ConnectionState,
    attempt: u64,
    discovering: bool,
    services: Vec<Service>,
    subscriptions: HashMap<SubscriptionKey, Weak<dyn NotifyListener>>,
}

impl Link {
    /// Enter `Disconnected`, dropping everything tied to the old link
    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.discovering = false;
        self.services.clear();
        self.subscriptions.clear();
    }

    fn capabilities(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<CharacteristicCapabilities> {
        self.services
            .iter()
            .find(|s| &s.uuid == service)
            .and_then(|s| s.characteristic(characteristic))
            .map(|c| c.capabilities)
            .ok_or(Error::UnknownCharacteristic {
                service: *service,
                characteristic: *characteristic,
            })
    }
}

pub(crate) enum PeripheralEvent {
    Connected,
    Disconnected,
    Notify {
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
        data: Vec<u8>,
    },
}

pub(crate) struct PeripheralInner {
    pub(crate) handle: Handle,
    identifier: String,
    pub(crate) address: BluetoothAddress,
    address_type: AddressType,
    advert: Mutex<Advertisement>,
    link: Mutex<Link>,
    link_changed: Condvar,
    /// Held across native subscribe/unsubscribe calls so a subscription
    /// claim stays pending until the native result is known
    subscribe_gate: ReentrantMutex<()>,
    lane: EventLane<PeripheralEvent>,
    listener: Mutex<Option<Weak<dyn PeripheralListener>>>,
}

impl PeripheralInner {
    pub(crate) fn new(handle: Handle, snapshot: PeripheralSnapshot) -> Self {
        Self {
            handle,
            identifier: snapshot.identifier,
            address: snapshot.address,
            address_type: snapshot.address_type,
            advert: Mutex::new(Advertisement {
                rssi: snapshot.rssi,
                tx_power: snapshot.tx_power,
                connectable: snapshot.connectable,
                manufacturer_data: snapshot.manufacturer_data,
            }),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                attempt: 0,
                discovering: false,
                services: Vec::new(),
                subscriptions: HashMap::new(),
            }),
            link_changed: Condvar::new(),
            subscribe_gate: ReentrantMutex::new(()),
            lane: EventLane::new(),
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn refresh(&self, snapshot: PeripheralSnapshot) {
        let mut advert = self.advert.lock();
        advert.rssi = snapshot.rssi;
        advert.tx_power = snapshot.tx_power;
        advert.connectable = snapshot.connectable;
        advert.manufacturer_data = snapshot.manufacturer_data;
    }

    #[cfg(test)]
    pub(crate) fn advertisement(&self) -> Advertisement {
        self.advert.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn lock_advertisement(&self) -> parking_lot::MutexGuard<'_, Advertisement> {
        self.advert.lock()
    }

    fn listener(&self) -> Option<Arc<dyn PeripheralListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        tracing::debug!("Peripheral {}: {} -> {}", self.handle, link.state, state);
        if state == ConnectionState::Disconnected {
            link.reset();
        } else {
            link.state = state;
        }
        self.link_changed.notify_all();
    }

    /// Move to `Disconnected` and queue the single `on_disconnected`
    fn drop_link(&self, link: &mut Link) {
        self.set_state(link, ConnectionState::Disconnected);
        self.lane.push(PeripheralEvent::Disconnected);
    }
}

/// A remote BLE device.
///
/// Cheap to clone; clones (and every value the session hands out for the
/// same native handle) share one underlying object.
#[derive(Clone)]
pub struct Peripheral {
    shared: Arc<Shared>,
    inner: Arc<PeripheralInner>,
}

impl Peripheral {
    pub(crate) fn from_parts(shared: Arc<Shared>, inner: Arc<PeripheralInner>) -> Self {
        Self { shared, inner }
    }

    pub(crate) fn lookup(shared: &Arc<Shared>, handle: Handle) -> Option<Self> {
        match shared.registry.peripheral(handle) {
            Some(inner) => Some(Self::from_parts(shared.clone(), inner)),
            None => {
                tracing::debug!("Event for unknown peripheral {}", handle);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity and advertised metadata
    // ------------------------------------------------------------------

    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn address(&self) -> &BluetoothAddress {
        &self.inner.address
    }

    pub fn address_type(&self) -> AddressType {
        self.inner.address_type
    }

    /// RSSI of the latest scan observation, in dBm
    pub fn rssi(&self) -> i16 {
        self.inner.advert.lock().rssi
    }

    /// Advertised TX power in dBm, if the peripheral includes it
    pub fn tx_power(&self) -> Option<i16> {
        self.inner.advert.lock().tx_power
    }

    pub fn is_connectable(&self) -> bool {
        self.inner.advert.lock().connectable
    }

    pub fn manufacturer_data(&self) -> ManufacturerData {
        self.inner.advert.lock().manufacturer_data.clone()
    }

    /// Whether both values refer to the same native peripheral
    pub fn ptr_eq(&self, other: &Peripheral) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Register the connection listener. Only a weak reference is kept.
    pub fn set_event_listener(&self, listener: &Arc<dyn PeripheralListener>) {
        *self.inner.listener.lock() = Some(Arc::downgrade(listener));
    }

    pub fn clear_event_listener(&self) {
        *self.inner.listener.lock() = None;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Block until the peripheral reaches `state` or `timeout` elapses.
    /// Returns whether the state was reached.
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut link = self.inner.link.lock();
        while link.state != state {
            if self
                .inner
                .link_changed
                .wait_until(&mut link, deadline)
                .timed_out()
            {
                return link.state == state;
            }
        }
        true
    }

    /// Start connecting. Returns as soon as the attempt is under way;
    /// the outcome arrives as `on_connected` or `on_disconnected`.
    pub fn connect(&self) -> Result<()> {
        let attempt = {
            let mut link = self.inner.link.lock();
            if link.state != ConnectionState::Disconnected {
                return Err(Error::InvalidStateTransition {
                    operation: "connect",
                    state: link.state,
                });
            }
            link.attempt += 1;
            self.inner.set_state(&mut link, ConnectionState::Connecting);
            link.attempt
        };
        tracing::info!("Connecting to peripheral {} ({})", self.inner.handle, self.inner.address);

        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("bluebridge-connect-{}", self.inner.handle.0))
            .spawn(move || worker.run_connect(attempt));

        if let Err(e) = spawned {
            let mut link = self.inner.link.lock();
            if link.attempt == attempt && link.state == ConnectionState::Connecting {
                self.inner.set_state(&mut link, ConnectionState::Disconnected);
            }
            return Err(Error::Native(format!("failed to spawn connect worker: {}", e)));
        }
        Ok(())
    }

    /// Start disconnecting. Valid while connecting or connected.
    pub fn disconnect(&self) -> Result<()> {
        let mut link = self.inner.link.lock();
        match link.state {
            ConnectionState::Connecting => {
                // Abandon the attempt; a late native success is discarded
                self.inner.drop_link(&mut link);
                drop(link);
                tracing::info!("Cancelled connect to peripheral {}", self.inner.handle);
                self.drain();
                self.spawn_native_disconnect(None);
                Ok(())
            }
            ConnectionState::Connected => {
                self.inner
                    .set_state(&mut link, ConnectionState::Disconnecting);
                let attempt = link.attempt;
                drop(link);
                self.spawn_native_disconnect(Some(attempt));
                Ok(())
            }
            state => Err(Error::InvalidStateTransition {
                operation: "disconnect",
                state,
            }),
        }
    }

    fn spawn_native_disconnect(&self, finish_attempt: Option<u64>) {
        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("bluebridge-disconnect-{}", self.inner.handle.0))
            .spawn(move || {
                if let Err(e) = worker.shared.backend.disconnect(worker.inner.handle) {
                    tracing::warn!("Native disconnect of {} failed: {}", worker.inner.handle, e);
                }
                if let Some(attempt) = finish_attempt {
                    worker.finish_disconnect(attempt);
                }
            });

        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn disconnect worker: {}", e);
            if let Some(attempt) = finish_attempt {
                self.finish_disconnect(attempt);
            }
        }
    }

    fn finish_disconnect(&self, attempt: u64) {
        {
            let mut link = self.inner.link.lock();
            if link.attempt != attempt || link.state != ConnectionState::Disconnecting {
                return;
            }
            self.inner.drop_link(&mut link);
        }
        tracing::info!("Disconnected from peripheral {}", self.inner.handle);
        self.drain();
    }

    fn run_connect(&self, attempt: u64) {
        match self.shared.backend.connect(self.inner.handle) {
            Ok(()) => {
                if self.begin_discovery(attempt) {
                    self.complete_connect(attempt);
                } else {
                    self.discard_late_connect(attempt);
                }
            }
            Err(e) => {
                tracing::warn!("Connect to peripheral {} failed: {}", self.inner.handle, e);
                {
                    let mut link = self.inner.link.lock();
                    if link.attempt != attempt || link.state != ConnectionState::Connecting {
                        return;
                    }
                    self.inner.drop_link(&mut link);
                }
                self.drain();
            }
        }
    }

    /// Claim service discovery for `attempt`; only the first caller wins
    fn begin_discovery(&self, attempt: u64) -> bool {
        let mut link = self.inner.link.lock();
        if link.attempt == attempt && link.state == ConnectionState::Connecting && !link.discovering
        {
            link.discovering = true;
            true
        } else {
            false
        }
    }

    /// Native connect succeeded after the attempt was abandoned
    fn discard_late_connect(&self, attempt: u64) {
        let abandoned = {
            let link = self.inner.link.lock();
            link.attempt == attempt && link.state == ConnectionState::Disconnected
        };
        if abandoned {
            tracing::debug!("Tearing down late connection to {}", self.inner.handle);
            if let Err(e) = self.shared.backend.disconnect(self.inner.handle) {
                tracing::warn!("Native disconnect of {} failed: {}", self.inner.handle, e);
            }
        }
    }

    fn complete_connect(&self, attempt: u64) {
        let discovered = self.shared.backend.services(self.inner.handle);
        let failed = {
            let mut link = self.inner.link.lock();
            if link.attempt != attempt || link.state != ConnectionState::Connecting {
                drop(link);
                self.discard_late_connect(attempt);
                return;
            }
            match discovered {
                Ok(services) => {
                    tracing::info!(
                        "Connected to peripheral {} with {} services",
                        self.inner.handle,
                        services.len()
                    );
                    link.services = services;
                    link.discovering = false;
                    self.inner.set_state(&mut link, ConnectionState::Connected);
                    self.inner.lane.push(PeripheralEvent::Connected);
                    false
                }
                Err(e) => {
                    tracing::warn!("Service discovery on {} failed: {}", self.inner.handle, e);
                    self.inner.drop_link(&mut link);
                    true
                }
            }
        };
        self.drain();
        if failed {
            if let Err(e) = self.shared.backend.disconnect(self.inner.handle) {
                tracing::warn!("Native disconnect of {} failed: {}", self.inner.handle, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // GATT
    // ------------------------------------------------------------------

    fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// The discovered service tree; only available while connected
    pub fn services(&self) -> Result<Vec<Service>> {
        let link = self.inner.link.lock();
        if link.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(link.services.clone())
    }

    pub fn mtu(&self) -> Result<u16> {
        self.require_connected()?;
        self.shared.backend.mtu(self.inner.handle)
    }

    pub fn is_paired(&self) -> Result<bool> {
        self.shared.backend.is_paired(self.inner.handle)
    }

    pub fn unpair(&self) -> Result<()> {
        self.shared.backend.unpair(self.inner.handle)
    }

    fn characteristic_capabilities(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
    ) -> Result<CharacteristicCapabilities> {
        let link = self.inner.link.lock();
        if link.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        link.capabilities(service, characteristic)
    }

    pub fn read(&self, service: &BluetoothUuid, characteristic: &BluetoothUuid) -> Result<Vec<u8>> {
        self.characteristic_capabilities(service, characteristic)?;
        self.shared
            .backend
            .read(self.inner.handle, service, characteristic)
    }

    /// Write with response
    pub fn write_request(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        self.characteristic_capabilities(service, characteristic)?;
        self.shared
            .backend
            .write_request(self.inner.handle, service, characteristic, data)
    }

    /// Write without response
    pub fn write_command(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        self.characteristic_capabilities(service, characteristic)?;
        self.shared
            .backend
            .write_command(self.inner.handle, service, characteristic, data)
    }

    pub fn read_descriptor(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
    ) -> Result<Vec<u8>> {
        self.characteristic_capabilities(service, characteristic)?;
        self.shared
            .backend
            .read_descriptor(self.inner.handle, service, characteristic, descriptor)
    }

    pub fn write_descriptor(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        descriptor: &BluetoothUuid,
        data: &[u8],
    ) -> Result<()> {
        self.characteristic_capabilities(service, characteristic)?;
        self.shared.backend.write_descriptor(
            self.inner.handle,
            service,
            characteristic,
            descriptor,
            data,
        )
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to value pushes from a characteristic that can notify or
    /// indicate. Calling again for the same characteristic replaces the
    /// listener. Only a weak reference to the listener is kept.
    pub fn notify(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<()> {
        self.subscribe(service, characteristic, listener, false)
    }

    /// Subscribe to indications; the characteristic must support them.
    pub fn indicate(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<()> {
        self.subscribe(service, characteristic, listener, true)
    }

    fn subscribe(
        &self,
        service: &BluetoothUuid,
        characteristic: &BluetoothUuid,
        listener: &Arc<dyn NotifyListener>,
        indicate_only: bool,
    ) -> Result<()> {
        let key = (*service, *characteristic);
        let _gate = self.inner.subscribe_gate.lock();
        let (attempt, use_indicate) = {
            let mut link = self.inner.link.lock();
            if link.state != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            let caps = link.capabilities(service, characteristic)?;
            let allowed = if indicate_only {
                caps.indicate
            } else {
                caps.can_subscribe()
            };
            if !allowed {
                return Err(Error::CharacteristicNotNotifiable {
                    service: *service,
                    characteristic: *characteristic,
                });
            }
            let replaced = link
                .subscriptions
                .insert(key, Arc::downgrade(listener))
                .is_some();
            if replaced {
                tracing::debug!("Replaced listener for {}/{}", service, characteristic);
                return Ok(());
            }
            (link.attempt, indicate_only || !caps.notify)
        };

        let subscribed = if use_indicate {
            self.shared
                .backend
                .indicate(self.inner.handle, service, characteristic)
        } else {
            self.shared
                .backend
                .notify(self.inner.handle, service, characteristic)
        };

        if let Err(e) = subscribed {
            let mut link = self.inner.link.lock();
            if link.attempt == attempt {
                link.subscriptions.remove(&key);
            }
            return Err(e);
        }
        tracing::debug!("Subscribed to {}/{} on {}", service, characteristic, self.inner.handle);
        Ok(())
    }

    /// Stop value pushes for a characteristic. A no-op if not subscribed.
    pub fn unsubscribe(&self, service: &BluetoothUuid, characteristic: &BluetoothUuid) -> Result<()> {
        let _gate = self.inner.subscribe_gate.lock();
        let removed = {
            let mut link = self.inner.link.lock();
            let removed = link
                .subscriptions
                .remove(&(*service, *characteristic))
                .is_some();
            removed && link.state == ConnectionState::Connected
        };
        if removed {
            self.shared
                .backend
                .unsubscribe(self.inner.handle, service, characteristic)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Native callbacks
    // ------------------------------------------------------------------

    pub(crate) fn handle_native_connected(&self) {
        let attempt = self.inner.link.lock().attempt;
        if !self.begin_discovery(attempt) {
            tracing::debug!("Ignoring native connected for {}", self.inner.handle);
            return;
        }
        // Discovery calls back into the native stack; keep it off the callback thread
        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("bluebridge-discover-{}", self.inner.handle.0))
            .spawn(move || worker.complete_connect(attempt));
        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn discovery worker: {}", e);
            self.complete_connect(attempt);
        }
    }

    pub(crate) fn handle_native_disconnected(&self) {
        {
            let mut link = self.inner.link.lock();
            match link.state {
                ConnectionState::Disconnected => {
                    tracing::debug!("Duplicate disconnect for {}", self.inner.handle);
                    return;
                }
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting => self.inner.drop_link(&mut link),
            }
        }
        tracing::info!("Peripheral {} disconnected", self.inner.handle);
        self.drain();
    }

    pub(crate) fn handle_native_value(
        &self,
        service: BluetoothUuid,
        characteristic: BluetoothUuid,
        data: Vec<u8>,
    ) {
        {
            let link = self.inner.link.lock();
            if link.state != ConnectionState::Connected
                || !link.subscriptions.contains_key(&(service, characteristic))
            {
                tracing::trace!(
                    "Dropping unsolicited value for {}/{} on {}",
                    service,
                    characteristic,
                    self.inner.handle
                );
                return;
            }
            self.inner.lane.push(PeripheralEvent::Notify {
                service,
                characteristic,
                data,
            });
        }
        self.drain();
    }

    fn drain(&self) {
        self.inner.lane.drain(|event| {
            let handle = self.inner.handle;
            match event {
                PeripheralEvent::Connected => {
                    if let Some(listener) = self.inner.listener() {
                        dispatch::invoke(handle, "on_connected", || listener.on_connected(self));
                    }
                }
                PeripheralEvent::Disconnected => {
                    if let Some(listener) = self.inner.listener() {
                        dispatch::invoke(handle, "on_disconnected", || {
                            listener.on_disconnected(self)
                        });
                    }
                }
                PeripheralEvent::Notify {
                    service,
                    characteristic,
                    data,
                } => {
                    let listener = self
                        .inner
                        .link
                        .lock()
                        .subscriptions
                        .get(&(service, characteristic))
                        .and_then(Weak::upgrade);
                    if let Some(listener) = listener {
                        dispatch::invoke(handle, "on_notify", || listener.on_notify(&data));
                    }
                }
            }
        });
    }
}

impl PartialEq for Peripheral {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Peripheral {}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("handle", &self.inner.handle)
            .field("identifier", &self.inner.identifier)
            .field("address", &self.inner.address)
            .finish()
    }
}
