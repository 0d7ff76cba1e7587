//! Adapter object and scan state machine
//!
//! An adapter runs at most one scan session at a time:
//!
//! ```text
//! Idle --scan_for/scan_start--> Scanning --timeout/scan_stop/native stop--> Idle
//! ```
//!
//! Every session produces exactly one `on_scan_start`, then any number of
//! `on_scan_found` / `on_scan_updated`, then exactly one `on_scan_stop`.
//! The start event is announced when the scan begins even if the native
//! start callback never arrives; a found event that beats the native start
//! callback causes the start event to be emitted first.

use crate::dispatch::{self, EventLane};
use crate::model::AdapterCapabilities;
use crate::native::Handle;
use crate::peripheral::{Peripheral, PeripheralInner};
use crate::registry::Observation;
use crate::session::Shared;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Receives scan events for one adapter. All methods default to no-ops.
pub trait AdapterListener: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_scan_stop(&self) {}
    fn on_scan_found(&self, peripheral: &Peripheral) {
        let _ = peripheral;
    }
    fn on_scan_updated(&self, peripheral: &Peripheral) {
        let _ = peripheral;
    }
}

/// Externally visible scan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Scanning,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Scanning => write!(f, "Scanning"),
        }
    }
}

enum ScanPhase {
    Idle,
    Scanning { session: u64, announced: bool },
}

struct ScanMachine {
    phase: ScanPhase,
    sessions: u64,
    /// Native stop callbacks still owed for scans the host stopped
    pending_native_stops: u32,
}

pub(crate) enum AdapterEvent {
    ScanStart,
    ScanStop,
    ScanFound(Arc<PeripheralInner>),
    ScanUpdated(Arc<PeripheralInner>),
}

pub(crate) struct AdapterInner {
    pub(crate) handle: Handle,
    identifier: String,
    address: String,
    capabilities: AdapterCapabilities,
    scan: Mutex<ScanMachine>,
    scan_changed: Condvar,
    lane: EventLane<AdapterEvent>,
    listener: Mutex<Option<Weak<dyn AdapterListener>>>,
}

impl AdapterInner {
    pub(crate) fn new(
        handle: Handle,
        identifier: String,
        address: String,
        capabilities: AdapterCapabilities,
    ) -> Self {
        Self {
            handle,
            identifier,
            address,
            capabilities,
            scan: Mutex::new(ScanMachine {
                phase: ScanPhase::Idle,
                sessions: 0,
                pending_native_stops: 0,
            }),
            scan_changed: Condvar::new(),
            lane: EventLane::new(),
            listener: Mutex::new(None),
        }
    }

    fn begin(&self) -> Result<u64> {
        let mut scan = self.scan.lock();
        if let ScanPhase::Scanning { .. } = scan.phase {
            return Err(Error::ScanAlreadyInProgress);
        }
        scan.sessions += 1;
        let session = scan.sessions;
        scan.phase = ScanPhase::Scanning {
            session,
            announced: false,
        };
        self.scan_changed.notify_all();
        Ok(session)
    }

    fn current_session(&self) -> Option<u64> {
        match self.scan.lock().phase {
            ScanPhase::Scanning { session, .. } => Some(session),
            ScanPhase::Idle => None,
        }
    }

    /// Emit the start event once per session
    fn announce(&self, only: Option<u64>) {
        let mut scan = self.scan.lock();
        if let ScanPhase::Scanning { session, announced } = &mut scan.phase {
            if only.map_or(true, |s| s == *session) && !*announced {
                *announced = true;
                self.lane.push(AdapterEvent::ScanStart);
            }
        }
    }

    /// End the session, emitting start (if never announced) and stop
    fn finish(&self, only: Option<u64>) {
        let mut scan = self.scan.lock();
        if let ScanPhase::Scanning { session, announced } = scan.phase {
            if only.map_or(true, |s| s == session) {
                if !announced {
                    self.lane.push(AdapterEvent::ScanStart);
                }
                self.lane.push(AdapterEvent::ScanStop);
                scan.phase = ScanPhase::Idle;
                self.scan_changed.notify_all();
            }
        }
    }

    /// Claim the native stop for `session`; false if it already ended
    fn expect_native_stop(&self, session: u64) -> bool {
        let mut scan = self.scan.lock();
        match scan.phase {
            ScanPhase::Scanning { session: current, .. } if current == session => {
                scan.pending_native_stops += 1;
                true
            }
            _ => false,
        }
    }

    fn cancel_native_stop(&self) {
        let mut scan = self.scan.lock();
        scan.pending_native_stops = scan.pending_native_stops.saturating_sub(1);
    }

    /// A native stop callback either answers a host stop or ends the
    /// current session on its own.
    fn native_stopped(&self) {
        {
            let mut scan = self.scan.lock();
            if scan.pending_native_stops > 0 {
                scan.pending_native_stops -= 1;
                tracing::debug!("Adapter {} native stop acknowledged", self.handle);
                return;
            }
        }
        self.finish(None);
    }

    /// Drop the session after the native start failed; no events unless
    /// the native start callback already announced it.
    fn abort(&self, session: u64) {
        let mut scan = self.scan.lock();
        if let ScanPhase::Scanning {
            session: current,
            announced,
        } = scan.phase
        {
            if current == session {
                if announced {
                    self.lane.push(AdapterEvent::ScanStop);
                }
                scan.phase = ScanPhase::Idle;
                self.scan_changed.notify_all();
            }
        }
    }

    fn observe(&self, peripheral: Arc<PeripheralInner>, updated: bool) {
        let mut scan = self.scan.lock();
        let ScanPhase::Scanning { announced, .. } = &mut scan.phase else {
            tracing::debug!(
                "Adapter {} idle, dropping observation of {}",
                self.handle,
                peripheral.handle
            );
            return;
        };
        if !*announced {
            *announced = true;
            self.lane.push(AdapterEvent::ScanStart);
        }
        self.lane.push(if updated {
            AdapterEvent::ScanUpdated(peripheral)
        } else {
            AdapterEvent::ScanFound(peripheral)
        });
    }

    fn listener(&self) -> Option<Arc<dyn AdapterListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }
}

/// A local Bluetooth adapter.
///
/// Cheap to clone; clones refer to the same underlying adapter.
#[derive(Clone)]
pub struct Adapter {
    shared: Arc<Shared>,
    inner: Arc<AdapterInner>,
}

impl Adapter {
    pub(crate) fn from_parts(shared: Arc<Shared>, inner: Arc<AdapterInner>) -> Self {
        Self { shared, inner }
    }

    pub(crate) fn lookup(shared: &Arc<Shared>, handle: Handle) -> Option<Self> {
        match shared.registry.adapter(handle) {
            Some(inner) => Some(Self::from_parts(shared.clone(), inner)),
            None => {
                tracing::debug!("Event for unknown adapter {}", handle);
                None
            }
        }
    }

    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Capability flags captured at enumeration
    pub fn capabilities(&self) -> AdapterCapabilities {
        self.inner.capabilities
    }

    /// Register the scan listener. Only a weak reference is kept.
    pub fn set_event_listener(&self, listener: &Arc<dyn AdapterListener>) {
        *self.inner.listener.lock() = Some(Arc::downgrade(listener));
    }

    pub fn clear_event_listener(&self) {
        *self.inner.listener.lock() = None;
    }

    pub fn scan_state(&self) -> ScanState {
        match self.inner.current_session() {
            Some(_) => ScanState::Scanning,
            None => ScanState::Idle,
        }
    }

    /// Scan for `duration`, blocking the caller until the scan has stopped.
    ///
    /// Returns early if the native stack stops the scan on its own.
    pub fn scan_for(&self, duration: Duration) -> Result<()> {
        let session = self.start_session()?;
        tracing::info!(
            "Adapter {} scanning for {} ms",
            self.inner.handle,
            duration.as_millis()
        );

        let deadline = Instant::now() + duration;
        {
            let mut scan = self.inner.scan.lock();
            loop {
                let still_ours = matches!(
                    scan.phase,
                    ScanPhase::Scanning { session: s, .. } if s == session
                );
                if !still_ours {
                    break;
                }
                if self
                    .inner
                    .scan_changed
                    .wait_until(&mut scan, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        self.stop_session(session);
        Ok(())
    }

    /// Start an open-ended scan; end it with [`Adapter::scan_stop`].
    pub fn scan_start(&self) -> Result<()> {
        self.start_session().map(|_| ())
    }

    /// Stop the active scan. A no-op while idle.
    pub fn scan_stop(&self) -> Result<()> {
        if let Some(session) = self.inner.current_session() {
            self.stop_session(session);
        }
        Ok(())
    }

    pub fn scan_is_active(&self) -> bool {
        self.scan_state() == ScanState::Scanning
    }

    /// Peripherals the native stack saw during the last scan
    pub fn scan_get_results(&self) -> Result<Vec<Peripheral>> {
        let handles = self.shared.backend.scan_results(self.inner.handle)?;
        Ok(self.resolve_all(handles))
    }

    pub fn get_paired_peripherals(&self) -> Result<Vec<Peripheral>> {
        let handles = self.shared.backend.paired_peripherals(self.inner.handle)?;
        Ok(self.resolve_all(handles))
    }

    fn resolve_all(&self, handles: Vec<Handle>) -> Vec<Peripheral> {
        handles
            .into_iter()
            .filter_map(|handle| self.shared.observe_peripheral(handle))
            .map(|(inner, _)| Peripheral::from_parts(self.shared.clone(), inner))
            .collect()
    }

    fn start_session(&self) -> Result<u64> {
        let session = self.inner.begin()?;
        if let Err(e) = self.shared.backend.scan_start(self.inner.handle) {
            tracing::warn!("Adapter {} failed to start scan: {}", self.inner.handle, e);
            self.inner.abort(session);
            self.drain();
            return Err(e);
        }
        self.inner.announce(Some(session));
        self.drain();
        Ok(session)
    }

    fn stop_session(&self, session: u64) {
        if self.inner.expect_native_stop(session) {
            if let Err(e) = self.shared.backend.scan_stop(self.inner.handle) {
                tracing::warn!("Adapter {} failed to stop scan: {}", self.inner.handle, e);
                self.inner.cancel_native_stop();
            }
        }
        self.inner.finish(Some(session));
        self.drain();
        tracing::info!("Adapter {} scan stopped", self.inner.handle);
    }

    // ------------------------------------------------------------------
    // Native callbacks
    // ------------------------------------------------------------------

    pub(crate) fn handle_native_scan_start(&self) {
        self.inner.announce(None);
        self.drain();
    }

    pub(crate) fn handle_native_scan_stop(&self) {
        self.inner.native_stopped();
        self.drain();
    }

    /// A native found/updated callback for `peripheral`.
    ///
    /// The first observation of a handle is always reported as found.
    pub(crate) fn handle_native_observation(&self, peripheral: Handle, updated: bool) {
        let Some((inner, observation)) = self.shared.observe_peripheral(peripheral) else {
            return;
        };
        let updated = updated && observation == Observation::Known;
        self.inner.observe(inner, updated);
        self.drain();
    }

    fn drain(&self) {
        self.inner.lane.drain(|event| {
            let Some(listener) = self.inner.listener() else {
                tracing::trace!("No scan listener on adapter {}", self.inner.handle);
                return;
            };
            let handle = self.inner.handle;
            match event {
                AdapterEvent::ScanStart => {
                    dispatch::invoke(handle, "on_scan_start", || listener.on_scan_start())
                }
                AdapterEvent::ScanStop => {
                    dispatch::invoke(handle, "on_scan_stop", || listener.on_scan_stop())
                }
                AdapterEvent::ScanFound(peripheral) => {
                    let peripheral = Peripheral::from_parts(self.shared.clone(), peripheral);
                    dispatch::invoke(handle, "on_scan_found", || {
                        listener.on_scan_found(&peripheral)
                    })
                }
                AdapterEvent::ScanUpdated(peripheral) => {
                    let peripheral = Peripheral::from_parts(self.shared.clone(), peripheral);
                    dispatch::invoke(handle, "on_scan_updated", || {
                        listener.on_scan_updated(&peripheral)
                    })
                }
            }
        });
    }
}

impl PartialEq for Adapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Adapter {}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("handle", &self.inner.handle)
            .field("identifier", &self.inner.identifier)
            .field("address", &self.inner.address)
            .finish()
    }
}
