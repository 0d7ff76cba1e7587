//! Session: the loaded backend plus the handle registry
//!
//! A session binds the dispatcher to the backend and enumerates adapters
//! exactly once. All adapters and peripherals handed out by a session share
//! its backend and registry.

use crate::adapter::{Adapter, AdapterInner};
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::loader::{self, ResourceRoot};
use crate::model::AdapterCapabilities;
use crate::native::{Handle, NativeBackend, SimpleBleBackend};
use crate::peripheral::PeripheralInner;
use crate::registry::{Observation, Registry};
use crate::{Error, Result};
use std::sync::Arc;

pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn NativeBackend>,
    pub(crate) registry: Registry,
}

impl Shared {
    /// Query the backend for a peripheral's current metadata and resolve it
    /// through the registry. A known peripheral is still returned when the
    /// query fails; an unknown one is dropped.
    pub(crate) fn observe_peripheral(
        &self,
        handle: Handle,
    ) -> Option<(Arc<PeripheralInner>, Observation)> {
        match self.backend.peripheral_info(handle) {
            Ok(snapshot) => Some(self.registry.resolve_peripheral(handle, snapshot)),
            Err(e) => {
                tracing::warn!("Failed to query peripheral {}: {}", handle, e);
                self.registry
                    .peripheral(handle)
                    .map(|inner| (inner, Observation::Known))
            }
        }
    }
}

pub struct Session {
    shared: Arc<Shared>,
    adapters: Vec<Adapter>,
}

impl Session {
    /// Load the bundled native library and open a session on it
    pub fn load(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let root = ResourceRoot::resolve(config.native_dir.as_deref());
        let library = loader::resolve_and_load(config.library_name.trim(), &root)?;
        let backend = SimpleBleBackend::new(library)?;
        Self::with_backend(Arc::new(backend))
    }

    /// Open a session on an already constructed backend
    pub fn with_backend(backend: Arc<dyn NativeBackend>) -> Result<Self> {
        let shared = Arc::new(Shared {
            backend: backend.clone(),
            registry: Registry::new(),
        });
        backend.bind(Arc::new(Dispatcher::new(Arc::downgrade(&shared))));

        let bluetooth_enabled = backend.bluetooth_enabled();
        if !bluetooth_enabled {
            tracing::warn!("Bluetooth is disabled on this host");
        }

        let mut adapters = Vec::new();
        for handle in backend.adapters()? {
            let capabilities = AdapterCapabilities {
                bluetooth_enabled,
                powered: backend.adapter_is_powered(handle).unwrap_or_else(|e| {
                    tracing::warn!("Could not read power state of adapter {}: {}", handle, e);
                    false
                }),
            };
            let inner = Arc::new(AdapterInner::new(
                handle,
                backend.adapter_identifier(handle)?,
                backend.adapter_address(handle)?,
                capabilities,
            ));
            shared.registry.insert_adapter(inner.clone());
            adapters.push(Adapter::from_parts(shared.clone(), inner));
        }
        tracing::info!("Session opened with {} adapter(s)", adapters.len());

        Ok(Self { shared, adapters })
    }

    pub fn bluetooth_enabled(&self) -> bool {
        self.shared.backend.bluetooth_enabled()
    }

    /// Adapters enumerated when the session was opened
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Find an adapter by identifier or address
    pub fn adapter(&self, name: &str) -> Result<Adapter> {
        self.adapters
            .iter()
            .find(|a| a.identifier() == name || a.address().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::AdapterNotFound(name.to_string()))
    }

    /// Number of distinct peripherals observed so far
    pub fn known_peripherals(&self) -> usize {
        self.shared.registry.peripheral_count()
    }
}
