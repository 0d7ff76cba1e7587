//! Event dispatch
//!
//! Native callbacks arrive on arbitrary native threads. The [`Dispatcher`]
//! routes each one by handle to the owning adapter or peripheral, whose state
//! machine decides whether it becomes a listener event.
//!
//! Listener events go through a per-object [`EventLane`]: a FIFO that is
//! appended to while the owner's state lock is held (so lane order matches
//! transition order) and drained with no lock held (so listeners may call
//! back into the API). Whichever thread finds the lane idle drains it.
//!
//! A panicking listener is caught at the lane boundary, logged, and
//! published on the process-wide failure channel returned by
//! [`subscribe_failures`].

use crate::adapter::Adapter;
use crate::native::{EventSink, Handle, NativeEvent};
use crate::peripheral::Peripheral;
use crate::session::Shared;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{OnceLock, Weak};
use tokio::sync::broadcast;

const FAILURE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// FAILURE CHANNEL
// ============================================================================

/// A listener that panicked while handling an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerFailure {
    /// Handle of the adapter or peripheral whose listener failed
    pub handle: u64,
    /// Listener method that panicked, e.g. `on_connected`
    pub callback: String,
    pub message: String,
}

fn failure_sender() -> &'static broadcast::Sender<ListenerFailure> {
    static FAILURES: OnceLock<broadcast::Sender<ListenerFailure>> = OnceLock::new();
    FAILURES.get_or_init(|| broadcast::channel(FAILURE_CHANNEL_CAPACITY).0)
}

/// Subscribe to listener failures raised anywhere in the process
pub fn subscribe_failures() -> broadcast::Receiver<ListenerFailure> {
    failure_sender().subscribe()
}

/// Run one listener callback, isolating panics
pub(crate) fn invoke(handle: Handle, callback: &'static str, body: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "listener panicked".to_string());
        tracing::error!("Listener {} for {} panicked: {}", callback, handle, message);
        // No subscribers is fine
        let _ = failure_sender().send(ListenerFailure {
            handle: handle.0,
            callback: callback.to_string(),
            message,
        });
    }
}

// ============================================================================
// EVENT LANE
// ============================================================================

struct LaneState<E> {
    pending: VecDeque<E>,
    draining: bool,
}

/// Serial FIFO of listener events for one adapter or peripheral
pub(crate) struct EventLane<E> {
    state: Mutex<LaneState<E>>,
}

impl<E> EventLane<E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Append an event; callers hold the owner's state lock
    pub(crate) fn push(&self, event: E) {
        self.state.lock().pending.push_back(event);
    }

    /// Deliver pending events in order unless another thread is already
    /// draining, in which case that thread picks them up.
    pub(crate) fn drain(&self, mut deliver: impl FnMut(E)) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            deliver(next);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Routes native callbacks to adapter and peripheral state machines
pub(crate) struct Dispatcher {
    shared: Weak<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

impl EventSink for Dispatcher {
    fn deliver(&self, event: NativeEvent) {
        let Some(shared) = self.shared.upgrade() else {
            tracing::debug!("Session gone, dropping native {}", event.kind());
            return;
        };
        tracing::debug!("Dispatching native {}", event.kind());

        match event {
            NativeEvent::ScanStart { adapter } => {
                if let Some(adapter) = Adapter::lookup(&shared, adapter) {
                    adapter.handle_native_scan_start();
                }
            }
            NativeEvent::ScanStop { adapter } => {
                if let Some(adapter) = Adapter::lookup(&shared, adapter) {
                    adapter.handle_native_scan_stop();
                }
            }
            NativeEvent::ScanFound {
                adapter,
                peripheral,
            } => {
                if let Some(adapter) = Adapter::lookup(&shared, adapter) {
                    adapter.handle_native_observation(peripheral, false);
                }
            }
            NativeEvent::ScanUpdated {
                adapter,
                peripheral,
            } => {
                if let Some(adapter) = Adapter::lookup(&shared, adapter) {
                    adapter.handle_native_observation(peripheral, true);
                }
            }
            NativeEvent::Connected { peripheral } => {
                if let Some(peripheral) = Peripheral::lookup(&shared, peripheral) {
                    peripheral.handle_native_connected();
                }
            }
            NativeEvent::Disconnected { peripheral } => {
                if let Some(peripheral) = Peripheral::lookup(&shared, peripheral) {
                    peripheral.handle_native_disconnected();
                }
            }
            NativeEvent::ValueChanged {
                peripheral,
                service,
                characteristic,
                data,
            } => {
                if let Some(peripheral) = Peripheral::lookup(&shared, peripheral) {
                    peripheral.handle_native_value(service, characteristic, data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lane_delivers_in_order() {
        let lane = EventLane::new();
        for i in 0..5 {
            lane.push(i);
        }
        let mut seen = Vec::new();
        lane.drain(|e| seen.push(e));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(lane.len(), 0);
    }

    #[test]
    fn test_reentrant_push_is_delivered_after_current() {
        let lane = Arc::new(EventLane::new());
        lane.push(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_lane = lane.clone();
        let inner_seen = seen.clone();
        lane.drain(move |e| {
            inner_seen.lock().push(e);
            if e == 1 {
                inner_lane.push(2);
                // Nested drain must not deliver while the outer one runs
                let nested_seen = inner_seen.clone();
                inner_lane.drain(move |n| nested_seen.lock().push(n * 100));
                inner_seen.lock().push(10);
            }
        });

        assert_eq!(*seen.lock(), vec![1, 10, 2]);
    }

    #[test]
    fn test_invoke_reports_panics() {
        let mut failures = subscribe_failures();
        invoke(Handle(77), "on_scan_found", || panic!("listener exploded"));

        // Other tests may publish concurrently; look for ours
        let mut found = false;
        while let Ok(failure) = failures.try_recv() {
            if failure.handle == 77 {
                assert_eq!(failure.callback, "on_scan_found");
                assert_eq!(failure.message, "listener exploded");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_invoke_runs_body() {
        let mut ran = false;
        invoke(Handle(1), "on_scan_start", || ran = true);
        assert!(ran);
    }
}
