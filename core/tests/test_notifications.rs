//! Integration tests for characteristic subscriptions and value routing

use bluebridge_core::native::mock::MockCall;
use bluebridge_core::native::MockBackend;
use bluebridge_core::{
    BluetoothUuid, Characteristic, CharacteristicCapabilities, ConnectionState, Descriptor, Error,
    Handle, NotifyListener, Peripheral, Service, Session,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn uuid(short: u16) -> BluetoothUuid {
    BluetoothUuid::from_u16(short)
}

fn service() -> BluetoothUuid {
    uuid(0x180d)
}

fn measurement() -> BluetoothUuid {
    uuid(0x2a37)
}

fn location() -> BluetoothUuid {
    uuid(0x2a38)
}

fn control_point() -> BluetoothUuid {
    uuid(0x2a39)
}

fn client_config() -> BluetoothUuid {
    uuid(0x2902)
}

fn heart_rate_service() -> Service {
    Service {
        uuid: service(),
        data: Vec::new(),
        characteristics: vec![
            Characteristic {
                uuid: measurement(),
                capabilities: CharacteristicCapabilities {
                    notify: true,
                    ..Default::default()
                },
                descriptors: vec![Descriptor {
                    uuid: client_config(),
                }],
            },
            Characteristic {
                uuid: location(),
                capabilities: CharacteristicCapabilities {
                    read: true,
                    write_request: true,
                    ..Default::default()
                },
                descriptors: Vec::new(),
            },
            Characteristic {
                uuid: control_point(),
                capabilities: CharacteristicCapabilities {
                    indicate: true,
                    write_request: true,
                    ..Default::default()
                },
                descriptors: Vec::new(),
            },
        ],
    }
}

/// Collects payloads pushed to one subscription
#[derive(Default)]
struct Payloads(Mutex<Vec<Vec<u8>>>);

impl NotifyListener for Payloads {
    fn on_notify(&self, data: &[u8]) {
        self.0.lock().push(data.to_vec());
    }
}

impl Payloads {
    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.lock())
    }
}

struct Fixture {
    mock: Arc<MockBackend>,
    _session: Session,
    handle: Handle,
    peripheral: Peripheral,
}

impl Fixture {
    /// A session with one connected heart rate monitor
    fn connected() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mock = Arc::new(MockBackend::new());
        mock.add_adapter("hci0", "00:1A:7D:DA:71:13");
        let handle = mock.add_peripheral("hrm", "C0:FF:EE:00:00:01", -58);
        mock.set_paired(handle, true);
        mock.set_services(handle, vec![heart_rate_service()]);

        let session = Session::with_backend(mock.clone()).unwrap();
        let peripheral = session.adapters()[0]
            .get_paired_peripherals()
            .unwrap()
            .remove(0);
        peripheral.connect().unwrap();
        assert!(peripheral.wait_for_state(ConnectionState::Connected, WAIT));

        Self {
            mock,
            _session: session,
            handle,
            peripheral,
        }
    }

    fn push(&self, characteristic: BluetoothUuid, data: &[u8]) {
        self.mock
            .emit_value(self.handle, service(), characteristic, data);
    }

    fn subscribe(&self, characteristic: BluetoothUuid) -> (Arc<Payloads>, Arc<dyn NotifyListener>) {
        let payloads = Arc::new(Payloads::default());
        let listener: Arc<dyn NotifyListener> = payloads.clone();
        self.peripheral
            .notify(&service(), &characteristic, &listener)
            .unwrap();
        (payloads, listener)
    }
}

#[test]
fn test_notifications_arrive_in_order() {
    let fixture = Fixture::connected();
    let (payloads, _listener) = fixture.subscribe(measurement());
    assert!(fixture
        .mock
        .is_subscribed(fixture.handle, &service(), &measurement()));

    for bpm in [61u8, 62, 64, 63] {
        fixture.push(measurement(), &[0x00, bpm]);
    }

    assert_eq!(
        payloads.take(),
        vec![vec![0x00, 61], vec![0x00, 62], vec![0x00, 64], vec![0x00, 63]]
    );
    println!("✓ 4 notifications delivered in native order");
}

#[test]
fn test_closure_listener() {
    let fixture = Fixture::connected();
    let total = Arc::new(Mutex::new(0usize));
    let sum = total.clone();
    let listener: Arc<dyn NotifyListener> = Arc::new(move |data: &[u8]| {
        *sum.lock() += data.len();
    });
    fixture
        .peripheral
        .notify(&service(), &measurement(), &listener)
        .unwrap();

    fixture.push(measurement(), &[1, 2, 3]);
    fixture.push(measurement(), &[4]);
    assert_eq!(*total.lock(), 4);
}

#[test]
fn test_non_notifiable_characteristic_is_rejected() {
    let fixture = Fixture::connected();
    let payloads = Arc::new(Payloads::default());
    let listener: Arc<dyn NotifyListener> = payloads.clone();

    match fixture.peripheral.notify(&service(), &location(), &listener) {
        Err(Error::CharacteristicNotNotifiable {
            service: s,
            characteristic,
        }) => {
            assert_eq!(s, service());
            assert_eq!(characteristic, location());
        }
        other => panic!("expected CharacteristicNotNotifiable, got {:?}", other),
    }

    fixture.push(location(), &[0x01]);
    assert!(payloads.take().is_empty());
    assert_eq!(
        fixture
            .mock
            .count_calls(|c| matches!(c, MockCall::Notify(..) | MockCall::Indicate(..))),
        0
    );
}

#[test]
fn test_subscription_preconditions() {
    let fixture = Fixture::connected();
    let listener: Arc<dyn NotifyListener> = Arc::new(Payloads::default());

    assert!(matches!(
        fixture.peripheral.notify(&service(), &uuid(0x2a99), &listener),
        Err(Error::UnknownCharacteristic { .. })
    ));
    assert!(matches!(
        fixture.peripheral.notify(&uuid(0x1800), &measurement(), &listener),
        Err(Error::UnknownCharacteristic { .. })
    ));

    fixture.peripheral.disconnect().unwrap();
    assert!(fixture
        .peripheral
        .wait_for_state(ConnectionState::Disconnected, WAIT));
    assert!(matches!(
        fixture.peripheral.notify(&service(), &measurement(), &listener),
        Err(Error::NotConnected)
    ));
}

#[test]
fn test_resubscribe_replaces_listener_without_native_call() {
    let fixture = Fixture::connected();
    let (first, _first_listener) = fixture.subscribe(measurement());
    fixture.push(measurement(), &[1]);

    let (second, _second_listener) = fixture.subscribe(measurement());
    fixture.push(measurement(), &[2]);

    assert_eq!(first.take(), vec![vec![1]]);
    assert_eq!(second.take(), vec![vec![2]]);
    assert_eq!(
        fixture
            .mock
            .count_calls(|c| matches!(c, MockCall::Notify(..))),
        1
    );
}

#[test]
fn test_indicate_only_characteristic_uses_indications() {
    let fixture = Fixture::connected();
    let (payloads, _listener) = fixture.subscribe(control_point());
    fixture.push(control_point(), &[0x10, 0x01]);
    assert_eq!(payloads.take(), vec![vec![0x10, 0x01]]);

    let calls = fixture.mock.calls();
    assert!(calls.contains(&MockCall::Indicate(
        fixture.handle,
        service(),
        control_point()
    )));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, MockCall::Notify(..))));

    // Explicit indications on a notify-only characteristic are refused
    let listener: Arc<dyn NotifyListener> = Arc::new(Payloads::default());
    assert!(matches!(
        fixture
            .peripheral
            .indicate(&service(), &measurement(), &listener),
        Err(Error::CharacteristicNotNotifiable { .. })
    ));
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let fixture = Fixture::connected();
    let (payloads, _listener) = fixture.subscribe(measurement());
    fixture.push(measurement(), &[1]);

    fixture
        .peripheral
        .unsubscribe(&service(), &measurement())
        .unwrap();
    fixture.push(measurement(), &[2]);
    fixture
        .peripheral
        .unsubscribe(&service(), &measurement())
        .unwrap();

    assert_eq!(payloads.take(), vec![vec![1]]);
    assert_eq!(
        fixture
            .mock
            .count_calls(|c| matches!(c, MockCall::Unsubscribe(..))),
        1
    );
    assert!(!fixture
        .mock
        .is_subscribed(fixture.handle, &service(), &measurement()));
}

#[test]
fn test_disconnect_clears_subscriptions() {
    let fixture = Fixture::connected();
    let (payloads, _listener) = fixture.subscribe(measurement());

    fixture.mock.emit_disconnected(fixture.handle);
    assert_eq!(
        fixture.peripheral.connection_state(),
        ConnectionState::Disconnected
    );
    fixture.push(measurement(), &[9]);

    fixture.peripheral.connect().unwrap();
    assert!(fixture
        .peripheral
        .wait_for_state(ConnectionState::Connected, WAIT));
    // Reconnecting does not revive the old subscription
    fixture.push(measurement(), &[10]);

    assert!(payloads.take().is_empty());
}

#[test]
fn test_dropped_listener_receives_nothing() {
    let fixture = Fixture::connected();
    let (payloads, listener) = fixture.subscribe(measurement());
    let observer = Arc::downgrade(&payloads);
    drop(listener);
    drop(payloads);
    assert!(observer.upgrade().is_none());

    // Delivery to a dead listener is silently skipped
    fixture.push(measurement(), &[1]);
    assert!(fixture.peripheral.is_connected());
}

#[test]
fn test_write_then_read_round_trip() {
    let fixture = Fixture::connected();
    fixture
        .peripheral
        .write_request(&service(), &location(), &[0x02])
        .unwrap();
    assert_eq!(
        fixture.peripheral.read(&service(), &location()).unwrap(),
        vec![0x02]
    );

    fixture
        .peripheral
        .write_descriptor(&service(), &measurement(), &client_config(), &[0x01, 0x00])
        .unwrap();
    assert_eq!(
        fixture
            .peripheral
            .read_descriptor(&service(), &measurement(), &client_config())
            .unwrap(),
        vec![0x01, 0x00]
    );

    assert!(matches!(
        fixture.peripheral.read(&service(), &uuid(0x2a99)),
        Err(Error::UnknownCharacteristic { .. })
    ));
}

struct UnsubscribeOnFirst {
    peripheral: Peripheral,
    seen: Mutex<Vec<Vec<u8>>>,
}

impl NotifyListener for UnsubscribeOnFirst {
    fn on_notify(&self, data: &[u8]) {
        self.seen.lock().push(data.to_vec());
        self.peripheral
            .unsubscribe(&service(), &measurement())
            .unwrap();
    }
}

#[test]
fn test_unsubscribe_from_inside_listener() {
    let fixture = Fixture::connected();
    let listener = Arc::new(UnsubscribeOnFirst {
        peripheral: fixture.peripheral.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let as_dyn: Arc<dyn NotifyListener> = listener.clone();
    fixture
        .peripheral
        .notify(&service(), &measurement(), &as_dyn)
        .unwrap();

    fixture.push(measurement(), &[1]);
    fixture.push(measurement(), &[2]);

    assert_eq!(*listener.seen.lock(), vec![vec![1]]);
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while !condition() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn test_concurrent_subscribe_waits_for_native_result() {
    let fixture = Fixture::connected();
    fixture.mock.set_hold_subscribe(fixture.handle, true);

    let first = Arc::new(Payloads::default());
    let second = Arc::new(Payloads::default());
    let spawn_subscribe = |payloads: &Arc<Payloads>| {
        let peripheral = fixture.peripheral.clone();
        let listener: Arc<dyn NotifyListener> = payloads.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = peripheral.notify(&service(), &measurement(), &listener);
            let _ = tx.send((result, listener));
        });
        rx
    };

    let first_done = spawn_subscribe(&first);
    assert!(wait_until(|| fixture.mock.is_subscribe_pending(fixture.handle)));

    // The second caller must not be told it replaced a pending claim
    let second_done = spawn_subscribe(&second);
    std::thread::sleep(Duration::from_millis(50));
    assert!(second_done.try_recv().is_err());

    fixture.mock.release_subscribe(fixture.handle, false);
    let (result, _first_listener) = first_done.recv_timeout(WAIT).unwrap();
    assert!(matches!(result, Err(Error::Native(_))));

    // The second caller then issues its own native subscribe
    assert!(wait_until(|| fixture.mock.is_subscribe_pending(fixture.handle)));
    fixture.mock.release_subscribe(fixture.handle, true);
    let (result, _second_listener) = second_done.recv_timeout(WAIT).unwrap();
    result.unwrap();

    fixture.push(measurement(), &[0x00, 72]);
    assert!(first.take().is_empty());
    assert_eq!(second.take(), vec![vec![0x00, 72]]);
    assert_eq!(
        fixture
            .mock
            .count_calls(|c| matches!(c, MockCall::Notify(..))),
        2
    );
    println!("✓ Failed subscribe does not strand a concurrent subscriber");
}
