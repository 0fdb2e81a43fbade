//! End-to-end lifecycle behaviour of the MQTT5 client binding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;

use tether::error::Result;
use tether::mqtt5::{Mqtt5Client, Mqtt5Events, Mqtt5Options, PublishReceived, Qos};
use tether::{Error, HostRuntime};
use tether_core::error::{
    ERROR_CONNECTION_FAILED, ERROR_NOT_CONNECTED, ERROR_OPERATION_INTERRUPTED,
};

const PATIENCE: Duration = Duration::from_secs(5);

/// Counts drops so tests can observe when the binding lets go of a
/// captured reference.
struct NoteDrop(Arc<AtomicUsize>);

impl Drop for NoteDrop {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct ChannelEvents {
    tx: Mutex<mpsc::Sender<(String, Vec<u8>)>>,
}

impl Mqtt5Events for ChannelEvents {
    fn on_message(&self, publish: &PublishReceived<'_>) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send((publish.topic.to_owned(), publish.payload.to_vec()));
        Ok(())
    }
}

fn channel_events() -> (Arc<dyn Mqtt5Events>, mpsc::Receiver<(String, Vec<u8>)>) {
    let (tx, rx) = mpsc::channel();
    (
        Arc::new(ChannelEvents { tx: Mutex::new(tx) }),
        rx,
    )
}

fn connect(client: &Mqtt5Client) {
    let (tx, rx) = mpsc::channel();
    client
        .connect(move |code| {
            let _ = tx.send(code);
        })
        .expect("connect submit");
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(0), "connect must succeed");
}

#[test]
fn dropping_the_client_runs_shutdown_exactly_once() {
    let host = HostRuntime::new();
    let (events, _rx) = channel_events();

    // A captive in the handshake transform stands in for every strong
    // reference the record holds until terminal.
    let strong_drops = Arc::new(AtomicUsize::new(0));
    let captive = NoteDrop(Arc::clone(&strong_drops));
    let mut options = Mqtt5Options::new("broker.example:8883");
    options.handshake_transform = Some(Box::new(move |_req| {
        let _held = &captive;
        Ok(())
    }));

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let client = Mqtt5Client::new(&host, options, &events, move || {
        let _ = shutdown_tx.send(());
    })
    .expect("client");
    connect(&client);

    assert_eq!(strong_drops.load(Ordering::SeqCst), 0);

    // Dropping the user-facing object issues the release; the engine
    // delivers the shutdown callback from its own thread.
    drop(client);
    assert_eq!(shutdown_rx.recv_timeout(PATIENCE), Ok(()));
    assert!(
        shutdown_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "shutdown callback must fire exactly once"
    );

    // Strong references were released by the shutdown path.
    assert_eq!(strong_drops.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_setup_releases_references_and_skips_shutdown() {
    let host = HostRuntime::new();
    let (events, _rx) = channel_events();

    let strong_drops = Arc::new(AtomicUsize::new(0));
    let captive = NoteDrop(Arc::clone(&strong_drops));
    let mut options = Mqtt5Options::new("unreachable.invalid");
    options.handshake_transform = Some(Box::new(move |_req| {
        let _held = &captive;
        Ok(())
    }));

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let client = Mqtt5Client::new(&host, options, &events, move || {
        let _ = shutdown_tx.send(());
    })
    .expect("client");

    let (tx, rx) = mpsc::channel();
    client
        .connect(move |code| {
            let _ = tx.send(code);
        })
        .expect("connect submit");
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(ERROR_CONNECTION_FAILED));

    // References go immediately on setup failure, while the handle is
    // still alive; and the shutdown callback never comes.
    let deadline = std::time::Instant::now() + PATIENCE;
    while strong_drops.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(strong_drops.load(Ordering::SeqCst), 1);
    assert!(shutdown_rx.recv_timeout(Duration::from_millis(300)).is_err());

    // The handle is consumed: further operations see a typed error.
    let err = client
        .publish("t", b"x", Qos::AtMostOnce, |_| {})
        .expect_err("consumed binding");
    assert!(matches!(err, Error::NullNative(_)));

    drop(client);
    assert!(shutdown_rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn publish_payload_outlives_the_caller_stack() {
    let host = HostRuntime::new();
    let (events, inbound) = channel_events();
    let (shutdown_tx, _shutdown_rx) = mpsc::channel();
    let client = Mqtt5Client::new(
        &host,
        Mqtt5Options::new("broker.example:8883"),
        &events,
        move || {
            let _ = shutdown_tx.send(());
        },
    )
    .expect("client");
    connect(&client);

    let (suback_tx, suback_rx) = mpsc::channel();
    client
        .subscribe("sensors/#", Qos::AtLeastOnce, move |code, granted| {
            let _ = suback_tx.send((code, granted));
        })
        .expect("subscribe submit");
    let (code, granted) = suback_rx.recv_timeout(PATIENCE).expect("suback");
    assert_eq!(code, 0);
    assert_eq!(granted, vec![Qos::AtLeastOnce]);

    let (done_tx, done_rx) = mpsc::channel();
    {
        // Temporary payload: dies as soon as this scope closes. The
        // completion token owns the bytes until delivery.
        let payload = b"temperature=21.5".to_vec();
        client
            .publish("sensors/kitchen", &payload, Qos::AtLeastOnce, move |code| {
                let _ = done_tx.send(code);
            })
            .expect("publish submit");
    }

    let (topic, payload) = inbound.recv_timeout(PATIENCE).expect("delivery");
    assert_eq!(topic, "sensors/kitchen");
    assert_eq!(payload, b"temperature=21.5");
    assert_eq!(done_rx.recv_timeout(PATIENCE), Ok(0));
}

#[test]
fn zero_length_payload_is_delivered_empty() {
    let host = HostRuntime::new();
    let (events, inbound) = channel_events();
    let client = Mqtt5Client::new(
        &host,
        Mqtt5Options::new("broker.example:8883"),
        &events,
        || {},
    )
    .expect("client");
    connect(&client);

    let (suback_tx, suback_rx) = mpsc::channel();
    client
        .subscribe("pings", Qos::AtMostOnce, move |code, _| {
            let _ = suback_tx.send(code);
        })
        .expect("subscribe submit");
    assert_eq!(suback_rx.recv_timeout(PATIENCE), Ok(0));

    let (done_tx, done_rx) = mpsc::channel();
    client
        .publish("pings", b"", Qos::AtMostOnce, move |code| {
            let _ = done_tx.send(code);
        })
        .expect("publish submit");

    assert_eq!(done_rx.recv_timeout(PATIENCE), Ok(0));
    let (topic, payload) = inbound.recv_timeout(PATIENCE).expect("delivery");
    assert_eq!(topic, "pings");
    assert!(payload.is_empty());
}

#[test]
fn stop_is_the_cancellation_surface() {
    let host = HostRuntime::new();
    let (events, _rx) = channel_events();
    let client = Mqtt5Client::new(
        &host,
        Mqtt5Options::new("broker.example:8883"),
        &events,
        || {},
    )
    .expect("client");
    connect(&client);

    // An operation in flight when the client stops still completes —
    // with the interruption code if the stop won the race.
    let (done_tx, done_rx) = mpsc::channel();
    client
        .publish("t", b"x", Qos::AtMostOnce, move |code| {
            let _ = done_tx.send(code);
        })
        .expect("publish submit");
    client.stop().expect("stop");
    let code = done_rx.recv_timeout(PATIENCE).expect("completion");
    assert!(
        code == 0 || code == ERROR_OPERATION_INTERRUPTED,
        "unexpected completion code {code}"
    );

    // After stop, submissions fail synchronously with a typed error.
    let err = client
        .publish("t", b"y", Qos::AtMostOnce, |_| {})
        .expect_err("stopped client");
    assert_eq!(err.native_code(), Some(ERROR_NOT_CONNECTED));
}

#[test]
fn failing_handshake_transform_aborts_setup() {
    let host = HostRuntime::new();
    let sink_hits = Arc::new(AtomicUsize::new(0));
    let sink_hits2 = Arc::clone(&sink_hits);
    host.set_unraisable_sink(Some(Box::new(move |_| {
        sink_hits2.fetch_add(1, Ordering::SeqCst);
    })));

    let (events, _rx) = channel_events();
    let mut options = Mqtt5Options::new("broker.example:8883");
    options.handshake_transform = Some(Box::new(|_req| {
        Err(Error::InvalidArgument("credential lookup failed".into()))
    }));

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let client = Mqtt5Client::new(&host, options, &events, move || {
        let _ = shutdown_tx.send(());
    })
    .expect("client");

    let (tx, rx) = mpsc::channel();
    client
        .connect(move |code| {
            let _ = tx.send(code);
        })
        .expect("connect submit");

    // Setup completes with the callback-exception code, the failure went
    // to the unraisable sink, and nothing further is delivered.
    assert_eq!(
        rx.recv_timeout(PATIENCE),
        Ok(tether::ERROR_CALLBACK_EXCEPTION)
    );
    assert_eq!(sink_hits.load(Ordering::SeqCst), 1);
    assert!(shutdown_rx.recv_timeout(Duration::from_millis(300)).is_err());

    let err = client
        .publish("t", b"x", Qos::AtMostOnce, |_| {})
        .expect_err("aborted setup");
    assert!(matches!(err, Error::NullNative(_)));
}
