// SPDX-License-Identifier: MPL-2.0

//! Token wait timeouts, the connect timeout and keep-alive supervision

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{options, wait_until, Recorder, TestBroker, WAIT};
use flowlink::mqtt_serde::control_packet::MqttPacket;
use flowlink::{AsyncMqttClient, ConnectionState, MqttClientError};

#[test]
fn test_connect_times_out_without_connack() {
    let broker = TestBroker::start();
    broker.set_silent(true);
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("to-connect")
            .connection_timeout_ms(300)
            .build()
            .unwrap(),
    )
    .unwrap();

    let started = Instant::now();
    let result = client.connect().unwrap().wait_for_completion(Some(WAIT));
    assert!(
        matches!(result, Err(MqttClientError::OperationTimeout { .. })),
        "unexpected outcome {:?}",
        result
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_until(WAIT, || {
        client.connection_state() == ConnectionState::Disconnected
    }));
    client.close().unwrap();
}

#[test]
fn test_wait_timeout_leaves_operation_pending() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(&broker.uri(), options("to-wait").build().unwrap()).unwrap();
    client.connect().unwrap().wait_for_completion(Some(WAIT)).unwrap();

    broker.set_ack_publishes(false);
    let token = client.publish("to/t", b"slow".to_vec(), 1, false).unwrap();
    let started = Instant::now();
    let result = token.wait_for_completion(Some(Duration::from_millis(200)));
    assert!(matches!(result, Err(MqttClientError::OperationTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // timing out a wait does not cancel the publish
    assert!(!token.is_complete());
    assert_eq!(client.in_flight_count(), 1);
    assert_eq!(client.pending_delivery_tokens().len(), 1);

    client
        .disconnect_forcibly(Duration::ZERO, Duration::from_secs(1))
        .unwrap();
}

#[test]
fn test_none_timeout_waits_for_completion() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(&broker.uri(), options("to-none").build().unwrap()).unwrap();
    client.connect().unwrap().wait_for_completion(None).unwrap();

    let token = client.subscribe("to/#", 1).unwrap();
    token.wait_for_completion(None).unwrap();
    assert!(token.is_complete());

    let token = client.publish("to/t", b"x".to_vec(), 2, false).unwrap();
    token.wait_for_completion(None).unwrap();
    assert!(token.error().is_none());
    client.disconnect().unwrap().wait_for_completion(None).unwrap();
}

#[test]
fn test_keep_alive_pings_idle_connection() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("to-ping").keep_alive(1).build().unwrap(),
    )
    .unwrap();
    client.connect().unwrap().wait_for_completion(Some(WAIT)).unwrap();

    thread::sleep(Duration::from_millis(2_500));
    assert!(client.is_connected());
    let pings = broker
        .received()
        .iter()
        .filter(|(_, p)| *p == MqttPacket::PingReq)
        .count();
    assert!(pings >= 1, "no PINGREQ in {:?}", broker.received());
    client.disconnect().unwrap().wait_for_completion(Some(WAIT)).unwrap();
}

#[test]
fn test_unanswered_ping_drops_connection() {
    let broker = TestBroker::start();
    let recorder = Arc::new(Recorder::default());
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("to-silent").keep_alive(1).build().unwrap(),
    )
    .unwrap();
    client.set_callback(recorder.clone());
    client.connect().unwrap().wait_for_completion(Some(WAIT)).unwrap();

    broker.set_silent(true);
    assert!(wait_until(WAIT, || !recorder.lost().is_empty()));
    assert!(matches!(
        recorder.lost()[0],
        MqttClientError::ClientTimeout { keep_alive_secs: 1 }
    ));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    client.close().unwrap();
}
