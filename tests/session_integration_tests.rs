//! Session Integration Tests
//!
//! End-to-end runs of `AsyncMqttClient` against the loopback broker:
//! - Publish/subscribe round trips at every QoS, on both protocol levels
//! - QoS 1/2 redelivery with DUP after connection loss and restart
//! - Persistence entries living exactly as long as a QoS 2 flow
//! - Quiesce on disconnect
//! - Offline buffering, with and without eviction
//! - A failing subscriber disconnecting without disturbing a publisher

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{options, wait_until, Recorder, TestBroker, WAIT};
use flowlink::mqtt_serde::control_packet::MqttPacket;
use flowlink::{
    AsyncMqttClient, CallbackError, ConnectionState, DisconnectedBufferOptions,
    MemoryPersistence, MqttClientError, MqttClientPersistence, MqttMessage,
};

fn connected(broker: &TestBroker, client: AsyncMqttClient) -> AsyncMqttClient {
    client
        .connect()
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();
    assert!(wait_until(WAIT, || broker.is_connected(client.client_id())));
    client
}

fn shut(client: AsyncMqttClient) {
    client
        .disconnect_with_timeout(Duration::from_secs(1))
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();
    client.close().unwrap();
}

fn keys_with_prefix(persistence: &MemoryPersistence, prefix: &str) -> Vec<String> {
    persistence
        .keys()
        .unwrap()
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .collect()
}

fn round_trip(version: u8) {
    let broker = TestBroker::with_version(version);
    let sub_store = Arc::new(MemoryPersistence::new());
    let subscriber = AsyncMqttClient::with_persistence(
        &broker.uri(),
        options("sub").mqtt_version(version).build().unwrap(),
        sub_store.clone(),
    )
    .unwrap();
    let recorder = Arc::new(Recorder::default());
    subscriber.set_callback(recorder.clone());
    let subscriber = connected(&broker, subscriber);

    let token = subscriber.subscribe("sensors/#", 2).unwrap();
    token.wait_for_completion(Some(WAIT)).unwrap();
    assert_eq!(token.granted_qos(), vec![2]);

    let publisher = connected(
        &broker,
        AsyncMqttClient::new(
            &broker.uri(),
            options("pub").mqtt_version(version).build().unwrap(),
        )
        .unwrap(),
    );
    let publisher_events = Arc::new(Recorder::default());
    publisher.set_callback(publisher_events.clone());
    for qos in 0..=2u8 {
        publisher
            .publish(&format!("sensors/{}", qos), format!("m{}", qos), qos, false)
            .unwrap()
            .wait_for_completion(Some(WAIT))
            .unwrap();
    }

    assert!(wait_until(WAIT, || recorder.messages().len() == 3));
    let mut seen: Vec<(String, u8, String)> = recorder
        .messages()
        .iter()
        .map(|m| {
            (
                m.topic.clone(),
                m.qos,
                m.payload_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("sensors/0".to_string(), 0, "m0".to_string()),
            ("sensors/1".to_string(), 1, "m1".to_string()),
            ("sensors/2".to_string(), 2, "m2".to_string()),
        ]
    );
    assert!(wait_until(WAIT, || publisher_events.delivered.load(Ordering::SeqCst) == 3));
    assert!(publisher.pending_delivery_tokens().is_empty());
    // the inbound QoS 2 record goes once PUBREL is handled
    assert!(wait_until(WAIT, || keys_with_prefix(&sub_store, "r-").is_empty()));

    let token = subscriber.unsubscribe("sensors/#").unwrap();
    token.wait_for_completion(Some(WAIT)).unwrap();

    shut(publisher);
    shut(subscriber);
}

#[test]
fn test_round_trip_v311() {
    round_trip(4);
}

#[test]
fn test_round_trip_v5() {
    round_trip(5);
}

#[test]
fn test_subscription_listener_takes_precedence() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(&broker.uri(), options("listen").build().unwrap()).unwrap();
    let recorder = Arc::new(Recorder::default());
    client.set_callback(recorder.clone());
    let client = connected(&broker, client);

    let heard = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = heard.clone();
    client
        .subscribe_with_listener(
            "alerts/+",
            1,
            Arc::new(move |topic: &str, _message: &MqttMessage| {
                sink.lock().unwrap().push(topic.to_string());
                Ok::<(), CallbackError>(())
            }),
        )
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();
    client
        .subscribe("other", 1)
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();

    client.publish("alerts/fire", "!", 1, false).unwrap();
    client.publish("other", "x", 1, false).unwrap();
    assert!(wait_until(WAIT, || heard.lock().unwrap().len() == 1
        && recorder.messages().len() == 1));
    assert_eq!(heard.lock().unwrap()[0], "alerts/fire");
    assert_eq!(recorder.messages()[0].topic, "other");
    shut(client);
}

#[test]
fn test_qos1_redelivered_with_dup_after_connection_loss() {
    let broker = TestBroker::start();
    broker.set_ack_publishes(false);
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("dup")
            .clean_start(false)
            .auto_reconnect(true)
            .build()
            .unwrap(),
    )
    .unwrap();
    let recorder = Arc::new(Recorder::default());
    client.set_callback(recorder.clone());
    let client = connected(&broker, client);

    let token = client.publish("jobs/1", "work", 1, false).unwrap();
    let first = broker.wait_for_publishes(1).remove(0);
    assert!(!first.dup);

    broker.set_ack_publishes(true);
    broker.drop_connections();

    assert!(wait_until(WAIT, || token.is_complete() && token.error().is_none()));
    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert!(publishes[1].dup);
    assert_eq!(publishes[1].packet_id, first.packet_id);
    assert_eq!(publishes[1].payload, b"work".to_vec());

    assert_eq!(recorder.lost().len(), 1);
    assert_eq!(recorder.connects(), vec![false, true]);
    assert!(client.is_connected());
    shut(client);
}

#[test]
fn test_qos1_redelivered_after_restart() {
    let broker = TestBroker::start();
    broker.set_ack_publishes(false);
    let persistence = Arc::new(MemoryPersistence::new());
    {
        let client = connected(
            &broker,
            AsyncMqttClient::with_persistence(
                &broker.uri(),
                options("restart").clean_start(false).build().unwrap(),
                persistence.clone(),
            )
            .unwrap(),
        );
        client.publish("jobs/2", "again", 1, false).unwrap();
        broker.wait_for_publishes(1);
        // dropped without DISCONNECT, as if the process died
    }
    broker.set_ack_publishes(true);

    let client = AsyncMqttClient::with_persistence(
        &broker.uri(),
        options("restart").clean_start(false).build().unwrap(),
        persistence.clone(),
    )
    .unwrap();
    let pending = client.pending_delivery_tokens();
    assert_eq!(pending.len(), 1);
    let first = broker.publishes().remove(0);
    assert_eq!(pending[0].message_id(), first.packet_id);

    let client = connected(&broker, client);
    assert!(wait_until(WAIT, || pending[0].is_complete()
        && pending[0].error().is_none()));
    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert!(publishes[1].dup);
    assert_eq!(publishes[1].packet_id, first.packet_id);
    assert!(keys_with_prefix(&persistence, "s-").is_empty());
    shut(client);
}

#[test]
fn test_qos2_persisted_until_pubcomp() {
    let broker = TestBroker::start();
    broker.set_ack_publishes(false);
    let persistence = Arc::new(MemoryPersistence::new());
    let client = connected(
        &broker,
        AsyncMqttClient::with_persistence(
            &broker.uri(),
            options("exactly-once")
                .clean_start(false)
                .auto_reconnect(true)
                .build()
                .unwrap(),
            persistence.clone(),
        )
        .unwrap(),
    );

    let token = client.publish("ledger", "entry", 2, false).unwrap();
    let id = broker.wait_for_publishes(1)[0].packet_id.unwrap();
    assert!(persistence.contains_key(&format!("s-{}", id)).unwrap());

    broker.set_ack_publishes(true);
    broker.drop_connections();
    assert!(wait_until(WAIT, || token.is_complete() && token.error().is_none()));

    assert!(keys_with_prefix(&persistence, "s-").is_empty());
    assert!(keys_with_prefix(&persistence, "sc-").is_empty());
    let rels = broker
        .received()
        .into_iter()
        .filter(|(_, p)| matches!(p, MqttPacket::PubRel(_)))
        .count();
    assert_eq!(rels, 1);
    shut(client);
}

#[test]
fn test_disconnect_quiesces_until_timeout() {
    let broker = TestBroker::start();
    broker.set_ack_publishes(false);
    let client = connected(
        &broker,
        AsyncMqttClient::new(&broker.uri(), options("quiet").build().unwrap()).unwrap(),
    );
    let deliveries: Vec<_> = (0..3)
        .map(|i| client.publish("slow", format!("ack me {}", i), 2, false).unwrap())
        .collect();
    broker.wait_for_publishes(3);
    assert_eq!(client.in_flight_count(), 3);

    let started = Instant::now();
    let token = client
        .disconnect_with_timeout(Duration::from_millis(500))
        .unwrap();
    assert!(matches!(
        client.publish("slow", "late", 1, false),
        Err(MqttClientError::ClientDisconnecting)
    ));
    token.wait_for_completion(Some(WAIT)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(!client.is_connected());
    assert_eq!(client.in_flight_count(), 0);
    for delivery in deliveries {
        assert!(delivery.wait_for_completion(Some(WAIT)).is_err());
    }
    client.close().unwrap();
}

#[test]
fn test_disconnect_returns_early_when_idle() {
    let broker = TestBroker::start();
    let client = connected(
        &broker,
        AsyncMqttClient::new(&broker.uri(), options("idle").build().unwrap()).unwrap(),
    );
    client
        .publish("fast", "x", 1, false)
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();

    let started = Instant::now();
    client
        .disconnect_with_timeout(Duration::from_secs(30))
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_until(WAIT, || !broker.is_connected("idle")));
    assert!(broker
        .received()
        .iter()
        .any(|(_, p)| matches!(p, MqttPacket::Disconnect(_))));
    client.close().unwrap();
}

fn buffer_options(delete_oldest: bool) -> DisconnectedBufferOptions {
    DisconnectedBufferOptions {
        enabled: true,
        buffer_size: 2,
        persist_buffer: false,
        delete_oldest_messages: delete_oldest,
    }
}

fn payloads(broker: &TestBroker) -> Vec<String> {
    broker
        .publishes()
        .iter()
        .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
        .collect()
}

#[test]
fn test_offline_buffer_full_rejects() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("buffered")
            .disconnected_buffer(buffer_options(false))
            .build()
            .unwrap(),
    )
    .unwrap();

    let first = client.publish("q", "m0", 1, false).unwrap();
    client.publish("q", "m1", 1, false).unwrap();
    assert!(matches!(
        client.publish("q", "m2", 1, false),
        Err(MqttClientError::BufferFull { .. })
    ));
    assert_eq!(client.buffered_message_count(), 2);

    let client = connected(&broker, client);
    broker.wait_for_publishes(2);
    assert_eq!(payloads(&broker), vec!["m0", "m1"]);
    first.wait_for_completion(Some(WAIT)).unwrap();
    assert!(wait_until(WAIT, || client.buffered_message_count() == 0));
    shut(client);
}

#[test]
fn test_offline_buffer_evicts_oldest() {
    let broker = TestBroker::start();
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("evicting")
            .disconnected_buffer(buffer_options(true))
            .build()
            .unwrap(),
    )
    .unwrap();
    let recorder = Arc::new(Recorder::default());
    client.set_callback(recorder.clone());

    let first = client.publish("q", "m0", 1, false).unwrap();
    client.publish("q", "m1", 1, false).unwrap();
    client.publish("q", "m2", 0, false).unwrap();
    assert_eq!(client.buffered_message_count(), 2);
    assert!(matches!(
        first.wait_for_completion(Some(WAIT)),
        Err(MqttClientError::MessageDiscarded)
    ));
    assert_eq!(recorder.discarded.lock().unwrap()[0].payload, b"m0".to_vec());

    let client = connected(&broker, client);
    broker.wait_for_publishes(2);
    assert_eq!(payloads(&broker), vec!["m1", "m2"]);
    shut(client);
}

#[test]
fn test_failing_subscriber_disconnects_alone() {
    let broker = TestBroker::start();
    let subscriber = AsyncMqttClient::new(&broker.uri(), options("slow-sub").build().unwrap())
        .unwrap();
    let events = Arc::new(Recorder::failing(Duration::from_secs(5)));
    subscriber.set_callback(events.clone());
    let subscriber = connected(&broker, subscriber);
    subscriber
        .subscribe("feed/#", 0)
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();

    let publisher = connected(
        &broker,
        AsyncMqttClient::new(&broker.uri(), options("fast-pub").build().unwrap()).unwrap(),
    );
    for i in 0..16 {
        publisher
            .publish("feed/items", format!("item {}", i), 0, false)
            .unwrap()
            .wait_for_completion(Some(WAIT))
            .unwrap();
    }
    assert!(publisher.is_connected());

    // the subscriber's receiver is parked on a full callback queue until
    // the failing callback stops the dispatcher
    assert!(wait_until(Duration::from_secs(20), || {
        subscriber.connection_state() == ConnectionState::Disconnected
            && !events.lost().is_empty()
    }));
    assert!(matches!(
        events.lost().first(),
        Some(MqttClientError::CallbackFailed { .. })
    ));
    assert!(publisher.is_connected());
    publisher
        .publish("feed/items", "after", 1, false)
        .unwrap()
        .wait_for_completion(Some(WAIT))
        .unwrap();
    shut(publisher);
    subscriber.close().unwrap();
}

#[test]
fn test_refused_connect_is_not_retried() {
    let broker = TestBroker::start();
    broker.set_connack_code(0x05);
    let client = AsyncMqttClient::new(
        &broker.uri(),
        options("denied").auto_reconnect(true).build().unwrap(),
    )
    .unwrap();
    let result = client.connect().unwrap().wait_for_completion(Some(WAIT));
    match result {
        Err(e) => assert!(e.is_auth_error(), "unexpected error {:?}", e),
        Ok(()) => panic!("connect should be refused"),
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(broker.connect_count(), 1);
    assert!(!client.is_connected());
    client.close().unwrap();
}
