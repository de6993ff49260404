//! Loopback broker and helpers shared by the integration tests.
//!
//! The broker speaks just enough MQTT to exercise the client: it accepts
//! every CONNECT, routes publishes to matching subscriptions, answers
//! PINGREQ and runs its half of the QoS 1/2 handshakes. Acknowledgement of
//! inbound publishes can be switched off to leave messages in flight, and
//! every live connection can be dropped to simulate a network failure.

#![allow(dead_code)]

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use std::io::Write;

use flowlink::mqtt_serde::connect::MqttConnAck;
use flowlink::mqtt_serde::control_packet::MqttPacket;
use flowlink::mqtt_serde::parser::stream::MqttStream;
use flowlink::mqtt_serde::publish::{MqttPubResponse, MqttPublish};
use flowlink::mqtt_serde::subscribe::{MqttSubAck, MqttUnsubAck};
use flowlink::mqtt_serde::topic::topic_matches;
use flowlink::{
    CallbackError, MqttCallback, MqttClientError, MqttClientOptions, MqttMessage, MqttToken,
};

pub const WAIT: Duration = Duration::from_secs(10);

struct Session {
    conn_id: u64,
    client_id: String,
    writer: Arc<Mutex<TcpStream>>,
    subscriptions: Vec<(String, u8)>,
}

struct Shared {
    version: u8,
    ack_publishes: AtomicBool,
    accepting: AtomicBool,
    silent: AtomicBool,
    accepts: AtomicUsize,
    connack_code: AtomicU8,
    connects: AtomicUsize,
    received: Mutex<Vec<(String, MqttPacket)>>,
    sessions: Mutex<Vec<Session>>,
    next_conn: AtomicU64,
    next_packet_id: Mutex<u16>,
}

pub struct TestBroker {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::with_version(4)
    }

    pub fn with_version(version: u8) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            version,
            ack_publishes: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            accepts: AtomicUsize::new(0),
            connack_code: AtomicU8::new(0),
            connects: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(1),
            next_packet_id: Mutex::new(0),
        });
        let accepting = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };
                accepting.accepts.fetch_add(1, Ordering::SeqCst);
                if !accepting.accepting.load(Ordering::SeqCst) {
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                let shared = Arc::clone(&accepting);
                thread::spawn(move || serve(shared, stream));
            }
        });
        TestBroker { addr, shared }
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// When off, inbound QoS 1/2 publishes are recorded but never acked.
    pub fn set_ack_publishes(&self, ack: bool) {
        self.shared.ack_publishes.store(ack, Ordering::SeqCst);
    }

    /// Return code for subsequent CONNACKs.
    pub fn set_connack_code(&self, code: u8) {
        self.shared.connack_code.store(code, Ordering::SeqCst);
    }

    /// When off, new TCP connections are closed before CONNECT is read,
    /// as if the broker were down.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// When on, packets are still recorded but nothing is answered.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// TCP connections accepted, including refused ones.
    pub fn accept_count(&self) -> usize {
        self.shared.accepts.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(String, MqttPacket)> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Publishes received from clients, in arrival order.
    pub fn publishes(&self) -> Vec<MqttPublish> {
        self.received()
            .into_iter()
            .filter_map(|(_, p)| match p {
                MqttPacket::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn wait_for_publishes(&self, count: usize) -> Vec<MqttPublish> {
        assert!(
            wait_until(WAIT, || self.publishes().len() >= count),
            "broker saw {} publishes, expected {}",
            self.publishes().len(),
            count
        );
        self.publishes()
    }

    /// Closes every client socket without a DISCONNECT.
    pub fn drop_connections(&self) {
        let sessions = self.shared.sessions.lock().unwrap();
        for session in sessions.iter() {
            let _ = session.writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    /// Writes `bytes` as-is to every live client socket.
    pub fn send_raw(&self, bytes: &[u8]) {
        let sessions = self.shared.sessions.lock().unwrap();
        for session in sessions.iter() {
            let mut stream = session.writer.lock().unwrap();
            let _ = stream.write_all(bytes).and_then(|_| stream.flush());
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.shared
            .sessions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.client_id == client_id)
    }
}

fn write_packet(writer: &Mutex<TcpStream>, packet: &MqttPacket, version: u8) -> bool {
    let Ok(bytes) = packet.to_bytes(version) else {
        return false;
    };
    let mut stream = writer.lock().unwrap();
    stream.write_all(&bytes).and_then(|_| stream.flush()).is_ok()
}

fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let conn_id = shared.next_conn.fetch_add(1, Ordering::SeqCst);
    let writer = Arc::new(Mutex::new(stream.try_clone().unwrap()));
    let mut packets = MqttStream::new(stream, 4096, shared.version);
    let mut client_id = String::new();

    while let Ok(Some((packet, _))) = packets.read_packet() {
        let reply = match &packet {
            MqttPacket::Connect(connect) => {
                client_id = connect.client_id.clone();
                shared.connects.fetch_add(1, Ordering::SeqCst);
                let code = shared.connack_code.load(Ordering::SeqCst);
                if code == 0 {
                    shared.sessions.lock().unwrap().push(Session {
                        conn_id,
                        client_id: client_id.clone(),
                        writer: Arc::clone(&writer),
                        subscriptions: Vec::new(),
                    });
                }
                Some(MqttPacket::ConnAck(MqttConnAck::new(false, code)))
            }
            MqttPacket::Publish(publish) => {
                route(&shared, publish);
                let id = publish.packet_id.unwrap_or(0);
                match publish.qos {
                    _ if !shared.ack_publishes.load(Ordering::SeqCst) => None,
                    1 => Some(MqttPacket::PubAck(MqttPubResponse::new(id, 0))),
                    2 => Some(MqttPacket::PubRec(MqttPubResponse::new(id, 0))),
                    _ => None,
                }
            }
            MqttPacket::PubRel(rel) => Some(MqttPacket::PubComp(MqttPubResponse::new(
                rel.packet_id,
                0,
            ))),
            MqttPacket::PubRec(rec) => Some(MqttPacket::PubRel(MqttPubResponse::new(
                rec.packet_id,
                0,
            ))),
            MqttPacket::Subscribe(subscribe) => {
                let mut sessions = shared.sessions.lock().unwrap();
                if let Some(session) = sessions.iter_mut().find(|s| s.conn_id == conn_id) {
                    for sub in &subscribe.subscriptions {
                        session
                            .subscriptions
                            .retain(|(f, _)| f != &sub.topic_filter);
                        session
                            .subscriptions
                            .push((sub.topic_filter.clone(), sub.qos));
                    }
                }
                Some(MqttPacket::SubAck(MqttSubAck {
                    packet_id: subscribe.packet_id,
                    reason_codes: subscribe.subscriptions.iter().map(|s| s.qos).collect(),
                    properties: Vec::new(),
                }))
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                let mut sessions = shared.sessions.lock().unwrap();
                if let Some(session) = sessions.iter_mut().find(|s| s.conn_id == conn_id) {
                    session
                        .subscriptions
                        .retain(|(f, _)| !unsubscribe.topic_filters.contains(f));
                }
                let reason_codes = if shared.version == 5 {
                    vec![0; unsubscribe.topic_filters.len()]
                } else {
                    Vec::new()
                };
                Some(MqttPacket::UnsubAck(MqttUnsubAck {
                    packet_id: unsubscribe.packet_id,
                    reason_codes,
                    properties: Vec::new(),
                }))
            }
            MqttPacket::PingReq => Some(MqttPacket::PingResp),
            _ => None,
        };
        let done = matches!(packet, MqttPacket::Disconnect(_));
        shared
            .received
            .lock()
            .unwrap()
            .push((client_id.clone(), packet));
        if shared.silent.load(Ordering::SeqCst) {
            continue;
        }
        if let Some(reply) = reply {
            if !write_packet(&writer, &reply, shared.version) {
                break;
            }
        }
        if done {
            break;
        }
    }

    shared
        .sessions
        .lock()
        .unwrap()
        .retain(|s| s.conn_id != conn_id);
    let _ = writer.lock().unwrap().shutdown(Shutdown::Both);
}

fn route(shared: &Shared, publish: &MqttPublish) {
    let targets: Vec<(Arc<Mutex<TcpStream>>, u8)> = shared
        .sessions
        .lock()
        .unwrap()
        .iter()
        .filter_map(|s| {
            s.subscriptions
                .iter()
                .filter(|(f, _)| topic_matches(f, &publish.topic_name))
                .map(|(_, q)| *q)
                .max()
                .map(|q| (Arc::clone(&s.writer), q.min(publish.qos)))
        })
        .collect();

    for (writer, qos) in targets {
        let mut out = MqttPublish::new(qos, publish.topic_name.clone(), publish.payload.clone());
        if qos > 0 {
            let mut next = shared.next_packet_id.lock().unwrap();
            *next = next.checked_add(1).unwrap_or(1);
            out.packet_id = Some(*next);
        }
        write_packet(&writer, &MqttPacket::Publish(out), shared.version);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Options tuned for fast tests.
pub fn options(client_id: &str) -> flowlink::mqtt_client::opts::MqttClientOptionsBuilder {
    MqttClientOptions::builder()
        .client_id(client_id)
        .connection_timeout_ms(5_000)
        .reconnect_delay_ms(50, 200)
}

/// Records every callback. Optionally fails each arrived message after a
/// pause, like an application that cannot keep up, or refuses only the
/// first one.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<MqttMessage>>,
    pub lost: Mutex<Vec<MqttClientError>>,
    pub connects: Mutex<Vec<bool>>,
    pub delivered: AtomicUsize,
    pub discarded: Mutex<Vec<MqttMessage>>,
    fail_after: Option<Duration>,
    reject_first: AtomicBool,
}

impl Recorder {
    pub fn failing(after: Duration) -> Self {
        Recorder {
            fail_after: Some(after),
            ..Default::default()
        }
    }

    pub fn rejecting_first() -> Self {
        Recorder {
            reject_first: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<MqttMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<MqttClientError> {
        self.lost.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<bool> {
        self.connects.lock().unwrap().clone()
    }
}

impl MqttCallback for Recorder {
    fn connection_lost(&self, cause: &MqttClientError) {
        self.lost.lock().unwrap().push(cause.clone());
    }

    fn message_arrived(&self, _topic: &str, message: &MqttMessage) -> Result<(), CallbackError> {
        if let Some(pause) = self.fail_after {
            thread::sleep(pause);
            return Err("application cannot keep up".into());
        }
        if self.reject_first.swap(false, Ordering::SeqCst) {
            return Err("application not ready".into());
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn delivery_complete(&self, _token: &MqttToken) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn connect_complete(&self, reconnect: bool, _server_uri: &str) {
        self.connects.lock().unwrap().push(reconnect);
    }

    fn message_discarded(&self, message: &MqttMessage) {
        self.discarded.lock().unwrap().push(message.clone());
    }
}
