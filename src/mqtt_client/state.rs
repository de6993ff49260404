// SPDX-License-Identifier: MPL-2.0

//! Session state engine.
//!
//! Owns everything that has to be consistent across the sender, receiver and
//! callback threads: packet identifier allocation, the outbound QoS 0/1/2
//! tables, the inbound QoS 2 table, the pending flow/message queues, the
//! in-flight window and the keep-alive bookkeeping. Everything that must
//! survive a restart is mirrored into the persistence store in encoded form.
//!
//! Locks, always taken in this order when nested:
//! queue lock, then the token store's lock. The ping lock and the quiesce
//! lock are never held together with the queue lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::callback::{CallbackDispatcher, Delivery};
use super::dialect::ProtocolDialect;
use super::error::{MqttClientError, MqttClientResult};
use super::lock;
use super::persistence::{
    received_key, sent_key, sent_pubrel_key, MqttClientPersistence, PersistedKey,
};
use super::token::MqttToken;
use super::token_store::{TokenStore, CONNECT_KEY, PING_KEY};
use crate::mqtt_serde::connect::MqttConnAck;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{ParseError, ParseOk};
use crate::mqtt_serde::properties::reason_string;
use crate::mqtt_serde::publish::{MqttPubResponse, MqttPublish};

pub const MIN_MSG_ID: u16 = 1;
pub const MAX_MSG_ID: u16 = u16::MAX;

/// Slack applied to keep-alive comparisons so a timer firing slightly early
/// still sends the ping.
pub const KEEP_ALIVE_TOLERANCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Disconnected,
    Connecting,
    Connected,
}

/// Something the receiver has to act on after the engine processed a packet.
#[derive(Debug)]
pub enum StateEvent {
    None,
    Connected {
        connack: MqttConnAck,
        token: MqttToken,
    },
    ConnectFailed {
        error: MqttClientError,
        token: MqttToken,
    },
    ServerDisconnect(MqttClientError),
}

struct SessionQueues {
    pending_flows: VecDeque<MqttPacket>,
    pending_messages: VecDeque<MqttPacket>,
    // PUBLISH awaiting PUBREC, or PUBREL awaiting PUBCOMP
    outbound_qos2: HashMap<u16, MqttPacket>,
    outbound_qos1: HashMap<u16, MqttPublish>,
    outbound_qos0: HashMap<u16, MqttPublish>,
    inbound_qos2: HashMap<u16, InboundQos2>,
    in_use_ids: HashSet<u16>,
    next_msg_id: u16,
    actual_in_flight: usize,
    in_flight_pubrels: usize,
    max_inflight: usize,
    connection: Connection,
    clean_start: bool,
    quiescing: bool,
}

impl SessionQueues {
    /// Scans forward from the last allocated id, wrapping at 65535. Gives up
    /// after two full passes.
    fn next_message_id(&mut self) -> MqttClientResult<u16> {
        for _ in 0..2 * MAX_MSG_ID as usize {
            self.next_msg_id = if self.next_msg_id >= MAX_MSG_ID {
                MIN_MSG_ID
            } else {
                self.next_msg_id + 1
            };
            if self.in_use_ids.insert(self.next_msg_id) {
                return Ok(self.next_msg_id);
            }
        }
        Err(MqttClientError::PacketIdExhausted)
    }

    fn release_message_id(&mut self, id: u16) {
        self.in_use_ids.remove(&id);
    }

    fn decrement_in_flight(&mut self) {
        self.actual_in_flight = self.actual_in_flight.saturating_sub(1);
    }
}

/// A QoS 2 message received from the server. PUBCOMP is only sent once the
/// application has consumed it.
struct InboundQos2 {
    publish: MqttPublish,
    consumed: bool,
    released: bool,
}

impl InboundQos2 {
    fn new(publish: MqttPublish, consumed: bool) -> Self {
        InboundQos2 {
            publish,
            consumed,
            released: false,
        }
    }
}

struct PingState {
    keep_alive: Duration,
    outstanding: u32,
    last_outbound: Instant,
    last_inbound: Instant,
    last_ping: Instant,
}

pub struct ClientState {
    client_id: String,
    dialect: Arc<dyn ProtocolDialect>,
    persistence: Arc<dyn MqttClientPersistence>,
    token_store: Arc<TokenStore>,
    callback: Arc<CallbackDispatcher>,
    queue: Mutex<SessionQueues>,
    queue_cond: Condvar,
    quiesce_lock: Mutex<()>,
    quiesce_cond: Condvar,
    ping: Mutex<PingState>,
    configured_max_inflight: usize,
}

impl ClientState {
    /// Builds the engine and rebuilds its tables from `persistence`, which
    /// must already be open.
    pub fn new(
        client_id: &str,
        dialect: Arc<dyn ProtocolDialect>,
        persistence: Arc<dyn MqttClientPersistence>,
        token_store: Arc<TokenStore>,
        callback: Arc<CallbackDispatcher>,
        max_inflight: usize,
    ) -> MqttClientResult<Self> {
        let now = Instant::now();
        let state = ClientState {
            client_id: client_id.to_string(),
            dialect,
            persistence,
            token_store,
            callback,
            queue: Mutex::new(SessionQueues {
                pending_flows: VecDeque::new(),
                pending_messages: VecDeque::new(),
                outbound_qos2: HashMap::new(),
                outbound_qos1: HashMap::new(),
                outbound_qos0: HashMap::new(),
                inbound_qos2: HashMap::new(),
                in_use_ids: HashSet::new(),
                next_msg_id: 0,
                actual_in_flight: 0,
                in_flight_pubrels: 0,
                max_inflight: max_inflight.max(1),
                connection: Connection::Disconnected,
                clean_start: true,
                quiescing: false,
            }),
            queue_cond: Condvar::new(),
            quiesce_lock: Mutex::new(()),
            quiesce_cond: Condvar::new(),
            ping: Mutex::new(PingState {
                keep_alive: Duration::ZERO,
                outstanding: 0,
                last_outbound: now,
                last_inbound: now,
                last_ping: now,
            }),
            configured_max_inflight: max_inflight.max(1),
        };
        state.restore_state()?;
        Ok(state)
    }

    fn queues(&self) -> MutexGuard<'_, SessionQueues> {
        lock(&self.queue)
    }

    fn persist(&self, key: &str, packet: &MqttPacket) -> MqttClientResult<()> {
        let bytes = packet.to_bytes(self.dialect.version())?;
        self.persistence.put(key, &bytes)?;
        trace!(client_id = %self.client_id, key, "persisted");
        Ok(())
    }

    /// Loads and decodes one record. A record that does not decode is
    /// removed and reported as absent; any store error propagates.
    fn restore_message(&self, key: &str) -> MqttClientResult<Option<MqttPacket>> {
        let bytes = match self.persistence.get(key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match MqttPacket::from_bytes_with_version(&bytes, self.dialect.version()) {
            Ok(ParseOk::Packet(packet, _)) => Ok(Some(packet)),
            Ok(ParseOk::Continue(..)) | Err(ParseError::More(..)) => {
                self.discard_corrupt(key, "truncated record")
            }
            Err(ParseError::IoError(e)) => Err(e.into()),
            Err(e) => self.discard_corrupt(key, &e.to_string()),
        }
    }

    fn discard_corrupt(&self, key: &str, reason: &str) -> MqttClientResult<Option<MqttPacket>> {
        warn!(client_id = %self.client_id, key, reason, "discarding corrupt persisted record");
        self.persistence.remove(key)?;
        Ok(None)
    }

    /// Rebuilds the outbound and inbound tables and the id pool from the
    /// persistence store. Runs once, when the client is created.
    pub fn restore_state(&self) -> MqttClientResult<()> {
        let keys = self.persistence.keys()?;
        let mut q = self.queues();
        let mut highest = q.next_msg_id;
        let mut orphaned_pubrels = Vec::new();

        for key in keys {
            let parsed = match PersistedKey::parse(&key) {
                Some(parsed) => parsed,
                None => {
                    debug!(client_id = %self.client_id, key = %key, "ignoring unknown persistence key");
                    continue;
                }
            };
            match parsed {
                // owned by the offline buffer
                PersistedKey::Buffered(_) => {}
                PersistedKey::Received(id) => match self.restore_message(&key)? {
                    // delivered before the restart; PUBREL completes it
                    Some(MqttPacket::Publish(publish)) => {
                        q.inbound_qos2.insert(id, InboundQos2::new(publish, true));
                    }
                    Some(other) => {
                        self.discard_corrupt(&key, other.name())?;
                    }
                    None => {}
                },
                PersistedKey::Sent(id) => match self.restore_message(&key)? {
                    Some(MqttPacket::Publish(mut publish)) => {
                        highest = highest.max(id);
                        let rel_key = sent_pubrel_key(id);
                        let pubrel = if self.persistence.contains_key(&rel_key)? {
                            self.restore_message(&rel_key)?
                        } else {
                            None
                        };
                        match pubrel {
                            Some(rel @ MqttPacket::PubRel(_)) => {
                                q.outbound_qos2.insert(id, rel);
                            }
                            _ => {
                                publish.dup = true;
                                if publish.qos == 2 {
                                    q.outbound_qos2
                                        .insert(id, MqttPacket::Publish(publish.clone()));
                                } else {
                                    q.outbound_qos1.insert(id, publish.clone());
                                }
                            }
                        }
                        self.token_store.restore_token(&publish);
                        q.in_use_ids.insert(id);
                    }
                    Some(other) => {
                        self.discard_corrupt(&key, other.name())?;
                    }
                    None => {}
                },
                PersistedKey::SentPubRel(id) => {
                    if !self.persistence.contains_key(&sent_key(id))? {
                        orphaned_pubrels.push(key);
                    }
                }
            }
        }

        for key in orphaned_pubrels {
            debug!(client_id = %self.client_id, key = %key, "removing orphaned PUBREL record");
            self.persistence.remove(&key)?;
        }
        q.next_msg_id = highest;
        debug!(
            client_id = %self.client_id,
            qos1 = q.outbound_qos1.len(),
            qos2 = q.outbound_qos2.len(),
            inbound = q.inbound_qos2.len(),
            "session state restored"
        );
        Ok(())
    }

    /// Queues every unacknowledged outbound packet for resending, in the
    /// order it was most likely first sent. Resent PUBLISH packets carry the
    /// duplicate flag; PUBREL never does.
    fn restore_inflight_messages(&self, q: &mut SessionQueues) {
        let mut flows = Vec::new();
        let mut messages = Vec::new();
        for (id, packet) in &q.outbound_qos2 {
            match packet {
                MqttPacket::Publish(publish) => {
                    let mut publish = publish.clone();
                    publish.dup = true;
                    messages.push((*id, MqttPacket::Publish(publish)));
                }
                other => flows.push((*id, other.clone())),
            }
        }
        for (id, publish) in &q.outbound_qos1 {
            let mut publish = publish.clone();
            publish.dup = true;
            messages.push((*id, MqttPacket::Publish(publish)));
        }
        for (id, publish) in &q.outbound_qos0 {
            messages.push((*id, MqttPacket::Publish(publish.clone())));
        }
        q.pending_flows = reorder_by_gap(flows);
        q.pending_messages = reorder_by_gap(messages);
        debug!(
            client_id = %self.client_id,
            flows = q.pending_flows.len(),
            messages = q.pending_messages.len(),
            "in-flight messages queued for resend"
        );
    }

    /// Drops all session state, in memory and in the store. Buffered offline
    /// messages are kept.
    fn clear_state(&self, q: &mut SessionQueues) -> MqttClientResult<()> {
        debug!(client_id = %self.client_id, "clearing session state");
        for key in self.persistence.keys()? {
            if matches!(
                PersistedKey::parse(&key),
                Some(
                    PersistedKey::Sent(_)
                        | PersistedKey::SentPubRel(_)
                        | PersistedKey::Received(_)
                )
            ) {
                self.persistence.remove(&key)?;
            }
        }
        q.in_use_ids.clear();
        q.pending_flows.clear();
        q.pending_messages.clear();
        q.outbound_qos2.clear();
        q.outbound_qos1.clear();
        q.outbound_qos0.clear();
        q.inbound_qos2.clear();
        self.token_store.clear();
        Ok(())
    }

    /// Prepares for a new connection attempt.
    pub fn connecting(&self, clean_start: bool, keep_alive: Duration) {
        {
            let mut q = self.queues();
            q.connection = Connection::Connecting;
            q.clean_start = clean_start;
            q.quiescing = false;
        }
        let now = Instant::now();
        let mut ping = lock(&self.ping);
        ping.keep_alive = keep_alive;
        ping.outstanding = 0;
        ping.last_inbound = now;
        ping.last_outbound = now;
        ping.last_ping = now;
    }

    /// Queues an outbound packet. Allocates a packet id when one is needed,
    /// records publishes and PUBRELs in their tables and persists them.
    pub fn send(&self, packet: MqttPacket, token: Option<MqttToken>) -> MqttClientResult<()> {
        let mut packet = packet;
        let mut q = self.queues();
        if matches!(packet, MqttPacket::Publish(_)) && q.actual_in_flight >= q.max_inflight {
            return Err(MqttClientError::MaxInflight {
                limit: q.max_inflight,
            });
        }

        let mut allocated = None;
        if packet.needs_packet_id() && packet.packet_id().unwrap_or(0) == 0 {
            let id = q.next_message_id()?;
            packet.set_packet_id(id);
            allocated = Some(id);
        }

        if let Some(token) = &token {
            // a PUBREL reuses the delivery token of its PUBLISH
            if !matches!(packet, MqttPacket::PubRel(_)) {
                token.set_message(packet.clone());
            }
            if let Err(e) = self.token_store.save_for_packet(token, &packet) {
                if let Some(id) = allocated {
                    q.release_message_id(id);
                }
                return Err(e);
            }
        }

        if let Err(e) = self.enqueue(&mut q, packet.clone()) {
            if let Some(id) = allocated {
                q.release_message_id(id);
                if token.is_some() {
                    self.token_store.remove_token(&id.to_string());
                }
            }
            return Err(e);
        }
        drop(q);
        trace!(client_id = %self.client_id, packet = packet.name(), id = ?packet.packet_id(), "queued");
        self.queue_cond.notify_all();
        Ok(())
    }

    fn enqueue(&self, q: &mut SessionQueues, packet: MqttPacket) -> MqttClientResult<()> {
        match &packet {
            MqttPacket::Publish(publish) => {
                let id = publish.packet_id.unwrap_or_default();
                match publish.qos {
                    0 => {
                        q.outbound_qos0.insert(id, publish.clone());
                    }
                    1 => {
                        self.persist(&sent_key(id), &packet)?;
                        q.outbound_qos1.insert(id, publish.clone());
                    }
                    _ => {
                        self.persist(&sent_key(id), &packet)?;
                        q.outbound_qos2.insert(id, packet.clone());
                    }
                }
                q.pending_messages.push_back(packet);
            }
            MqttPacket::Connect(_) => q.pending_flows.push_front(packet),
            MqttPacket::PubRel(rel) => {
                self.persist(&sent_pubrel_key(rel.packet_id), &packet)?;
                q.outbound_qos2.insert(rel.packet_id, packet.clone());
                q.pending_flows.push_back(packet);
            }
            _ => q.pending_flows.push_back(packet),
        }
        Ok(())
    }

    /// Queues a control packet that is not tracked in any table.
    fn send_flow(&self, packet: MqttPacket) {
        self.queues().pending_flows.push_back(packet);
        self.queue_cond.notify_all();
    }

    /// Next packet for the sender. Blocks until there is work; returns `None`
    /// once the client is disconnected, which stops the sender.
    pub fn get(&self) -> Option<MqttPacket> {
        let mut q = self.queues();
        loop {
            let connect_first = matches!(q.pending_flows.front(), Some(MqttPacket::Connect(_)));
            if q.connection == Connection::Disconnected && !connect_first {
                return None;
            }
            let connected = q.connection == Connection::Connected;

            if connect_first || (connected && !q.pending_flows.is_empty()) {
                if let Some(packet) = q.pending_flows.pop_front() {
                    if matches!(packet, MqttPacket::PubRel(_)) {
                        q.in_flight_pubrels += 1;
                    }
                    drop(q);
                    self.check_quiesce_lock();
                    return Some(packet);
                }
            }
            if connected && !q.pending_messages.is_empty() && q.actual_in_flight < q.max_inflight {
                if let Some(packet) = q.pending_messages.pop_front() {
                    q.actual_in_flight += 1;
                    return Some(packet);
                }
            }
            q = self
                .queue_cond
                .wait(q)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Whether the sender has to go through a token for this packet.
    fn owns_token(packet: &MqttPacket) -> bool {
        matches!(
            packet,
            MqttPacket::Connect(_)
                | MqttPacket::Publish(_)
                | MqttPacket::PubRel(_)
                | MqttPacket::Subscribe(_)
                | MqttPacket::Unsubscribe(_)
                | MqttPacket::PingReq
                | MqttPacket::Disconnect(_)
        )
    }

    pub fn token_for_outbound(&self, packet: &MqttPacket) -> Option<MqttToken> {
        if Self::owns_token(packet) {
            self.token_store.get_for_packet(packet)
        } else {
            None
        }
    }

    /// Called by the sender after `packet` was written.
    pub fn notify_sent(&self, packet: &MqttPacket) {
        let now = Instant::now();
        {
            let mut ping = lock(&self.ping);
            ping.last_outbound = now;
            if matches!(packet, MqttPacket::PingReq) {
                ping.outstanding += 1;
                ping.last_ping = now;
            }
        }

        match packet {
            MqttPacket::Publish(publish) if publish.qos == 0 => {
                let id = publish.packet_id.unwrap_or_default();
                {
                    let mut q = self.queues();
                    if q.outbound_qos0.remove(&id).is_some() {
                        q.release_message_id(id);
                        q.decrement_in_flight();
                    }
                }
                self.queue_cond.notify_all();
                if let Some(token) = self.token_store.remove_token(&id.to_string()) {
                    token.mark_sent();
                    token.mark_complete(None, None);
                    self.callback.async_operation_complete(token);
                }
                self.check_quiesce_lock();
            }
            other => {
                if let Some(token) = self.token_for_outbound(other) {
                    token.mark_sent();
                }
            }
        }
    }

    pub fn notify_received_bytes(&self) {
        lock(&self.ping).last_inbound = Instant::now();
    }

    /// Applies an acknowledgement read by the receiver.
    pub fn notify_received_ack(&self, ack: &MqttPacket) -> MqttClientResult<StateEvent> {
        self.notify_received_bytes();
        match ack {
            MqttPacket::PubRec(rec) => {
                self.received_pubrec(ack, rec)?;
                Ok(StateEvent::None)
            }
            MqttPacket::PubAck(resp) => {
                self.complete_publish(ack, resp, false)?;
                Ok(StateEvent::None)
            }
            MqttPacket::PubComp(resp) => {
                self.complete_publish(ack, resp, true)?;
                Ok(StateEvent::None)
            }
            MqttPacket::SubAck(suback) => {
                let failed = !suback.reason_codes.is_empty()
                    && suback.reason_codes.iter().all(|c| *c >= 0x80);
                self.complete_subscription(ack, suback.packet_id, failed, &suback.reason_codes)?;
                Ok(StateEvent::None)
            }
            MqttPacket::UnsubAck(unsuback) => {
                let failed = !unsuback.reason_codes.is_empty()
                    && unsuback.reason_codes.iter().all(|c| *c >= 0x80);
                self.complete_subscription(
                    ack,
                    unsuback.packet_id,
                    failed,
                    &unsuback.reason_codes,
                )?;
                Ok(StateEvent::None)
            }
            MqttPacket::ConnAck(connack) => self.received_connack(connack),
            MqttPacket::PingResp => {
                let done = {
                    let mut ping = lock(&self.ping);
                    ping.outstanding = ping.outstanding.saturating_sub(1);
                    ping.outstanding == 0
                };
                if done {
                    if let Some(token) = self.token_store.remove_token(PING_KEY) {
                        token.mark_complete(Some(MqttPacket::PingResp), None);
                        self.callback.async_operation_complete(token);
                    }
                }
                self.check_quiesce_lock();
                Ok(StateEvent::None)
            }
            other => Err(MqttClientError::ProtocolViolation {
                message: format!("{} is not an acknowledgement", other.name()),
            }),
        }
    }

    fn received_pubrec(&self, ack: &MqttPacket, rec: &MqttPubResponse) -> MqttClientResult<()> {
        let id = rec.packet_id;
        let token = self.token_store.get_token(&id.to_string());
        let (awaiting, released) = {
            let mut q = self.queues();
            let awaiting = matches!(q.outbound_qos2.get(&id), Some(MqttPacket::Publish(_)));
            let released = matches!(q.outbound_qos2.get(&id), Some(MqttPacket::PubRel(_)));
            if released {
                // the resend takes the place of the PUBREL already counted
                q.in_flight_pubrels = q.in_flight_pubrels.saturating_sub(1);
                q.pending_flows
                    .push_back(MqttPacket::PubRel(MqttPubResponse::new(id, 0)));
            }
            (awaiting, released)
        };

        if released {
            debug!(client_id = %self.client_id, packet_id = id, "duplicate PUBREC, PUBREL resent");
            self.queue_cond.notify_all();
            return Ok(());
        }
        if !awaiting {
            match self.dialect.orphaned_pubrec_reply(id) {
                Some(reply) => {
                    warn!(client_id = %self.client_id, packet_id = id, "PUBREC for unknown packet id, answering with error PUBREL");
                    self.send_flow(reply);
                }
                None => {
                    debug!(client_id = %self.client_id, packet_id = id, "ignoring PUBREC for unknown packet id");
                }
            }
            return Ok(());
        }

        if let Some(error) = self.dialect.ack_failure(rec) {
            // the flow ends here, no PUBREL
            {
                let mut q = self.queues();
                q.outbound_qos2.remove(&id);
                q.release_message_id(id);
                q.decrement_in_flight();
            }
            self.queue_cond.notify_all();
            self.persistence.remove(&sent_key(id))?;
            if let Some(token) = self.token_store.remove_token(&id.to_string()) {
                token.mark_complete(Some(ack.clone()), Some(error));
                self.callback.async_operation_complete(token);
            }
            self.check_quiesce_lock();
            return Ok(());
        }

        self.send(MqttPacket::PubRel(MqttPubResponse::new(id, 0)), token)
    }

    fn complete_publish(
        &self,
        ack: &MqttPacket,
        resp: &MqttPubResponse,
        pubcomp: bool,
    ) -> MqttClientResult<()> {
        let id = resp.packet_id;
        let removed = {
            let mut q = self.queues();
            let removed = if pubcomp {
                q.outbound_qos2.remove(&id).is_some()
            } else {
                q.outbound_qos1.remove(&id).is_some()
            };
            if removed {
                q.release_message_id(id);
                q.decrement_in_flight();
                if pubcomp {
                    q.in_flight_pubrels = q.in_flight_pubrels.saturating_sub(1);
                }
            }
            removed
        };
        if !removed {
            debug!(client_id = %self.client_id, packet_id = id, ack = ack.name(), "ignoring acknowledgement for unknown packet id");
            return Ok(());
        }
        self.queue_cond.notify_all();

        self.persistence.remove(&sent_key(id))?;
        if pubcomp {
            self.persistence.remove(&sent_pubrel_key(id))?;
        }
        if let Some(token) = self.token_store.remove_token(&id.to_string()) {
            token.mark_complete(Some(ack.clone()), self.dialect.ack_failure(resp));
            self.callback.async_operation_complete(token);
        }
        debug!(client_id = %self.client_id, packet_id = id, ack = ack.name(), "publish flow complete");
        self.check_quiesce_lock();
        Ok(())
    }

    fn complete_subscription(
        &self,
        ack: &MqttPacket,
        id: u16,
        failed: bool,
        reason_codes: &[u8],
    ) -> MqttClientResult<()> {
        let token = self
            .token_store
            .remove_token(&id.to_string())
            .ok_or_else(|| MqttClientError::ProtocolViolation {
                message: format!("{} for unknown packet id {}", ack.name(), id),
            })?;
        self.queues().release_message_id(id);

        let error = failed.then(|| match token.message() {
            Some(MqttPacket::Unsubscribe(unsub)) => MqttClientError::UnsubscribeFailed {
                topics: unsub.topic_filters,
                reason_codes: reason_codes.to_vec(),
            },
            Some(MqttPacket::Subscribe(sub)) => MqttClientError::SubscribeFailed {
                topics: sub
                    .subscriptions
                    .into_iter()
                    .map(|s| s.topic_filter)
                    .collect(),
                reason_codes: reason_codes.to_vec(),
            },
            _ => MqttClientError::SubscribeFailed {
                topics: Vec::new(),
                reason_codes: reason_codes.to_vec(),
            },
        });
        token.mark_complete(Some(ack.clone()), error);
        self.callback.async_operation_complete(token);
        self.check_quiesce_lock();
        Ok(())
    }

    fn received_connack(&self, connack: &MqttConnAck) -> MqttClientResult<StateEvent> {
        let token = self.token_store.remove_token(CONNECT_KEY).ok_or_else(|| {
            MqttClientError::ProtocolViolation {
                message: "CONNACK without a pending CONNECT".to_string(),
            }
        })?;
        if !connack.is_success() {
            return Ok(StateEvent::ConnectFailed {
                error: MqttClientError::connection_refused(connack.reason_code),
                token,
            });
        }

        let undelivered = {
            let mut q = self.queues();
            if q.clean_start {
                self.clear_state(&mut q)?;
            }
            q.in_flight_pubrels = 0;
            q.actual_in_flight = 0;
            q.max_inflight = match self.dialect.receive_maximum(connack) {
                Some(limit) => self.configured_max_inflight.min(limit.max(1) as usize),
                None => self.configured_max_inflight,
            };
            self.restore_inflight_messages(&mut q);
            q.connection = Connection::Connected;
            // the server resends PUBREL for every flow it has not completed
            for inbound in q.inbound_qos2.values_mut() {
                inbound.released = false;
            }
            // acknowledged with PUBREC but dropped before the application saw it
            let mut undelivered: Vec<(u16, MqttPublish)> = q
                .inbound_qos2
                .iter()
                .filter(|(_, inbound)| !inbound.consumed)
                .map(|(id, inbound)| (*id, inbound.publish.clone()))
                .collect();
            undelivered.sort_by_key(|(id, _)| *id);
            undelivered
        };
        self.queue_cond.notify_all();
        for (id, publish) in undelivered {
            debug!(client_id = %self.client_id, packet_id = id, "redelivering QoS 2 message");
            if let Err(e) = self.deliver(publish) {
                warn!(client_id = %self.client_id, packet_id = id, error = %e, "QoS 2 redelivery failed");
            }
        }
        Ok(StateEvent::Connected {
            connack: connack.clone(),
            token,
        })
    }

    /// Applies a non-acknowledgement packet read by the receiver.
    pub fn notify_received_msg(&self, packet: MqttPacket) -> MqttClientResult<StateEvent> {
        self.notify_received_bytes();
        if self.queues().quiescing {
            debug!(client_id = %self.client_id, packet = packet.name(), "quiescing, inbound packet ignored");
            return Ok(StateEvent::None);
        }

        match packet {
            MqttPacket::Publish(publish) => {
                match publish.qos {
                    0 | 1 => self.deliver(publish)?,
                    _ => self.received_qos2_publish(publish)?,
                }
                Ok(StateEvent::None)
            }
            MqttPacket::PubRel(rel) => {
                self.received_pubrel(rel.packet_id)?;
                Ok(StateEvent::None)
            }
            MqttPacket::Disconnect(disconnect) => {
                Ok(StateEvent::ServerDisconnect(MqttClientError::ServerDisconnected {
                    reason_code: disconnect.reason_code,
                    reason_string: reason_string(&disconnect.properties).map(str::to_string),
                }))
            }
            other => Err(MqttClientError::ProtocolViolation {
                message: format!("unexpected {} from server", other.name()),
            }),
        }
    }

    fn received_qos2_publish(&self, publish: MqttPublish) -> MqttClientResult<()> {
        let id = publish
            .packet_id
            .ok_or_else(|| MqttClientError::ProtocolViolation {
                message: "QoS 2 PUBLISH without packet id".to_string(),
            })?;
        if self.queues().inbound_qos2.contains_key(&id) {
            debug!(client_id = %self.client_id, packet_id = id, "duplicate QoS 2 PUBLISH, not redelivered");
            return self.send(MqttPacket::PubRec(MqttPubResponse::new(id, 0)), None);
        }

        self.persist(&received_key(id), &MqttPacket::Publish(publish.clone()))?;
        self.queues()
            .inbound_qos2
            .insert(id, InboundQos2::new(publish.clone(), false));
        match self.callback.message_arrived(publish.clone()) {
            Delivery::Queued => {}
            Delivery::NoConsumer => self.message_delivered(&publish)?,
            Delivery::Dropped => {
                // no PUBREC, so the server still owns the message
                self.queues().inbound_qos2.remove(&id);
                self.persistence.remove(&received_key(id))?;
                debug!(client_id = %self.client_id, packet_id = id, "QoS 2 PUBLISH not taken, PUBREC withheld");
                return Ok(());
            }
        }
        self.send(MqttPacket::PubRec(MqttPubResponse::new(id, 0)), None)
    }

    fn received_pubrel(&self, id: u16) -> MqttClientResult<()> {
        let complete = {
            let mut q = self.queues();
            let consumed = q.inbound_qos2.get_mut(&id).map(|inbound| {
                inbound.released = !inbound.consumed;
                inbound.consumed
            });
            if consumed == Some(true) {
                q.inbound_qos2.remove(&id);
            }
            consumed
        };
        match complete {
            Some(true) => {
                self.persistence.remove(&received_key(id))?;
                self.send(MqttPacket::PubComp(MqttPubResponse::new(id, 0)), None)
            }
            Some(false) => {
                debug!(client_id = %self.client_id, packet_id = id, "PUBREL before the message was consumed, PUBCOMP held");
                Ok(())
            }
            None => {
                debug!(client_id = %self.client_id, packet_id = id, "PUBREL for unknown packet id");
                self.persistence.remove(&received_key(id))?;
                self.send(self.dialect.orphaned_pubrel_reply(id), None)
            }
        }
    }

    fn deliver(&self, publish: MqttPublish) -> MqttClientResult<()> {
        match self.callback.message_arrived(publish.clone()) {
            Delivery::NoConsumer => self.message_delivered(&publish),
            Delivery::Queued | Delivery::Dropped => Ok(()),
        }
    }

    /// The application finished with an inbound message. Sends the PUBACK
    /// for QoS 1, and for QoS 2 the PUBCOMP if the PUBREL already arrived.
    pub fn message_delivered(&self, publish: &MqttPublish) -> MqttClientResult<()> {
        let Some(id) = publish.packet_id else {
            return Ok(());
        };
        match publish.qos {
            1 => {
                if self.queues().connection != Connection::Connected {
                    debug!(client_id = %self.client_id, packet_id = id, "not connected, PUBACK skipped");
                    return Ok(());
                }
                self.send(MqttPacket::PubAck(MqttPubResponse::new(id, 0)), None)
            }
            2 => {
                let release = {
                    let mut q = self.queues();
                    let connected = q.connection == Connection::Connected;
                    let release = q.inbound_qos2.get_mut(&id).is_some_and(|inbound| {
                        inbound.consumed = true;
                        let release = inbound.released && connected;
                        inbound.released = false;
                        release
                    });
                    if release {
                        q.inbound_qos2.remove(&id);
                    }
                    release
                };
                if !release {
                    return Ok(());
                }
                self.persistence.remove(&received_key(id))?;
                self.send(MqttPacket::PubComp(MqttPubResponse::new(id, 0)), None)
            }
            _ => Ok(()),
        }
    }

    /// Keep-alive check, run by the ping timer. Returns the ping token if a
    /// PINGREQ was queued, and the delay until the next check.
    pub fn check_for_activity(&self) -> MqttClientResult<(Option<MqttToken>, Duration)> {
        let (connected, quiescing) = {
            let q = self.queues();
            (q.connection == Connection::Connected, q.quiescing)
        };
        let now = Instant::now();
        let ping = lock(&self.ping);
        let keep_alive = ping.keep_alive;
        if !connected || quiescing || keep_alive.is_zero() {
            return Ok((None, keep_alive));
        }

        let since_inbound = now.saturating_duration_since(ping.last_inbound);
        let since_outbound = now.saturating_duration_since(ping.last_outbound);

        if ping.outstanding > 0 && since_inbound >= keep_alive + KEEP_ALIVE_TOLERANCE {
            warn!(
                client_id = %self.client_id,
                since_ping_ms = now.saturating_duration_since(ping.last_ping).as_millis() as u64,
                "no response to PINGREQ"
            );
            return Err(MqttClientError::ClientTimeout {
                keep_alive_secs: keep_alive.as_secs() as u16,
            });
        }
        if ping.outstanding == 0 && since_outbound >= 2 * keep_alive {
            return Err(MqttClientError::WriteTimeout {
                idle_ms: since_outbound.as_millis() as u64,
            });
        }

        let threshold = keep_alive.saturating_sub(KEEP_ALIVE_TOLERANCE);
        if (ping.outstanding == 0 && since_inbound >= threshold) || since_outbound >= threshold {
            drop(ping);
            let token = MqttToken::for_packet(&MqttPacket::PingReq);
            self.token_store.save_token(&token, PING_KEY)?;
            self.queues().pending_flows.push_front(MqttPacket::PingReq);
            self.queue_cond.notify_all();
            trace!(client_id = %self.client_id, "PINGREQ queued");
            Ok((Some(token), keep_alive))
        } else {
            let next = keep_alive
                .saturating_sub(since_outbound)
                .max(Duration::from_millis(1));
            Ok((None, next))
        }
    }

    /// Stops new inbound delivery and pings, then waits up to `timeout` for
    /// outstanding work to finish. Afterwards the pending queues are empty so
    /// DISCONNECT goes out as the last packet.
    pub fn quiesce(&self, timeout: Duration) {
        self.queues().quiescing = true;
        self.callback.quiesce();
        self.queue_cond.notify_all();

        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.quiesce_lock);
        loop {
            let now = Instant::now();
            if self.is_drained() || now >= deadline {
                break;
            }
            guard = self
                .quiesce_cond
                .wait_timeout(guard, (deadline - now).min(Duration::from_millis(100)))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        drop(guard);

        let mut q = self.queues();
        if !q.pending_messages.is_empty() || !q.pending_flows.is_empty() {
            debug!(
                client_id = %self.client_id,
                flows = q.pending_flows.len(),
                messages = q.pending_messages.len(),
                "quiesce discarding pending packets"
            );
        }
        q.pending_messages.clear();
        q.pending_flows.clear();
        q.quiescing = false;
        q.actual_in_flight = 0;
    }

    fn is_drained(&self) -> bool {
        let flows_empty = self.queues().pending_flows.is_empty();
        flows_empty && self.token_store.count() == 0 && self.callback.is_quiesced()
    }

    /// Wakes a quiesce waiter once there is nothing left to wait for.
    pub fn check_quiesce_lock(&self) -> bool {
        if self.queues().quiescing && self.is_drained() {
            let _guard = lock(&self.quiesce_lock);
            self.quiesce_cond.notify_all();
            return true;
        }
        false
    }

    /// Sets the failure on every outstanding token and returns them for
    /// notification. Tokens other than delivery tokens are removed from the
    /// store; delivery tokens stay for a possible resend after reconnect.
    pub fn resolve_old_tokens(&self, reason: Option<&MqttClientError>) -> Vec<MqttToken> {
        let reason = reason
            .cloned()
            .unwrap_or(MqttClientError::ClientDisconnecting);
        let outstanding = self.token_store.outstanding_tokens();
        for token in &outstanding {
            if !token.is_complete() && !token.is_complete_pending() && token.error().is_none() {
                token.set_error(reason.clone());
            }
            if !token.is_delivery() {
                self.token_store.remove_token(&token.key());
            }
        }
        outstanding
    }

    /// The connection is gone. Stops the sender and, for a clean session,
    /// forgets everything.
    pub fn disconnected(&self) {
        {
            let mut q = self.queues();
            q.connection = Connection::Disconnected;
            if q.clean_start {
                if let Err(e) = self.clear_state(&mut q) {
                    warn!(client_id = %self.client_id, error = %e, "failed to clear session state");
                }
            }
            q.pending_messages.clear();
            q.pending_flows.clear();
        }
        self.queue_cond.notify_all();
        lock(&self.ping).outstanding = 0;
    }

    pub fn is_connected(&self) -> bool {
        self.queues().connection == Connection::Connected
    }

    pub fn is_quiescing(&self) -> bool {
        self.queues().quiescing
    }

    pub fn actual_in_flight(&self) -> usize {
        self.queues().actual_in_flight
    }

    pub fn in_flight_pubrels(&self) -> usize {
        self.queues().in_flight_pubrels
    }

    pub fn max_inflight(&self) -> usize {
        self.queues().max_inflight
    }

    /// (pending flows, pending messages)
    pub fn pending_counts(&self) -> (usize, usize) {
        let q = self.queues();
        (q.pending_flows.len(), q.pending_messages.len())
    }

    pub fn outbound_ids(&self) -> Vec<u16> {
        let q = self.queues();
        let mut ids: Vec<u16> = q
            .outbound_qos0
            .keys()
            .chain(q.outbound_qos1.keys())
            .chain(q.outbound_qos2.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn inbound_qos2_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.queues().inbound_qos2.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn in_use_ids(&self) -> usize {
        self.queues().in_use_ids.len()
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    pub fn mqtt_version(&self) -> u8 {
        self.dialect.version()
    }
}

/// Orders recovered packets by id, starting right after the largest gap
/// between consecutive ids (the wrap from the highest id back to the lowest
/// counts as a gap). Approximates the original send order when the id space
/// wrapped while messages were in flight.
pub(crate) fn reorder_by_gap<T>(mut items: Vec<(u16, T)>) -> VecDeque<T> {
    items.sort_by_key(|(id, _)| *id);
    if items.is_empty() {
        return VecDeque::new();
    }
    let mut previous = 0u32;
    let mut largest_gap = 0u32;
    let mut start = 0usize;
    for (i, (id, _)) in items.iter().enumerate() {
        let id = u32::from(*id);
        if id - previous > largest_gap {
            largest_gap = id - previous;
            start = i;
        }
        previous = id;
    }
    let lowest = u32::from(items[0].0);
    if u32::from(MAX_MSG_ID) - previous + lowest > largest_gap {
        start = 0;
    }
    let tail = items.split_off(start);
    tail.into_iter().chain(items).map(|(_, item)| item).collect()
}
