//! Publishes accepted while the client is offline, replayed in FIFO order
//! once a connection is up again.
//!
//! Buffered publishes have no packet identifier yet, so persisted entries are
//! stored as JSON rather than in wire form, under `sb-{sequence}`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::{MqttClientError, MqttClientResult};
use super::lock;
use super::opts::DisconnectedBufferOptions;
use super::persistence::{buffered_key, MqttClientPersistence, PersistedKey};
use super::token::MqttToken;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::publish::MqttPublish;

const RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub sequence: u64,
    pub publish: MqttPublish,
    pub token: MqttToken,
}

/// Result of [`OfflineBuffer::put_if_busy`].
#[derive(Debug)]
pub enum PutOutcome {
    /// Stored; carries the entry evicted to make room, if any.
    Stored(Option<BufferedMessage>),
    /// Nothing buffered and no drain running: send directly.
    Idle(MqttPublish, MqttToken),
}

struct BufferInner {
    messages: VecDeque<BufferedMessage>,
    next_sequence: u64,
    draining: bool,
    // entry handed to `send` by a running drain; never evicted
    in_progress: Option<u64>,
}

pub struct OfflineBuffer {
    client_id: String,
    options: DisconnectedBufferOptions,
    persistence: Option<Arc<dyn MqttClientPersistence>>,
    inner: Mutex<BufferInner>,
}

impl OfflineBuffer {
    /// Reloads previously persisted entries when `persist_buffer` is set.
    pub fn new(
        client_id: &str,
        options: &DisconnectedBufferOptions,
        persistence: Arc<dyn MqttClientPersistence>,
    ) -> MqttClientResult<Self> {
        let persistence = options.persist_buffer.then_some(persistence);
        let mut messages = Vec::new();
        if let Some(store) = &persistence {
            for key in store.keys()? {
                let Some(PersistedKey::Buffered(sequence)) = PersistedKey::parse(&key) else {
                    continue;
                };
                let Some(bytes) = store.get(&key)? else {
                    continue;
                };
                match serde_json::from_slice::<MqttPublish>(&bytes) {
                    Ok(publish) => {
                        let token = MqttToken::for_packet(&MqttPacket::Publish(publish.clone()));
                        messages.push(BufferedMessage {
                            sequence,
                            publish,
                            token,
                        });
                    }
                    Err(e) => {
                        warn!(client_id, key = %key, error = %e, "discarding corrupt buffered message");
                        store.remove(&key)?;
                    }
                }
            }
        }
        messages.sort_by_key(|m| m.sequence);
        let next_sequence = messages.last().map_or(1, |m| m.sequence + 1);
        if !messages.is_empty() {
            info!(client_id, count = messages.len(), "restored buffered messages");
        }
        Ok(OfflineBuffer {
            client_id: client_id.to_string(),
            options: options.clone(),
            persistence,
            inner: Mutex::new(BufferInner {
                messages: messages.into(),
                next_sequence,
                draining: false,
                in_progress: None,
            }),
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.options.buffer_size
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.inner).draining
    }

    /// Marks a drain as running. Returns false when there is nothing to
    /// drain or a drain is already running.
    pub fn begin_drain(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.draining || inner.messages.is_empty() {
            return false;
        }
        inner.draining = true;
        true
    }

    pub fn end_drain(&self) {
        lock(&self.inner).draining = false;
    }

    /// Appends a publish. When the buffer is full the oldest entry is evicted
    /// and returned, or the call fails, depending on configuration.
    pub fn put(
        &self,
        publish: MqttPublish,
        token: MqttToken,
    ) -> MqttClientResult<Option<BufferedMessage>> {
        let mut inner = lock(&self.inner);
        self.put_locked(&mut inner, publish, token)
    }

    /// Appends only while older entries are waiting or a drain is running,
    /// so a new publish never overtakes buffered ones.
    pub fn put_if_busy(
        &self,
        publish: MqttPublish,
        token: MqttToken,
    ) -> MqttClientResult<PutOutcome> {
        let mut inner = lock(&self.inner);
        if !inner.draining && inner.messages.is_empty() {
            return Ok(PutOutcome::Idle(publish, token));
        }
        self.put_locked(&mut inner, publish, token)
            .map(PutOutcome::Stored)
    }

    fn put_locked(
        &self,
        inner: &mut BufferInner,
        publish: MqttPublish,
        token: MqttToken,
    ) -> MqttClientResult<Option<BufferedMessage>> {
        let mut evicted = None;
        if inner.messages.len() >= self.options.buffer_size {
            let full = || MqttClientError::BufferFull {
                buffer_type: "Offline".to_string(),
                capacity: self.options.buffer_size,
            };
            if !self.options.delete_oldest_messages {
                return Err(full());
            }
            let in_progress = inner.in_progress;
            let oldest = inner
                .messages
                .iter()
                .position(|m| Some(m.sequence) != in_progress)
                .and_then(|i| inner.messages.remove(i))
                .ok_or_else(full)?;
            self.unpersist(oldest.sequence);
            warn!(client_id = %self.client_id, topic = %oldest.publish.topic_name, "offline buffer full, oldest message evicted");
            evicted = Some(oldest);
        }

        let sequence = inner.next_sequence;
        if let Some(store) = &self.persistence {
            let bytes = serde_json::to_vec(&publish).map_err(|e| MqttClientError::Persistence {
                message: e.to_string(),
            })?;
            store.put(&buffered_key(sequence), &bytes)?;
        }
        inner.next_sequence += 1;
        token.set_message(MqttPacket::Publish(publish.clone()));
        inner.messages.push_back(BufferedMessage {
            sequence,
            publish,
            token,
        });
        debug!(client_id = %self.client_id, sequence, buffered = inner.messages.len(), "publish buffered");
        Ok(evicted)
    }

    fn unpersist(&self, sequence: u64) {
        if let Some(store) = &self.persistence {
            if let Err(e) = store.remove(&buffered_key(sequence)) {
                warn!(client_id = %self.client_id, sequence, error = %e, "failed to remove buffered message");
            }
        }
    }

    /// Replays buffered messages through `send`, oldest first. The entry
    /// being sent cannot be evicted by a concurrent put. A full in-flight
    /// window is retried after a short pause for as long as
    /// `keep_going` allows; any other error stops the drain and leaves the
    /// remaining entries buffered. Returns how many were sent.
    pub fn drain<S, K>(&self, send: S, keep_going: K) -> MqttClientResult<usize>
    where
        S: Fn(MqttPublish, MqttToken) -> MqttClientResult<()>,
        K: Fn(Duration) -> bool,
    {
        let mut sent = 0;
        let result = loop {
            let next = {
                let mut inner = lock(&self.inner);
                match inner.messages.front().cloned() {
                    Some(front) => {
                        inner.in_progress = Some(front.sequence);
                        front
                    }
                    None => {
                        inner.draining = false;
                        break Ok(sent);
                    }
                }
            };
            let outcome = send(next.publish.clone(), next.token.clone());
            let mut inner = lock(&self.inner);
            inner.in_progress = None;
            match outcome {
                Ok(()) => {
                    if let Some(i) = inner
                        .messages
                        .iter()
                        .position(|m| m.sequence == next.sequence)
                    {
                        inner.messages.remove(i);
                    }
                    drop(inner);
                    self.unpersist(next.sequence);
                    sent += 1;
                }
                Err(MqttClientError::MaxInflight { .. }) => {
                    drop(inner);
                    if !keep_going(RETRY_PAUSE) {
                        break Ok(sent);
                    }
                }
                Err(e) => {
                    drop(inner);
                    warn!(client_id = %self.client_id, error = %e, "buffer drain stopped");
                    break Err(e);
                }
            }
        };
        self.end_drain();
        if sent > 0 {
            info!(client_id = %self.client_id, sent, remaining = self.len(), "offline buffer drained");
        }
        result
    }

    /// Tokens of every buffered message, oldest first.
    pub fn tokens(&self) -> Vec<MqttToken> {
        lock(&self.inner)
            .messages
            .iter()
            .map(|m| m.token.clone())
            .collect()
    }
}
