// SPDX-License-Identifier: MPL-2.0

//! Completion handles for asynchronous client operations.
//!
//! Completion is two-phase. The session engine calls [`MqttToken::mark_complete`]
//! when the response (or failure) is known; the callback dispatcher then calls
//! [`MqttToken::notify_complete`], which is what releases waiters. This keeps
//! application wake-ups ordered with the callbacks that report the same
//! outcome.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::{MqttClientError, MqttClientResult};
use super::lock;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::publish::MqttPublish;

/// Observer for the outcome of one operation. Runs on the callback
/// dispatcher thread.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &MqttToken);

    fn on_failure(&self, token: &MqttToken, error: &MqttClientError);
}

pub type UserContext = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct TokenState {
    key: String,
    completed: bool,
    pending_complete: bool,
    sent: bool,
    notified: bool,
    message: Option<MqttPacket>,
    response: Option<MqttPacket>,
    error: Option<MqttClientError>,
    listener: Option<Arc<dyn ActionListener>>,
    user_context: Option<UserContext>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    cond: Condvar,
    // held by the sender across write + notify_sent and by the receiver while
    // an ack for this token is applied
    io_lock: Mutex<()>,
}

/// Handle to one outstanding operation. Clones share the same state.
#[derive(Clone)]
pub struct MqttToken {
    inner: Arc<TokenInner>,
}

impl Default for MqttToken {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttToken {
    pub fn new() -> Self {
        MqttToken {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::default()),
                cond: Condvar::new(),
                io_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn for_packet(packet: &MqttPacket) -> Self {
        let token = Self::new();
        token.set_message(packet.clone());
        token
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        lock(&self.inner.state)
    }

    pub fn key(&self) -> String {
        self.state().key.clone()
    }

    pub(crate) fn set_key(&self, key: &str) {
        self.state().key = key.to_string();
    }

    /// Packet identifier of the triggering packet, once allocated.
    pub fn message_id(&self) -> Option<u16> {
        self.state().message.as_ref().and_then(MqttPacket::packet_id)
    }

    pub fn message(&self) -> Option<MqttPacket> {
        self.state().message.clone()
    }

    pub(crate) fn set_message(&self, packet: MqttPacket) {
        self.state().message = Some(packet);
    }

    /// The PUBLISH this token tracks, if it is a delivery token.
    pub fn publish(&self) -> Option<MqttPublish> {
        match &self.state().message {
            Some(MqttPacket::Publish(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn is_delivery(&self) -> bool {
        matches!(self.state().message, Some(MqttPacket::Publish(_)))
    }

    pub fn is_complete(&self) -> bool {
        self.state().completed
    }

    pub(crate) fn is_complete_pending(&self) -> bool {
        self.state().pending_complete
    }

    pub fn is_sent(&self) -> bool {
        self.state().sent
    }

    pub fn error(&self) -> Option<MqttClientError> {
        self.state().error.clone()
    }

    pub fn response(&self) -> Option<MqttPacket> {
        self.state().response.clone()
    }

    /// Granted QoS values (SUBACK) or reason codes (v5 UNSUBACK).
    pub fn granted_qos(&self) -> Vec<u8> {
        match &self.state().response {
            Some(MqttPacket::SubAck(ack)) => ack.reason_codes.clone(),
            Some(MqttPacket::UnsubAck(ack)) => ack.reason_codes.clone(),
            _ => Vec::new(),
        }
    }

    pub fn session_present(&self) -> bool {
        matches!(&self.state().response, Some(MqttPacket::ConnAck(ack)) if ack.session_present)
    }

    pub fn set_action_listener(&self, listener: Arc<dyn ActionListener>) {
        self.state().listener = Some(listener);
    }

    pub fn action_listener(&self) -> Option<Arc<dyn ActionListener>> {
        self.state().listener.clone()
    }

    pub fn set_user_context(&self, context: UserContext) {
        self.state().user_context = Some(context);
    }

    pub fn user_context(&self) -> Option<UserContext> {
        self.state().user_context.clone()
    }

    /// Blocks until the operation completes. `None` waits forever.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> MqttClientResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state();
        while !state.completed {
            state = match deadline {
                None => self
                    .inner
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MqttClientError::OperationTimeout {
                            operation: self.operation_name(&state),
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                        });
                    }
                    self.inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Blocks until the packet has been written, the operation completed or
    /// failed, or the timeout passed.
    pub(crate) fn wait_until_sent(&self, timeout: Duration) -> MqttClientResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while !state.sent && !state.completed && state.error.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(MqttClientError::OperationTimeout {
                    operation: format!("send {}", self.operation_name(&state)),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn operation_name(&self, state: &TokenState) -> String {
        state
            .message
            .as_ref()
            .map_or("operation", MqttPacket::name)
            .to_string()
    }

    pub(crate) fn mark_sent(&self) {
        self.state().sent = true;
        self.inner.cond.notify_all();
    }

    /// First completion phase: records the outcome without waking waiters.
    pub(crate) fn mark_complete(
        &self,
        response: Option<MqttPacket>,
        error: Option<MqttClientError>,
    ) {
        let mut state = self.state();
        state.response = response;
        state.error = error;
        state.pending_complete = true;
    }

    /// Records a failure unless an outcome is already known.
    pub(crate) fn set_error(&self, error: MqttClientError) {
        let mut state = self.state();
        if !state.completed && !state.pending_complete && state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// Clears a failure left by an earlier connection so that a surviving
    /// delivery token can complete after reconnect.
    pub(crate) fn reset_error(&self) {
        let mut state = self.state();
        state.error = None;
        state.completed = false;
        state.pending_complete = false;
    }

    /// Second completion phase: releases waiters.
    pub(crate) fn notify_complete(&self) {
        let mut state = self.state();
        state.completed = true;
        state.pending_complete = false;
        if state.error.is_none() {
            state.sent = true;
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Returns true exactly once per token, for the caller that should run
    /// the action listener.
    pub(crate) fn claim_notification(&self) -> bool {
        let mut state = self.state();
        !std::mem::replace(&mut state.notified, true)
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.state().notified
    }

    pub(crate) fn io_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.io_lock)
    }

    pub(crate) fn fire_listener(&self) {
        let (listener, error) = {
            let state = self.state();
            (state.listener.clone(), state.error.clone())
        };
        if let Some(listener) = listener {
            match error {
                None => listener.on_success(self),
                Some(e) => listener.on_failure(self, &e),
            }
        }
    }

    pub fn ptr_eq(&self, other: &MqttToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MqttToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MqttToken")
            .field("key", &state.key)
            .field("completed", &state.completed)
            .field("sent", &state.sent)
            .field("error", &state.error)
            .finish()
    }
}
