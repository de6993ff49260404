// SPDX-License-Identifier: MPL-2.0

//! Application callbacks and the dispatcher thread that runs them.
//!
//! Arrived messages and completed tokens are queued here by the network
//! threads and handed to user code on a dedicated thread. The arrived-message
//! queue is bounded: when the application falls behind, the receiver blocks
//! in [`CallbackDispatcher::message_arrived`] until space frees up, the client
//! starts quiescing, or the dispatcher stops.

use std::collections::VecDeque;
use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use super::error::MqttClientError;
use super::lock;
use super::message::MqttMessage;
use super::state::ClientState;
use super::token::MqttToken;
use super::worker::{WorkerControl, WorkerHandle, WorkerState};
use crate::mqtt_serde::publish::MqttPublish;
use crate::mqtt_serde::topic::topic_matches;

pub type CallbackError = Box<dyn Error + Send + Sync>;

/// Per-subscription message handler registered with
/// `subscribe_with_listener`.
pub type MessageListener =
    Arc<dyn Fn(&str, &MqttMessage) -> Result<(), CallbackError> + Send + Sync>;

/// Application hooks. All methods have empty defaults.
pub trait MqttCallback: Send + Sync {
    /// The connection dropped for a reason other than a user disconnect.
    fn connection_lost(&self, cause: &MqttClientError) {
        let _ = cause;
    }

    /// A message arrived for which no subscription listener matched.
    /// Returning an error (or panicking) is treated as fatal: the client
    /// stops dispatching and shuts the connection down, and the message is
    /// not acknowledged.
    fn message_arrived(&self, topic: &str, message: &MqttMessage) -> Result<(), CallbackError> {
        let _ = (topic, message);
        Ok(())
    }

    /// A publish reached its final acknowledgement (or, for QoS 0, was
    /// written).
    fn delivery_complete(&self, token: &MqttToken) {
        let _ = token;
    }

    fn connect_complete(&self, reconnect: bool, server_uri: &str) {
        let _ = (reconnect, server_uri);
    }

    /// The server sent DISCONNECT (MQTT 5.0).
    fn disconnected(&self, reason_code: u8, reason_string: Option<&str>) {
        let _ = (reason_code, reason_string);
    }

    /// A buffered offline message was evicted to make room.
    fn message_discarded(&self, message: &MqttMessage) {
        let _ = message;
    }
}

/// Outcome of handing an inbound message to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Nobody is listening; the caller acknowledges it directly.
    NoConsumer,
    /// Dropped because the client is quiescing or the dispatcher stopped.
    Dropped,
}

const SPACE_WAIT: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Queues {
    messages: VecDeque<MqttPublish>,
    completed: VecDeque<MqttToken>,
    quiescing: bool,
}

pub type FailureHandler = Box<dyn Fn(MqttClientError) + Send>;

pub struct CallbackDispatcher {
    client_id: String,
    control: Arc<WorkerControl>,
    queues: Mutex<Queues>,
    work_available: Condvar,
    space_available: Condvar,
    max_queue: usize,
    stop_timeout: Duration,
    callback: RwLock<Option<Arc<dyn MqttCallback>>>,
    listeners: Mutex<Vec<(String, MessageListener)>>,
}

impl CallbackDispatcher {
    pub fn new(client_id: &str, max_queue: usize, stop_timeout: Duration) -> Self {
        CallbackDispatcher {
            client_id: client_id.to_string(),
            control: WorkerControl::new("callback"),
            queues: Mutex::new(Queues::default()),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            max_queue: max_queue.max(1),
            stop_timeout,
            callback: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn MqttCallback>>) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub fn callback(&self) -> Option<Arc<dyn MqttCallback>> {
        self.callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_message_listener(&self, topic_filter: &str, listener: MessageListener) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|(f, _)| f != topic_filter);
        listeners.push((topic_filter.to_string(), listener));
    }

    pub fn remove_message_listener(&self, topic_filter: &str) {
        lock(&self.listeners).retain(|(f, _)| f != topic_filter);
    }

    pub fn remove_message_listeners(&self) {
        lock(&self.listeners).clear();
    }

    fn has_consumer(&self) -> bool {
        self.callback().is_some() || !lock(&self.listeners).is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn is_current_thread(&self) -> bool {
        self.control.is_current_thread()
    }

    /// Starts the dispatcher thread. `on_failure` is invoked on the
    /// dispatcher thread when application code fails.
    pub fn start(
        self: &Arc<Self>,
        state: Arc<ClientState>,
        on_failure: FailureHandler,
    ) -> std::io::Result<()> {
        {
            let mut queues = lock(&self.queues);
            queues.messages.clear();
            queues.completed.clear();
            queues.quiescing = false;
        }
        let dispatcher = Arc::clone(self);
        self.control.start(
            format!("flowlink-call-{}", self.client_id),
            move |handle| dispatcher.run(handle, state, on_failure),
        )?;
        Ok(())
    }

    /// Stops the dispatcher, waiting at most the configured stop timeout for
    /// a callback in progress. Completions still queued are delivered on the
    /// calling thread; queued messages are dropped unacknowledged.
    pub fn stop(&self) {
        self.wake_all();
        self.control.stop(Some(self.stop_timeout));
        self.wake_all();

        let leftover: Vec<MqttToken> = {
            let mut queues = lock(&self.queues);
            if !queues.messages.is_empty() {
                debug!(
                    client_id = %self.client_id,
                    dropped = queues.messages.len(),
                    "dropping undelivered messages"
                );
                queues.messages.clear();
            }
            queues.completed.drain(..).collect()
        };
        for token in leftover {
            if let Err(e) = self.handle_action_complete(&token) {
                error!(client_id = %self.client_id, error = %e, "completion callback failed");
            }
        }
    }

    fn wake_all(&self) {
        let _queues = lock(&self.queues);
        self.work_available.notify_all();
        self.space_available.notify_all();
    }

    pub fn quiesce(&self) {
        lock(&self.queues).quiescing = true;
        self.space_available.notify_all();
        self.work_available.notify_all();
    }

    pub fn is_quiesced(&self) -> bool {
        let queues = lock(&self.queues);
        queues.quiescing && queues.messages.is_empty() && queues.completed.is_empty()
    }

    /// Queues an inbound message for the application, blocking while the
    /// queue is full.
    pub fn message_arrived(&self, publish: MqttPublish) -> Delivery {
        if !self.has_consumer() {
            return Delivery::NoConsumer;
        }
        let mut queues = lock(&self.queues);
        while self.control.is_running()
            && !queues.quiescing
            && queues.messages.len() >= self.max_queue
        {
            queues = self
                .space_available
                .wait_timeout(queues, SPACE_WAIT)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if queues.quiescing || !self.control.is_running() {
            debug!(client_id = %self.client_id, topic = %publish.topic_name, "message dropped");
            return Delivery::Dropped;
        }
        queues.messages.push_back(publish);
        self.work_available.notify_all();
        Delivery::Queued
    }

    /// Hands a token whose outcome is known to the application. Runs the
    /// completion inline when the dispatcher thread is not running.
    pub fn async_operation_complete(&self, token: MqttToken) {
        if self.control.is_running() {
            lock(&self.queues).completed.push_back(token);
            self.work_available.notify_all();
        } else if let Err(e) = self.handle_action_complete(&token) {
            error!(client_id = %self.client_id, error = %e, "completion callback failed");
        }
    }

    pub fn connection_lost(&self, cause: &MqttClientError) {
        if let Some(callback) = self.callback() {
            self.guarded("connection_lost", || callback.connection_lost(cause));
        }
    }

    pub fn connect_complete(&self, reconnect: bool, server_uri: &str) {
        if let Some(callback) = self.callback() {
            self.guarded("connect_complete", || {
                callback.connect_complete(reconnect, server_uri)
            });
        }
    }

    pub fn disconnected(&self, reason_code: u8, reason_string: Option<&str>) {
        if let Some(callback) = self.callback() {
            self.guarded("disconnected", || {
                callback.disconnected(reason_code, reason_string)
            });
        }
    }

    pub fn message_discarded(&self, message: &MqttMessage) {
        if let Some(callback) = self.callback() {
            self.guarded("message_discarded", || callback.message_discarded(message));
        }
    }

    // notifications outside the dispatch loop; a panic is logged and contained
    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(client_id = %self.client_id, callback = what, "application callback panicked");
        }
    }

    fn run(&self, handle: WorkerHandle, state: Arc<ClientState>, on_failure: FailureHandler) {
        debug!(client_id = %self.client_id, "callback dispatcher running");
        while handle.is_running() {
            let (token, message, quiescing) = {
                let mut queues = lock(&self.queues);
                while handle.is_running()
                    && queues.messages.is_empty()
                    && queues.completed.is_empty()
                {
                    queues = self
                        .work_available
                        .wait_timeout(queues, SPACE_WAIT)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                if !handle.is_running() {
                    break;
                }
                (
                    queues.completed.pop_front(),
                    queues.messages.pop_front(),
                    queues.quiescing,
                )
            };
            self.space_available.notify_all();
            if quiescing {
                handle.set_state(WorkerState::Quiescing);
            }

            let mut outcome = Ok(());
            if let Some(token) = token {
                outcome = self.handle_action_complete(&token);
            }
            if outcome.is_ok() {
                if let Some(message) = message {
                    outcome = self.handle_message(&state, &message);
                }
            }
            if let Err(e) = outcome {
                error!(client_id = %self.client_id, error = %e, "stopping callback dispatcher");
                self.control.stop(None);
                on_failure(e);
                break;
            }

            if quiescing {
                state.check_quiesce_lock();
            }
        }
        self.space_available.notify_all();
    }

    fn handle_action_complete(&self, token: &MqttToken) -> Result<(), MqttClientError> {
        token.notify_complete();
        let callback = self.callback();
        let result = catch_unwind(AssertUnwindSafe(|| {
            if token.is_delivery() && token.error().is_none() {
                if let Some(callback) = &callback {
                    callback.delivery_complete(token);
                }
            }
            if token.claim_notification() {
                token.fire_listener();
            }
        }));
        result.map_err(|panic| MqttClientError::CallbackFailed {
            message: panic_message(panic.as_ref()),
        })
    }

    fn handle_message(
        &self,
        state: &ClientState,
        publish: &MqttPublish,
    ) -> Result<(), MqttClientError> {
        let message = MqttMessage::from(publish);
        let listeners: Vec<MessageListener> = lock(&self.listeners)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, l)| Arc::clone(l))
            .collect();
        let callback = self.callback();

        let result = catch_unwind(AssertUnwindSafe(|| -> Result<(), CallbackError> {
            if listeners.is_empty() {
                if let Some(callback) = &callback {
                    callback.message_arrived(&message.topic, &message)?;
                }
            } else {
                for listener in &listeners {
                    listener(&message.topic, &message)?;
                }
            }
            Ok(())
        }));

        match result {
            Ok(Ok(())) => state.message_delivered(publish),
            Ok(Err(e)) => {
                warn!(client_id = %self.client_id, topic = %message.topic, error = %e, "message_arrived failed");
                Err(MqttClientError::CallbackFailed {
                    message: e.to_string(),
                })
            }
            Err(panic) => Err(MqttClientError::CallbackFailed {
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in application callback".to_string()
    }
}
