// SPDX-License-Identifier: MPL-2.0

//! Connection lifecycle around the session engine.
//!
//! Starts and stops the sender, receiver, callback and keep-alive workers,
//! owns the one shutdown path every failure goes through, schedules
//! automatic reconnects and routes publishes into the offline buffer while
//! there is no connection.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::callback::CallbackDispatcher;
use super::dialect::{dialect_for, ProtocolDialect};
use super::error::{MqttClientError, MqttClientResult};
use super::lock;
use super::message::MqttMessage;
use super::offline_buffer::{BufferedMessage, OfflineBuffer, PutOutcome};
use super::opts::MqttClientOptions;
use super::persistence::MqttClientPersistence;
use super::ping::Pinger;
use super::receiver::CommsReceiver;
use super::sender::CommsSender;
use super::state::ClientState;
use super::token::{ActionListener, MqttToken};
use super::token_store::TokenStore;
use super::transport::{NetworkModule, NetworkModuleFactory};
use super::worker::WorkerControl;
use crate::mqtt_serde::connect::{MqttConnAck, MqttConnect};
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::properties::Property;
use crate::mqtt_serde::publish::MqttPublish;

const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Closed,
}

struct ConnInner {
    state: ConnectionState,
    // a shutdown is running
    stopping: bool,
    // cleared by a user disconnect; automatic reconnect only runs while set
    should_be_connected: bool,
    reconnect_attempts: u32,
    // bumped to cancel a scheduled reconnect
    reconnect_epoch: u64,
    network: Option<Box<dyn NetworkModule>>,
}

/// Backoff before reconnect attempt `attempt` (0 based).
pub(crate) fn reconnect_delay(min_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(MAX_BACKOFF_EXPONENT);
    Duration::from_millis(min_ms.saturating_mul(factor).min(max_ms))
}

pub struct ClientComms {
    me: Weak<ClientComms>,
    client_id: String,
    server_uri: String,
    options: MqttClientOptions,
    dialect: Arc<dyn ProtocolDialect>,
    persistence: Arc<dyn MqttClientPersistence>,
    factory: Arc<dyn NetworkModuleFactory>,
    token_store: Arc<TokenStore>,
    callback: Arc<CallbackDispatcher>,
    state: Arc<ClientState>,
    sender: CommsSender,
    receiver: CommsReceiver,
    pinger: Pinger,
    buffer: Option<Arc<OfflineBuffer>>,
    drainer: Arc<WorkerControl>,
    con: Mutex<ConnInner>,
    con_cond: Condvar,
}

impl ClientComms {
    /// Opens `persistence` and restores any session state found in it.
    pub fn new(
        server_uri: &str,
        options: MqttClientOptions,
        persistence: Arc<dyn MqttClientPersistence>,
        factory: Arc<dyn NetworkModuleFactory>,
    ) -> MqttClientResult<Arc<Self>> {
        options.validate()?;
        let client_id = options.client_id.clone();
        persistence.open(&client_id, server_uri)?;

        let dialect = dialect_for(options.mqtt_version);
        let token_store = Arc::new(TokenStore::new());
        let callback = Arc::new(CallbackDispatcher::new(
            &client_id,
            options.max_callback_queue,
            Duration::from_millis(options.callback_stop_timeout_ms),
        ));
        let state = Arc::new(ClientState::new(
            &client_id,
            dialect.clone(),
            persistence.clone(),
            token_store.clone(),
            callback.clone(),
            options.max_inflight,
        )?);
        let buffer = if options.disconnected_buffer.enabled {
            Some(Arc::new(OfflineBuffer::new(
                &client_id,
                &options.disconnected_buffer,
                persistence.clone(),
            )?))
        } else {
            None
        };
        debug!(client_id = %client_id, server_uri, dialect = dialect.name(), "client created");

        Ok(Arc::new_cyclic(|me| ClientComms {
            me: me.clone(),
            sender: CommsSender::new(&client_id),
            receiver: CommsReceiver::new(&client_id),
            pinger: Pinger::new(&client_id),
            client_id,
            server_uri: server_uri.to_string(),
            options,
            dialect,
            persistence,
            factory,
            token_store,
            callback,
            state,
            buffer,
            drainer: WorkerControl::new("drain"),
            con: Mutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                stopping: false,
                should_be_connected: false,
                reconnect_attempts: 0,
                reconnect_epoch: 0,
                network: None,
            }),
            con_cond: Condvar::new(),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn options(&self) -> &MqttClientOptions {
        &self.options
    }

    pub fn callback(&self) -> &Arc<CallbackDispatcher> {
        &self.callback
    }

    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    pub fn buffer(&self) -> Option<&Arc<OfflineBuffer>> {
        self.buffer.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.con).state
    }

    pub fn is_connected(&self) -> bool {
        let con = lock(&self.con);
        con.state == ConnectionState::Connected && !con.stopping
    }

    /// A shutdown, user disconnect or close is under way (or done, for close).
    pub fn is_disconnecting(&self) -> bool {
        let con = lock(&self.con);
        con.stopping
            || matches!(
                con.state,
                ConnectionState::Disconnecting | ConnectionState::Closed
            )
    }

    pub fn connect(&self, token: MqttToken) -> MqttClientResult<()> {
        self.start_connect(token, false)
    }

    /// Connects right away, cancelling any scheduled reconnect.
    pub fn reconnect(&self) -> MqttClientResult<MqttToken> {
        {
            let mut con = lock(&self.con);
            con.reconnect_epoch += 1;
        }
        self.con_cond.notify_all();
        let token = MqttToken::new();
        self.start_connect(token.clone(), true)?;
        Ok(token)
    }

    fn start_connect(&self, token: MqttToken, reconnect: bool) -> MqttClientResult<()> {
        {
            let mut con = lock(&self.con);
            match con.state {
                ConnectionState::Closed => return Err(MqttClientError::ClientClosed),
                ConnectionState::Connected => return Err(MqttClientError::AlreadyConnected),
                ConnectionState::Connecting => return Err(MqttClientError::ConnectInProgress),
                ConnectionState::Disconnecting => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Disconnected if con.stopping => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Disconnected => {}
            }
            con.state = ConnectionState::Connecting;
            if !reconnect {
                con.reconnect_attempts = 0;
                con.reconnect_epoch += 1;
            }
        }
        self.con_cond.notify_all();

        let user = token.action_listener();
        token.set_action_listener(Arc::new(ConnectListener {
            comms: self.me.clone(),
            user,
            reconnect,
        }));

        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name(format!("flowlink-conn-{}", self.client_id))
            .spawn(move || {
                if let Some(comms) = me.upgrade() {
                    comms.run_connect(token);
                }
            });
        if let Err(e) = spawned {
            lock(&self.con).state = ConnectionState::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }

    fn run_connect(&self, token: MqttToken) {
        info!(client_id = %self.client_id, server_uri = %self.server_uri, "connecting");
        if let Err(e) = self.open_connection(&token) {
            warn!(client_id = %self.client_id, error = %e, "connect failed");
            self.shutdown_connection(Some(token), Some(e));
            return;
        }
        if self.options.connection_timeout_ms == 0 {
            return;
        }
        let timeout = Duration::from_millis(self.options.connection_timeout_ms);
        if let Err(e @ MqttClientError::OperationTimeout { .. }) =
            token.wait_for_completion(Some(timeout))
        {
            if !token.is_complete() && !token.is_complete_pending() {
                warn!(client_id = %self.client_id, "no CONNACK in time");
                self.shutdown_connection(Some(token), Some(e));
            }
        }
    }

    fn open_connection(&self, token: &MqttToken) -> MqttClientResult<()> {
        self.token_store.open();
        for delivery in self.token_store.outstanding_delivery_tokens() {
            delivery.reset_error();
        }

        let timeout = Duration::from_millis(self.options.connection_timeout_ms);
        let mut network = self.factory.create(&self.server_uri, timeout)?;
        network.start()?;
        let reader = network.reader()?;
        let writer = network.writer()?;
        {
            let mut con = lock(&self.con);
            if con.state != ConnectionState::Connecting || con.stopping {
                network.stop();
                return Err(MqttClientError::ClientDisconnecting);
            }
            con.network = Some(network);
        }

        self.state.connecting(
            self.options.clean_start,
            Duration::from_secs(u64::from(self.options.keep_alive)),
        );
        let me = self.me.clone();
        self.callback.start(
            self.state.clone(),
            Box::new(move |e| {
                if let Some(comms) = me.upgrade() {
                    comms.shutdown_connection(None, Some(e));
                }
            }),
        )?;
        self.receiver
            .start(self.state.clone(), reader, self.me.clone())?;
        self.sender.start(self.state.clone(), writer, self.me.clone())?;
        self.state
            .send(MqttPacket::Connect(self.connect_packet()), Some(token.clone()))
    }

    fn connect_packet(&self) -> MqttConnect {
        let options = &self.options;
        let mut connect =
            MqttConnect::new(self.client_id.clone(), options.keep_alive, options.clean_start);
        connect.protocol_version = self.dialect.version();
        connect.username = options.username.clone();
        connect.password = options.password.clone();
        connect.will = options.will.clone();
        if options.is_v5() {
            if let Some(expiry) = options.session_expiry_interval {
                connect
                    .properties
                    .push(Property::SessionExpiryInterval(expiry));
            }
        }
        connect
    }

    /// CONNACK accepted. Runs on the receiver thread.
    pub fn connect_complete(&self, connack: &MqttConnAck, token: MqttToken) {
        {
            let mut con = lock(&self.con);
            if con.stopping || con.state != ConnectionState::Connecting {
                debug!(client_id = %self.client_id, "CONNACK after the attempt was abandoned");
                return;
            }
            con.state = ConnectionState::Connected;
            con.should_be_connected = true;
            con.reconnect_attempts = 0;
        }
        self.con_cond.notify_all();
        info!(
            client_id = %self.client_id,
            session_present = connack.session_present,
            "connected"
        );

        if let Err(e) = self.pinger.start(
            self.state.clone(),
            Duration::from_secs(u64::from(self.options.keep_alive)),
            self.me.clone(),
        ) {
            warn!(client_id = %self.client_id, error = %e, "keep-alive timer not started");
        }
        token.mark_complete(Some(MqttPacket::ConnAck(connack.clone())), None);
        self.callback.async_operation_complete(token);
    }

    fn start_drain(&self) {
        let Some(buffer) = &self.buffer else {
            return;
        };
        if !buffer.begin_drain() {
            return;
        }
        self.drainer.stop(Some(DRAIN_STOP_TIMEOUT));
        let drained = Arc::clone(buffer);
        let me = self.me.clone();
        let started = self.drainer.start(
            format!("flowlink-drain-{}", self.client_id),
            move |handle| {
                let result = drained.drain(
                    |publish, token| match me.upgrade() {
                        Some(comms) => comms.send_buffered(publish, token),
                        None => Err(MqttClientError::ClientClosed),
                    },
                    |pause| handle.sleep(pause),
                );
                if let Err(e) = result {
                    debug!(error = %e, "buffer drain ended early");
                }
            },
        );
        match started {
            Ok(true) => {}
            Ok(false) => buffer.end_drain(),
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "buffer drain not started");
                buffer.end_drain();
            }
        }
    }

    fn send_buffered(&self, publish: MqttPublish, token: MqttToken) -> MqttClientResult<()> {
        if !self.is_connected() {
            return Err(MqttClientError::NotConnected);
        }
        self.state.send(MqttPacket::Publish(publish), Some(token))
    }

    /// Sends a publish, or buffers it while offline when buffering is on.
    pub fn send_publish(&self, publish: MqttPublish, token: MqttToken) -> MqttClientResult<()> {
        let (state, stopping) = {
            let con = lock(&self.con);
            (con.state, con.stopping)
        };
        match (state, &self.buffer) {
            (ConnectionState::Connected, _) if stopping => Err(MqttClientError::ClientDisconnecting),
            (ConnectionState::Connected, Some(buffer)) => match buffer.put_if_busy(publish, token)? {
                PutOutcome::Stored(evicted) => {
                    self.discarded(evicted);
                    Ok(())
                }
                PutOutcome::Idle(publish, token) => {
                    self.state.send(MqttPacket::Publish(publish), Some(token))
                }
            },
            (ConnectionState::Connected, None) => {
                self.state.send(MqttPacket::Publish(publish), Some(token))
            }
            (ConnectionState::Disconnected | ConnectionState::Connecting, Some(buffer)) => {
                let evicted = buffer.put(publish, token)?;
                self.discarded(evicted);
                Ok(())
            }
            (ConnectionState::Disconnecting, _) => Err(MqttClientError::ClientDisconnecting),
            (ConnectionState::Closed, _) => Err(MqttClientError::ClientClosed),
            _ => Err(MqttClientError::NotConnected),
        }
    }

    fn discarded(&self, evicted: Option<BufferedMessage>) {
        if let Some(evicted) = evicted {
            evicted
                .token
                .mark_complete(None, Some(MqttClientError::MessageDiscarded));
            self.callback.async_operation_complete(evicted.token.clone());
            self.callback
                .message_discarded(&MqttMessage::from(&evicted.publish));
        }
    }

    /// SUBSCRIBE, UNSUBSCRIBE: only while connected.
    pub fn send_control(&self, packet: MqttPacket, token: MqttToken) -> MqttClientResult<()> {
        let con = lock(&self.con);
        match con.state {
            ConnectionState::Connected if !con.stopping => {
                drop(con);
                self.state.send(packet, Some(token))
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                Err(MqttClientError::ClientDisconnecting)
            }
            ConnectionState::Closed => Err(MqttClientError::ClientClosed),
            _ => Err(MqttClientError::NotConnected),
        }
    }

    /// Quiesces, sends DISCONNECT and shuts the connection down on a
    /// background thread; `token` completes when done.
    pub fn disconnect(&self, quiesce_timeout: Duration, token: MqttToken) -> MqttClientResult<()> {
        {
            let mut con = lock(&self.con);
            match con.state {
                ConnectionState::Closed => return Err(MqttClientError::ClientClosed),
                ConnectionState::Disconnected => return Err(MqttClientError::NotConnected),
                ConnectionState::Disconnecting => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Connecting => return Err(MqttClientError::ConnectInProgress),
                ConnectionState::Connected if con.stopping => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Connected => {}
            }
            // quiesce would wait on the very thread that is asking
            if self.callback.is_current_thread() {
                return Err(MqttClientError::DisconnectProhibited);
            }
            con.state = ConnectionState::Disconnecting;
            con.should_be_connected = false;
            con.reconnect_epoch += 1;
        }
        self.con_cond.notify_all();

        let me = self.me.clone();
        let background = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("flowlink-disc-{}", self.client_id))
            .spawn(move || {
                if let Some(comms) = me.upgrade() {
                    comms.run_disconnect(quiesce_timeout, background);
                }
            });
        if let Err(e) = spawned {
            warn!(client_id = %self.client_id, error = %e, "disconnecting inline");
            self.run_disconnect(quiesce_timeout, token);
        }
        Ok(())
    }

    fn run_disconnect(&self, quiesce_timeout: Duration, token: MqttToken) {
        info!(client_id = %self.client_id, "disconnecting");
        self.state.quiesce(quiesce_timeout);
        match self
            .state
            .send(self.dialect.disconnect(0), Some(token.clone()))
        {
            Ok(()) => {
                if let Err(e) = token.wait_until_sent(DISCONNECT_SEND_TIMEOUT) {
                    debug!(client_id = %self.client_id, error = %e, "DISCONNECT not sent");
                }
            }
            Err(e) => debug!(client_id = %self.client_id, error = %e, "DISCONNECT not queued"),
        }
        token.mark_complete(None, None);
        self.shutdown_connection(Some(token), None);
    }

    /// Synchronous disconnect with bounded waits. Works from any thread and
    /// in any connection state except closed.
    pub fn disconnect_forcibly(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
        send_disconnect: bool,
    ) -> MqttClientResult<()> {
        let connected = {
            let mut con = lock(&self.con);
            if con.state == ConnectionState::Closed {
                return Err(MqttClientError::ClientClosed);
            }
            con.should_be_connected = false;
            con.reconnect_epoch += 1;
            let connected = con.state == ConnectionState::Connected && !con.stopping;
            if connected {
                con.state = ConnectionState::Disconnecting;
            }
            connected
        };
        self.con_cond.notify_all();

        let mut end_token = None;
        if connected {
            if !quiesce_timeout.is_zero() {
                self.state.quiesce(quiesce_timeout);
            }
            if send_disconnect {
                let token = MqttToken::new();
                if self
                    .state
                    .send(self.dialect.disconnect(0), Some(token.clone()))
                    .is_ok()
                {
                    let _ = token.wait_until_sent(disconnect_timeout);
                }
                token.mark_complete(None, None);
                end_token = Some(token);
            }
        }
        self.shutdown_connection(end_token, None);
        Ok(())
    }

    /// The single shutdown path. Stops every worker, fails outstanding
    /// tokens with `reason`, completes `token` last and, for an unexpected
    /// loss, tells the application and schedules a reconnect.
    pub fn shutdown_connection(&self, token: Option<MqttToken>, reason: Option<MqttClientError>) {
        let was_connected = {
            let mut con = lock(&self.con);
            if con.stopping
                || matches!(
                    con.state,
                    ConnectionState::Disconnected | ConnectionState::Closed
                )
            {
                drop(con);
                if let Some(token) = token {
                    self.complete_end_token(&token, reason.as_ref());
                }
                return;
            }
            con.stopping = true;
            let was_connected = con.state == ConnectionState::Connected;
            con.state = ConnectionState::Disconnecting;
            was_connected
        };
        match &reason {
            Some(reason) if reason.is_fatal() => error!(client_id = %self.client_id, reason = %reason, "shutting down connection"),
            Some(reason) => info!(client_id = %self.client_id, reason = %reason, "shutting down connection"),
            None => debug!(client_id = %self.client_id, "shutting down connection"),
        }

        if let (Some(token), Some(reason)) = (&token, &reason) {
            token.set_error(reason.clone());
        }
        self.callback.stop();
        let network = lock(&self.con).network.take();
        if let Some(mut network) = network {
            network.stop();
        }
        self.receiver.stop();
        self.pinger.stop();
        self.drainer.stop(Some(DRAIN_STOP_TIMEOUT));

        self.token_store
            .quiesce(MqttClientError::ClientDisconnecting);
        for old in self.state.resolve_old_tokens(reason.as_ref()) {
            if token.as_ref().is_some_and(|t| t.ptr_eq(&old)) {
                continue;
            }
            self.callback.async_operation_complete(old);
        }
        self.state.disconnected();
        if self.options.clean_start {
            self.callback.remove_message_listeners();
        }
        self.sender.stop();

        let reconnect = {
            let mut con = lock(&self.con);
            con.state = ConnectionState::Disconnected;
            con.stopping = false;
            self.options.auto_reconnect
                && con.should_be_connected
                && reason.as_ref().is_some_and(MqttClientError::should_reconnect)
        };
        self.con_cond.notify_all();

        if let Some(token) = token {
            self.complete_end_token(&token, reason.as_ref());
        }
        if was_connected {
            if let Some(reason) = &reason {
                self.callback.connection_lost(reason);
            }
        }
        info!(client_id = %self.client_id, "disconnected");
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn complete_end_token(&self, token: &MqttToken, reason: Option<&MqttClientError>) {
        if token.is_complete() {
            return;
        }
        if !token.is_complete_pending() {
            token.mark_complete(token.response(), token.error().or_else(|| reason.cloned()));
        }
        self.callback.async_operation_complete(token.clone());
    }

    fn schedule_reconnect(&self) {
        let (delay, attempt, epoch) = {
            let mut con = lock(&self.con);
            let limit = self.options.max_reconnect_attempts;
            if limit > 0 && con.reconnect_attempts >= limit {
                warn!(client_id = %self.client_id, attempts = con.reconnect_attempts, "giving up reconnecting");
                con.should_be_connected = false;
                return;
            }
            let delay = reconnect_delay(
                self.options.reconnect_min_delay_ms,
                self.options.reconnect_max_delay_ms,
                con.reconnect_attempts,
            );
            con.reconnect_attempts += 1;
            (delay, con.reconnect_attempts, con.reconnect_epoch)
        };
        info!(client_id = %self.client_id, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name(format!("flowlink-rc-{}", self.client_id))
            .spawn(move || {
                let Some(comms) = me.upgrade() else {
                    return;
                };
                if comms.wait_for_reconnect(epoch, delay) {
                    if let Err(e) = comms.start_connect(MqttToken::new(), true) {
                        debug!(client_id = %comms.client_id, error = %e, "reconnect not started");
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(client_id = %self.client_id, error = %e, "reconnect thread not started");
        }
    }

    /// Sleeps out the backoff. False if the reconnect was cancelled.
    fn wait_for_reconnect(&self, epoch: u64, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut con = lock(&self.con);
        loop {
            if con.reconnect_epoch != epoch
                || con.state != ConnectionState::Disconnected
                || !con.should_be_connected
            {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            con = self
                .con_cond
                .wait_timeout(con, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Releases the client for good. Only allowed while disconnected.
    pub fn close(&self) -> MqttClientResult<()> {
        {
            let mut con = lock(&self.con);
            match con.state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Connected => return Err(MqttClientError::AlreadyConnected),
                ConnectionState::Connecting => return Err(MqttClientError::ConnectInProgress),
                ConnectionState::Disconnecting => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Disconnected if con.stopping => {
                    return Err(MqttClientError::ClientDisconnecting)
                }
                ConnectionState::Disconnected => {}
            }
            con.state = ConnectionState::Closed;
            con.should_be_connected = false;
            con.reconnect_epoch += 1;
        }
        self.con_cond.notify_all();
        self.drainer.stop(Some(DRAIN_STOP_TIMEOUT));
        self.callback.stop();
        self.token_store.quiesce(MqttClientError::ClientClosed);
        self.persistence.close()?;
        info!(client_id = %self.client_id, "client closed");
        Ok(())
    }
}

/// Wraps the application's listener on a connect token so that a successful
/// connect also starts draining the offline buffer.
struct ConnectListener {
    comms: Weak<ClientComms>,
    user: Option<Arc<dyn ActionListener>>,
    reconnect: bool,
}

impl ActionListener for ConnectListener {
    fn on_success(&self, token: &MqttToken) {
        if let Some(user) = &self.user {
            user.on_success(token);
        }
        if let Some(comms) = self.comms.upgrade() {
            comms
                .callback
                .connect_complete(self.reconnect, &comms.server_uri);
            comms.start_drain();
        }
    }

    fn on_failure(&self, token: &MqttToken, error: &MqttClientError) {
        if let Some(user) = &self.user {
            user.on_failure(token, error);
        }
    }
}
