// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::callback::{MessageListener, MqttCallback};
use super::comms::{ClientComms, ConnectionState};
use super::error::{MqttClientError, MqttClientResult};
use super::message::MqttMessage;
use super::opts::MqttClientOptions;
use super::persistence::{MemoryPersistence, MqttClientPersistence};
use super::token::{ActionListener, MqttToken};
use super::transport::{DefaultNetworkModuleFactory, NetworkModuleFactory};
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::subscribe::{MqttSubscribe, MqttUnsubscribe, TopicSubscription};
use crate::mqtt_serde::topic::{validate_topic_filter, validate_topic_name};

const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Non-blocking MQTT client.
///
/// Every operation queues its work and returns an [`MqttToken`] right away;
/// wait on the token or attach an [`ActionListener`] to learn the outcome.
/// Arrived messages and connection events are reported through an
/// [`MqttCallback`] registered with [`AsyncMqttClient::set_callback`].
///
/// ```no_run
/// use flowlink::{AsyncMqttClient, MqttClientOptions};
///
/// let options = MqttClientOptions::builder().client_id("sensor-1").build()?;
/// let client = AsyncMqttClient::new("tcp://localhost:1883", options)?;
/// client.connect()?.wait_for_completion(None)?;
/// client
///     .publish("sensors/1/temp", b"21.5".to_vec(), 1, false)?
///     .wait_for_completion(None)?;
/// client.disconnect()?.wait_for_completion(None)?;
/// # Ok::<(), flowlink::MqttClientError>(())
/// ```
pub struct AsyncMqttClient {
    comms: Arc<ClientComms>,
}

impl AsyncMqttClient {
    /// Client with in-memory persistence and plain TCP transport.
    pub fn new(server_uri: &str, options: MqttClientOptions) -> MqttClientResult<Self> {
        Self::with_persistence(server_uri, options, Arc::new(MemoryPersistence::new()))
    }

    /// Restores any session left in `persistence` by an earlier instance.
    pub fn with_persistence(
        server_uri: &str,
        options: MqttClientOptions,
        persistence: Arc<dyn MqttClientPersistence>,
    ) -> MqttClientResult<Self> {
        Self::with_network_factory(
            server_uri,
            options,
            persistence,
            Arc::new(DefaultNetworkModuleFactory),
        )
    }

    pub fn with_network_factory(
        server_uri: &str,
        options: MqttClientOptions,
        persistence: Arc<dyn MqttClientPersistence>,
        factory: Arc<dyn NetworkModuleFactory>,
    ) -> MqttClientResult<Self> {
        let comms = ClientComms::new(server_uri, options, persistence, factory)?;
        Ok(AsyncMqttClient { comms })
    }

    pub fn client_id(&self) -> &str {
        self.comms.client_id()
    }

    pub fn server_uri(&self) -> &str {
        self.comms.server_uri()
    }

    pub fn is_connected(&self) -> bool {
        self.comms.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.comms.connection_state()
    }

    pub fn set_callback(&self, callback: Arc<dyn MqttCallback>) {
        self.comms.callback().set_callback(Some(callback));
    }

    pub fn clear_callback(&self) {
        self.comms.callback().set_callback(None);
    }

    pub fn connect(&self) -> MqttClientResult<MqttToken> {
        let token = MqttToken::new();
        self.comms.connect(token.clone())?;
        Ok(token)
    }

    pub fn connect_with_listener(
        &self,
        listener: Arc<dyn ActionListener>,
    ) -> MqttClientResult<MqttToken> {
        let token = MqttToken::new();
        token.set_action_listener(listener);
        self.comms.connect(token.clone())?;
        Ok(token)
    }

    /// Connects now, cancelling a scheduled automatic reconnect.
    pub fn reconnect(&self) -> MqttClientResult<MqttToken> {
        self.comms.reconnect()
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> MqttClientResult<MqttToken> {
        self.publish_message(&MqttMessage::new(topic, payload, qos).with_retain(retain))
    }

    /// While disconnected the message goes to the offline buffer if one is
    /// configured; otherwise the call fails.
    pub fn publish_message(&self, message: &MqttMessage) -> MqttClientResult<MqttToken> {
        validate_qos(message.qos)?;
        validate_topic_name(&message.topic).map_err(|e| invalid_topic(e.to_string()))?;
        let token = MqttToken::new();
        self.comms.send_publish(message.to_publish(), token.clone())?;
        Ok(token)
    }

    pub fn subscribe(&self, topic_filter: &str, qos: u8) -> MqttClientResult<MqttToken> {
        self.subscribe_many(&[(topic_filter, qos)])
    }

    pub fn subscribe_many(&self, filters: &[(&str, u8)]) -> MqttClientResult<MqttToken> {
        if filters.is_empty() {
            return Err(invalid_topic("at least one topic filter is required".to_string()));
        }
        let mut subscriptions = Vec::with_capacity(filters.len());
        for (filter, qos) in filters {
            validate_qos(*qos)?;
            validate_topic_filter(filter).map_err(|e| invalid_topic(e.to_string()))?;
            subscriptions.push(TopicSubscription::new(*filter, *qos));
        }
        let token = MqttToken::new();
        self.comms.send_control(
            MqttPacket::Subscribe(MqttSubscribe::new(subscriptions)),
            token.clone(),
        )?;
        Ok(token)
    }

    /// Messages matching `topic_filter` go to `listener` instead of
    /// [`MqttCallback::message_arrived`].
    pub fn subscribe_with_listener(
        &self,
        topic_filter: &str,
        qos: u8,
        listener: MessageListener,
    ) -> MqttClientResult<MqttToken> {
        validate_topic_filter(topic_filter).map_err(|e| invalid_topic(e.to_string()))?;
        self.comms
            .callback()
            .set_message_listener(topic_filter, listener);
        self.subscribe(topic_filter, qos).map_err(|e| {
            self.comms.callback().remove_message_listener(topic_filter);
            e
        })
    }

    pub fn unsubscribe(&self, topic_filter: &str) -> MqttClientResult<MqttToken> {
        validate_topic_filter(topic_filter).map_err(|e| invalid_topic(e.to_string()))?;
        let token = MqttToken::new();
        self.comms.send_control(
            MqttPacket::Unsubscribe(MqttUnsubscribe::new(vec![topic_filter.to_string()])),
            token.clone(),
        )?;
        self.comms.callback().remove_message_listener(topic_filter);
        Ok(token)
    }

    /// Quiesces for the configured quiesce timeout, then disconnects.
    pub fn disconnect(&self) -> MqttClientResult<MqttToken> {
        self.disconnect_with_timeout(Duration::from_millis(
            self.comms.options().quiesce_timeout_ms,
        ))
    }

    /// Lets in-flight work finish for up to `quiesce_timeout` before sending
    /// DISCONNECT. Not allowed from a callback.
    pub fn disconnect_with_timeout(&self, quiesce_timeout: Duration) -> MqttClientResult<MqttToken> {
        let token = MqttToken::new();
        self.comms.disconnect(quiesce_timeout, token.clone())?;
        Ok(token)
    }

    /// Disconnects synchronously, bounding both the quiesce and the
    /// DISCONNECT write. Usable from callbacks.
    pub fn disconnect_forcibly(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> MqttClientResult<()> {
        self.comms
            .disconnect_forcibly(quiesce_timeout, disconnect_timeout, true)
    }

    /// Releases the client. It must be disconnected first.
    pub fn close(&self) -> MqttClientResult<()> {
        self.comms.close()
    }

    /// Publishes whose delivery is still outstanding, including those
    /// restored from persistence.
    pub fn pending_delivery_tokens(&self) -> Vec<MqttToken> {
        self.comms.token_store().outstanding_delivery_tokens()
    }

    pub fn buffered_message_count(&self) -> usize {
        self.comms.buffer().map_or(0, |b| b.len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.comms.state().actual_in_flight()
    }
}

impl Drop for AsyncMqttClient {
    fn drop(&mut self) {
        if self.comms.connection_state() == ConnectionState::Closed {
            return;
        }
        debug!(client_id = %self.comms.client_id(), "client dropped, shutting down");
        let _ = self
            .comms
            .disconnect_forcibly(Duration::ZERO, DEFAULT_DISCONNECT_TIMEOUT, false);
        let _ = self.comms.close();
    }
}

fn validate_qos(qos: u8) -> MqttClientResult<()> {
    if qos > 2 {
        return Err(MqttClientError::InvalidConfiguration {
            field: "qos".to_string(),
            reason: format!("{} is not 0, 1 or 2", qos),
        });
    }
    Ok(())
}

fn invalid_topic(reason: String) -> MqttClientError {
    MqttClientError::InvalidConfiguration {
        field: "topic".to_string(),
        reason,
    }
}
