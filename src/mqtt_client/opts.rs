use serde::{Deserialize, Serialize};

use crate::mqtt_client::error::{MqttClientError, MqttClientResult};
use crate::mqtt_serde::connect::Will;
use crate::mqtt_serde::{MQTT_V311, MQTT_V5};

/// Offline buffering of publishes while the client is disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectedBufferOptions {
    pub enabled: bool,
    pub buffer_size: usize,
    // also store buffered messages in persistence so they survive a restart
    pub persist_buffer: bool,
    // when full, evict the oldest message instead of rejecting the new one
    pub delete_oldest_messages: bool,
}

impl Default for DisconnectedBufferOptions {
    fn default() -> Self {
        DisconnectedBufferOptions {
            enabled: false,
            buffer_size: 5000,
            persist_buffer: false,
            delete_oldest_messages: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttClientOptions {
    pub client_id: String,
    // 4 = MQTT v3.1.1, 5 = MQTT v5.0
    pub mqtt_version: u8,
    // seconds, 0 disables keep-alive
    pub keep_alive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub max_inflight: usize,
    pub connection_timeout_ms: u64,
    pub quiesce_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    // 0 = unlimited
    pub max_reconnect_attempts: u32,
    pub max_callback_queue: usize,
    pub callback_stop_timeout_ms: u64,
    pub session_expiry_interval: Option<u32>,
    pub disconnected_buffer: DisconnectedBufferOptions,
}

impl Default for MqttClientOptions {
    fn default() -> Self {
        MqttClientOptions {
            client_id: String::new(),
            mqtt_version: MQTT_V311,
            keep_alive: 60,
            clean_start: true,
            username: None,
            password: None,
            will: None,
            max_inflight: 10,
            connection_timeout_ms: 30_000,
            quiesce_timeout_ms: 30_000,
            auto_reconnect: false,
            reconnect_min_delay_ms: 1_000,
            reconnect_max_delay_ms: 128_000,
            max_reconnect_attempts: 0,
            max_callback_queue: 10,
            callback_stop_timeout_ms: 5_000,
            session_expiry_interval: None,
            disconnected_buffer: DisconnectedBufferOptions::default(),
        }
    }
}

impl MqttClientOptions {
    pub fn builder() -> MqttClientOptionsBuilder {
        MqttClientOptionsBuilder {
            options: MqttClientOptions::default(),
        }
    }

    /// Loads options from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> MqttClientResult<Self> {
        let options: MqttClientOptions =
            serde_json::from_str(json).map_err(|e| MqttClientError::InvalidConfiguration {
                field: "json".to_string(),
                reason: e.to_string(),
            })?;
        options.validate()?;
        Ok(options)
    }

    pub fn is_v5(&self) -> bool {
        self.mqtt_version == MQTT_V5
    }

    pub fn validate(&self) -> MqttClientResult<()> {
        fn invalid(field: &str, reason: &str) -> MqttClientResult<()> {
            Err(MqttClientError::InvalidConfiguration {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        }

        if self.mqtt_version != MQTT_V311 && self.mqtt_version != MQTT_V5 {
            return invalid("mqtt_version", "must be 4 (v3.1.1) or 5 (v5.0)");
        }
        if self.max_inflight == 0 || self.max_inflight > u16::MAX as usize {
            return invalid("max_inflight", "must be between 1 and 65535");
        }
        if self.max_callback_queue == 0 {
            return invalid("max_callback_queue", "must be greater than 0");
        }
        if self.disconnected_buffer.enabled && self.disconnected_buffer.buffer_size == 0 {
            return invalid("disconnected_buffer.buffer_size", "must be greater than 0");
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return invalid(
                "reconnect_min_delay_ms",
                "must not exceed reconnect_max_delay_ms",
            );
        }
        if self.client_id.is_empty() && !self.clean_start && !self.is_v5() {
            // v3.1.1 brokers reject a persistent session without an identifier
            return invalid("client_id", "required when clean_start is false");
        }
        if let Some(will) = &self.will {
            if will.qos > 2 {
                return invalid("will.qos", "must be 0, 1 or 2");
            }
        }
        Ok(())
    }
}

pub struct MqttClientOptionsBuilder {
    options: MqttClientOptions,
}

impl MqttClientOptionsBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = client_id.into();
        self
    }

    pub fn mqtt_version(mut self, version: u8) -> Self {
        self.options.mqtt_version = version;
        self
    }

    pub fn keep_alive(mut self, secs: u16) -> Self {
        self.options.keep_alive = secs;
        self
    }

    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.options.clean_start = clean_start;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.options.will = Some(will);
        self
    }

    pub fn max_inflight(mut self, max: usize) -> Self {
        self.options.max_inflight = max;
        self
    }

    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.options.connection_timeout_ms = ms;
        self
    }

    pub fn quiesce_timeout_ms(mut self, ms: u64) -> Self {
        self.options.quiesce_timeout_ms = ms;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.options.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay_ms(mut self, min: u64, max: u64) -> Self {
        self.options.reconnect_min_delay_ms = min;
        self.options.reconnect_max_delay_ms = max;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.max_reconnect_attempts = attempts;
        self
    }

    pub fn max_callback_queue(mut self, max: usize) -> Self {
        self.options.max_callback_queue = max;
        self
    }

    pub fn callback_stop_timeout_ms(mut self, ms: u64) -> Self {
        self.options.callback_stop_timeout_ms = ms;
        self
    }

    pub fn session_expiry_interval(mut self, secs: u32) -> Self {
        self.options.session_expiry_interval = Some(secs);
        self
    }

    pub fn disconnected_buffer(mut self, buffer: DisconnectedBufferOptions) -> Self {
        self.options.disconnected_buffer = buffer;
        self
    }

    pub fn build(self) -> MqttClientResult<MqttClientOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
