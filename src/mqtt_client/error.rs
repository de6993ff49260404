// SPDX-License-Identifier: MPL-2.0

//! Error types for MQTT client operations
//!
//! Every failure that reaches the application, whether returned from an API
//! call or stored on a token, is an [`MqttClientError`]. The classification
//! helpers drive the shutdown and reconnect decisions inside the client.

use crate::mqtt_client::persistence::PersistenceError;
use crate::mqtt_client::transport::TransportError;
use crate::mqtt_serde::parser::ParseError;
use std::fmt;
use std::io;

#[derive(Debug, Clone, serde::Serialize)]
pub enum MqttClientError {
    // ==================== Connection Errors ====================
    /// Connection refused by broker with return/reason code
    ConnectionRefused {
        reason_code: u8,
        description: String,
    },

    /// Connection lost unexpectedly
    ConnectionLost { reason: String },

    /// Network I/O error occurred
    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    /// No packet arrived within keep-alive plus tolerance after a PINGREQ
    ClientTimeout { keep_alive_secs: u16 },

    /// Nothing could be written for twice the keep-alive interval
    WriteTimeout { idle_ms: u64 },

    /// The broker sent DISCONNECT (MQTT 5.0)
    ServerDisconnected {
        reason_code: u8,
        reason_string: Option<String>,
    },

    // ==================== Protocol Errors ====================
    /// MQTT protocol violation detected
    ProtocolViolation { message: String },

    /// Failed to parse MQTT packet
    PacketParsing {
        parse_error: String,
        raw_data: Vec<u8>,
    },

    // ==================== Resource Errors ====================
    /// Packet ID space exhausted (all 65535 IDs in use)
    PacketIdExhausted,

    /// The in-flight window is full
    MaxInflight { limit: usize },

    /// Buffer is full, cannot accept more data
    BufferFull {
        buffer_type: String,
        capacity: usize,
    },

    /// A buffered message was evicted to make room for a newer one
    MessageDiscarded,

    // ==================== Operation Errors ====================
    /// Operation timed out waiting for response
    OperationTimeout { operation: String, timeout_ms: u64 },

    /// PUBLISH operation failed
    PublishFailed {
        packet_id: Option<u16>,
        reason_code: u8,
        reason_string: Option<String>,
    },

    /// SUBSCRIBE operation failed
    SubscribeFailed {
        topics: Vec<String>,
        reason_codes: Vec<u8>,
    },

    /// UNSUBSCRIBE operation failed
    UnsubscribeFailed {
        topics: Vec<String>,
        reason_codes: Vec<u8>,
    },

    // ==================== State Errors ====================
    /// Not connected to broker
    NotConnected,

    /// Already connected to broker
    AlreadyConnected,

    /// A connect attempt is already running
    ConnectInProgress,

    /// The client is disconnecting and accepts no new work
    ClientDisconnecting,

    /// The client has been closed
    ClientClosed,

    /// disconnect was called from a callback running on the dispatcher thread
    DisconnectProhibited,

    // ==================== Collaborator Errors ====================
    /// The persistence store failed
    Persistence { message: String },

    /// Application callback returned an error or panicked
    CallbackFailed { message: String },

    // ==================== Configuration Errors ====================
    /// Invalid client configuration
    InvalidConfiguration { field: String, reason: String },

    // ==================== Internal Errors ====================
    /// Internal client error (should not happen)
    InternalError { message: String },
}

impl MqttClientError {
    /// Whether losing the connection for this reason should lead to an
    /// automatic reconnect. Only authentication refusals and the client's
    /// own shutdown rule it out; protocol and callback failures end the
    /// connection, not the session.
    pub fn should_reconnect(&self) -> bool {
        !self.is_auth_error()
            && !matches!(
                self,
                Self::ClientClosed | Self::ClientDisconnecting | Self::InvalidConfiguration { .. }
            )
    }

    /// Returns true if the error is fatal (client should stop)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration { .. }
                | Self::ProtocolViolation { .. }
                | Self::InternalError { .. }
                | Self::ClientClosed
        )
    }

    /// Returns true if the error is related to authentication
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused {
                // v3.1.1 bad credentials / not authorized, v5 equivalents
                reason_code: 0x04 | 0x05 | 0x86 | 0x87 | 0x8C,
                ..
            }
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionRefused {
                reason_code,
                description,
            } => {
                format!(
                    "Connection refused by broker: {} (code: 0x{:02X})",
                    description, reason_code
                )
            }
            Self::ConnectionLost { reason } => {
                format!("Connection to broker lost: {}", reason)
            }
            Self::NetworkError { kind, message } => {
                format!("Network error ({:?}): {}", kind, message)
            }
            Self::ClientTimeout { keep_alive_secs } => {
                format!(
                    "No response from broker within keep-alive ({}s)",
                    keep_alive_secs
                )
            }
            Self::WriteTimeout { idle_ms } => {
                format!("Nothing written to the network for {} ms", idle_ms)
            }
            Self::ServerDisconnected {
                reason_code,
                reason_string,
            } => {
                let reason_str = reason_string
                    .as_ref()
                    .map(|s| format!(": {}", s))
                    .unwrap_or_default();
                format!(
                    "Broker closed the session - code: 0x{:02X}{}",
                    reason_code, reason_str
                )
            }
            Self::ProtocolViolation { message } => {
                format!("MQTT protocol violation: {}", message)
            }
            Self::PacketParsing {
                parse_error,
                raw_data,
            } => {
                let data_preview = if raw_data.len() > 20 {
                    format!(
                        "{}... ({} bytes)",
                        hex::encode(&raw_data[..20]),
                        raw_data.len()
                    )
                } else {
                    hex::encode(raw_data)
                };
                format!(
                    "Failed to parse MQTT packet: {} (data: {})",
                    parse_error, data_preview
                )
            }
            Self::PacketIdExhausted => {
                "All packet identifiers are in use. Wait for pending operations to complete."
                    .to_string()
            }
            Self::MaxInflight { limit } => {
                format!("Too many publishes in flight (limit: {})", limit)
            }
            Self::BufferFull {
                buffer_type,
                capacity,
            } => {
                format!(
                    "{} buffer full (capacity: {}). Try again later.",
                    buffer_type, capacity
                )
            }
            Self::MessageDiscarded => {
                "Message discarded from the offline buffer".to_string()
            }
            Self::OperationTimeout {
                operation,
                timeout_ms,
            } => {
                format!(
                    "Operation '{}' timed out after {} ms",
                    operation, timeout_ms
                )
            }
            Self::PublishFailed {
                packet_id,
                reason_code,
                reason_string,
            } => {
                let id_str = packet_id
                    .map(|id| format!(" (packet ID: {})", id))
                    .unwrap_or_default();
                let reason_str = reason_string
                    .as_ref()
                    .map(|s| format!(": {}", s))
                    .unwrap_or_default();
                format!(
                    "Publish failed{} - code: 0x{:02X}{}",
                    id_str, reason_code, reason_str
                )
            }
            Self::SubscribeFailed {
                topics,
                reason_codes,
            } => {
                format!(
                    "Subscribe failed for topics {:?} with reason codes: {:?}",
                    topics, reason_codes
                )
            }
            Self::UnsubscribeFailed {
                topics,
                reason_codes,
            } => {
                format!(
                    "Unsubscribe failed for topics {:?} with reason codes: {:?}",
                    topics, reason_codes
                )
            }
            Self::NotConnected => "Not connected to broker. Call connect() first.".to_string(),
            Self::AlreadyConnected => "Already connected to broker.".to_string(),
            Self::ConnectInProgress => "A connect attempt is already in progress.".to_string(),
            Self::ClientDisconnecting => "Client is currently disconnecting.".to_string(),
            Self::ClientClosed => "Client has been closed.".to_string(),
            Self::DisconnectProhibited => {
                "Disconnect is not allowed from within a client callback.".to_string()
            }
            Self::Persistence { message } => {
                format!("Persistence failure: {}", message)
            }
            Self::CallbackFailed { message } => {
                format!("Application callback failed: {}", message)
            }
            Self::InvalidConfiguration { field, reason } => {
                format!("Invalid configuration for '{}': {}", field, reason)
            }
            Self::InternalError { message } => {
                format!("Internal error: {}", message)
            }
        }
    }

    /// Convert from io::Error with context
    pub fn from_io_error(error: io::Error, context: &str) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: format!("{}: {}", context, error),
        }
    }

    pub fn from_parse_error_with_data(error: ParseError, raw_data: &[u8]) -> Self {
        Self::PacketParsing {
            parse_error: error.to_string(),
            raw_data: raw_data.iter().take(100).copied().collect(),
        }
    }

    /// Maps a CONNACK return/reason code to a refusal.
    pub fn connection_refused(reason_code: u8) -> Self {
        let description = match reason_code {
            0x01 => "unacceptable protocol version",
            0x02 => "identifier rejected",
            0x03 => "server unavailable",
            0x04 => "bad user name or password",
            0x05 => "not authorized",
            0x80 => "unspecified error",
            0x84 => "unsupported protocol version",
            0x85 => "client identifier not valid",
            0x86 => "bad user name or password",
            0x87 => "not authorized",
            0x88 => "server unavailable",
            0x89 => "server busy",
            0x8A => "banned",
            0x8C => "bad authentication method",
            0x97 => "quota exceeded",
            0x9F => "connection rate exceeded",
            _ => "refused",
        };
        Self::ConnectionRefused {
            reason_code,
            description: description.to_string(),
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<MqttClientError> for io::Error {
    fn from(error: MqttClientError) -> Self {
        match error {
            MqttClientError::OperationTimeout {
                operation,
                timeout_ms,
            } => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} operation timed out after {}ms", operation, timeout_ms),
            ),
            MqttClientError::NetworkError { kind, message } => io::Error::new(kind, message),
            MqttClientError::ConnectionLost { reason } => {
                io::Error::new(io::ErrorKind::ConnectionReset, reason)
            }
            MqttClientError::NotConnected => io::Error::new(
                io::ErrorKind::NotConnected,
                "Client is not connected to broker",
            ),
            e @ (MqttClientError::BufferFull { .. } | MqttClientError::MaxInflight { .. }) => {
                io::Error::new(io::ErrorKind::WouldBlock, e.to_string())
            }
            MqttClientError::InvalidConfiguration { field, reason } => io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid configuration for '{}': {}", field, reason),
            ),
            MqttClientError::ProtocolViolation { message } => {
                io::Error::new(io::ErrorKind::InvalidData, message)
            }
            MqttClientError::PacketParsing { parse_error, .. } => {
                io::Error::new(io::ErrorKind::InvalidData, parse_error)
            }
            other => io::Error::other(other.to_string()),
        }
    }
}

impl From<ParseError> for MqttClientError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::IoError(e) => Self::from(e),
            other => Self::PacketParsing {
                parse_error: other.to_string(),
                raw_data: Vec::new(),
            },
        }
    }
}

impl From<PersistenceError> for MqttClientError {
    fn from(error: PersistenceError) -> Self {
        Self::Persistence {
            message: error.to_string(),
        }
    }
}

impl From<TransportError> for MqttClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(e) => Self::from(e),
            TransportError::Timeout => Self::NetworkError {
                kind: io::ErrorKind::TimedOut,
                message: "connect timed out".to_string(),
            },
            other => Self::NetworkError {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }
}

/// Type alias for Result with MqttClientError
pub type MqttClientResult<T> = Result<T, MqttClientError>;
