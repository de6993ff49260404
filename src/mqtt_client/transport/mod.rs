//! Transport abstraction layer for MQTT connections
//!
//! A [`NetworkModule`] owns one blocking byte stream. The client splits it
//! into an independent reader (used by the receiver thread) and writer (used
//! by the sender thread); [`NetworkModule::stop`] must unblock a pending read.
//! Modules are produced by a [`NetworkModuleFactory`] selected at client
//! construction, so TLS or WebSocket support plugs in without touching the
//! session engine.

use std::io::{self, Read, Write};
use std::time::Duration;

pub mod tcp;

pub use tcp::TcpNetworkModule;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connect timed out")]
    Timeout,

    #[error("Transport not supported: {0}")]
    NotSupported(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type NetworkReader = Box<dyn Read + Send>;
pub type NetworkWriter = Box<dyn Write + Send>;

pub trait NetworkModule: Send {
    /// Establishes the connection.
    fn start(&mut self) -> Result<(), TransportError>;

    fn reader(&self) -> Result<NetworkReader, TransportError>;

    fn writer(&self) -> Result<NetworkWriter, TransportError>;

    /// Closes the connection. Must be idempotent.
    fn stop(&mut self);

    fn server_uri(&self) -> &str;
}

pub trait NetworkModuleFactory: Send + Sync {
    fn create(
        &self,
        server_uri: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn NetworkModule>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl UriScheme {
    fn default_port(self) -> u16 {
        match self {
            UriScheme::Tcp => 1883,
            UriScheme::Ssl => 8883,
            UriScheme::Ws => 80,
            UriScheme::Wss => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub scheme: UriScheme,
    pub host: String,
    pub port: u16,
    // websocket path, "/mqtt" when absent
    pub path: String,
}

impl ServerUri {
    pub fn parse(uri: &str) -> Result<ServerUri, TransportError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidAddress(uri.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => UriScheme::Tcp,
            "ssl" | "mqtts" | "tls" => UriScheme::Ssl,
            "ws" => UriScheme::Ws,
            "wss" => UriScheme::Wss,
            other => return Err(TransportError::NotSupported(other.to_string())),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/mqtt".to_string()),
        };
        if authority.is_empty() {
            return Err(TransportError::InvalidAddress(uri.to_string()));
        }

        // bracketed IPv6 literal
        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| TransportError::InvalidAddress(uri.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(TransportError::InvalidAddress(uri.to_string())),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), Some(p)),
                None => (authority.to_string(), None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidAddress(uri.to_string()))?,
            None => scheme.default_port(),
        };

        Ok(ServerUri {
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Plain TCP only; secure and websocket schemes need a custom factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNetworkModuleFactory;

impl NetworkModuleFactory for DefaultNetworkModuleFactory {
    fn create(
        &self,
        server_uri: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn NetworkModule>, TransportError> {
        let uri = ServerUri::parse(server_uri)?;
        match uri.scheme {
            UriScheme::Tcp => Ok(Box::new(TcpNetworkModule::new(
                server_uri,
                uri,
                connect_timeout,
            ))),
            scheme => Err(TransportError::NotSupported(format!(
                "{:?} transport requires a custom NetworkModuleFactory",
                scheme
            ))),
        }
    }
}
