// SPDX-License-Identifier: MPL-2.0

//! TCP transport implementation

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::{NetworkModule, NetworkReader, NetworkWriter, ServerUri, TransportError};

pub struct TcpNetworkModule {
    server_uri: String,
    target: ServerUri,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpNetworkModule {
    pub fn new(server_uri: &str, target: ServerUri, connect_timeout: Duration) -> Self {
        TcpNetworkModule {
            server_uri: server_uri.to_string(),
            target,
            connect_timeout,
            stream: None,
        }
    }

    fn stream(&self) -> Result<&TcpStream, TransportError> {
        self.stream
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionFailed("not started".to_string()))
    }
}

impl NetworkModule for TcpNetworkModule {
    fn start(&mut self) -> Result<(), TransportError> {
        let addrs = (self.target.host.as_str(), self.target.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", self.target.host, e)))?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = if self.connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, self.connect_timeout)
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, "tcp connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout,
            Some(e) => TransportError::ConnectionFailed(format!(
                "TCP connection to {} failed: {}",
                self.target.address(),
                e
            )),
            None => TransportError::InvalidAddress(self.target.address()),
        })
    }

    fn reader(&self) -> Result<NetworkReader, TransportError> {
        Ok(Box::new(self.stream()?.try_clone()?))
    }

    fn writer(&self) -> Result<NetworkWriter, TransportError> {
        Ok(Box::new(self.stream()?.try_clone()?))
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            // unblocks the receiver's read on the cloned handle
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn server_uri(&self) -> &str {
        &self.server_uri
    }
}
