//! Blocking MQTT client built around a persistent session engine.
//!
//! [`AsyncMqttClient`] is the entry point. Operations return an
//! [`MqttToken`] immediately; network I/O, keep-alive and application
//! callbacks each run on their own thread.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod async_client;
pub mod callback;
pub mod comms;
pub mod dialect;
pub mod error;
pub mod message;
pub mod offline_buffer;
pub mod opts;
pub mod persistence;
pub mod ping;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod token;
pub mod token_store;
pub mod transport;
pub mod worker;

pub use async_client::AsyncMqttClient;
pub use callback::{CallbackError, MessageListener, MqttCallback};
pub use comms::ConnectionState;
pub use error::{MqttClientError, MqttClientResult};
pub use message::MqttMessage;
pub use opts::{DisconnectedBufferOptions, MqttClientOptions};
pub use persistence::{
    FilePersistence, MemoryPersistence, MqttClientPersistence, PersistenceError,
};
pub use token::{ActionListener, MqttToken, UserContext};
pub use transport::{
    DefaultNetworkModuleFactory, NetworkModule, NetworkModuleFactory, NetworkReader,
    NetworkWriter, TransportError,
};

/// Locks `mutex`, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
