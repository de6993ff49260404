pub mod mqtt_client;
pub mod mqtt_serde;

pub use mqtt_client::{
    ActionListener, AsyncMqttClient, CallbackError, ConnectionState, DisconnectedBufferOptions,
    FilePersistence, MemoryPersistence, MessageListener, MqttCallback, MqttClientError,
    MqttClientOptions, MqttClientPersistence, MqttClientResult, MqttMessage, MqttToken,
};
