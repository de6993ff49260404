use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowlink::mqtt_client::persistence::FilePersistence;
use flowlink::{
    AsyncMqttClient, CallbackError, MqttCallback, MqttClientError, MqttClientOptions, MqttMessage,
    MqttToken,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: flowlink-client <server-uri> <topic> [message] [qos]

Publishes <message> to <topic>, or subscribes to <topic> and prints
arrivals when no message is given.

FLOWLINK_CONFIG   path to a JSON client options file
FLOWLINK_STORE    directory for file persistence (in-memory if unset)
RUST_LOG          log filter, default \"info\"";

struct Printer;

impl MqttCallback for Printer {
    fn connection_lost(&self, cause: &MqttClientError) {
        warn!(cause = %cause, "connection lost");
    }

    fn message_arrived(&self, topic: &str, message: &MqttMessage) -> Result<(), CallbackError> {
        match message.payload_str() {
            Some(text) => println!("{} [qos {}] {}", topic, message.qos, text),
            None => println!("{} [qos {}] {}", topic, message.qos, hex::encode(&message.payload)),
        }
        Ok(())
    }

    fn delivery_complete(&self, token: &MqttToken) {
        info!(id = ?token.message_id(), "delivered");
    }

    fn connect_complete(&self, reconnect: bool, server_uri: &str) {
        info!(reconnect, server_uri, "connected");
    }
}

fn load_options() -> Result<MqttClientOptions, Box<dyn std::error::Error>> {
    match env::var("FLOWLINK_CONFIG") {
        Ok(path) => Ok(MqttClientOptions::from_json_str(&fs::read_to_string(path)?)?),
        Err(_) => Ok(MqttClientOptions::builder()
            .client_id(format!("flowlink-{}", std::process::id()))
            .build()?),
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (uri, topic) = match args {
        [uri, topic, ..] => (uri.as_str(), topic.as_str()),
        _ => {
            eprintln!("{}", USAGE);
            return Err("missing arguments".into());
        }
    };
    let message = args.get(2);
    let qos: u8 = match args.get(3) {
        Some(q) => q.parse()?,
        None => 1,
    };

    let options = load_options()?;
    let client = match env::var("FLOWLINK_STORE") {
        Ok(dir) => AsyncMqttClient::with_persistence(
            uri,
            options,
            Arc::new(FilePersistence::new(dir)),
        )?,
        Err(_) => AsyncMqttClient::new(uri, options)?,
    };
    client.set_callback(Arc::new(Printer));
    client.connect()?.wait_for_completion(None)?;

    match message {
        Some(message) => {
            let token = client.publish(topic, message.as_bytes().to_vec(), qos, false)?;
            token.wait_for_completion(Some(Duration::from_secs(30)))?;
            info!(topic, qos, "published");
            client.disconnect()?.wait_for_completion(None)?;
        }
        None => {
            client
                .subscribe(topic, qos)?
                .wait_for_completion(Some(Duration::from_secs(30)))?;
            info!(topic, qos, "subscribed, waiting for messages");
            loop {
                thread::park_timeout(Duration::from_secs(3600));
            }
        }
    }
    client.close()?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "flowlink-client failed");
            ExitCode::FAILURE
        }
    }
}
