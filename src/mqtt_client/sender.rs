//! Sender worker: takes packets from the session engine and writes them to
//! the network.

use std::io::{self, Write};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::comms::ClientComms;
use super::error::MqttClientError;
use super::state::ClientState;
use super::transport::NetworkWriter;
use super::worker::{WorkerControl, WorkerHandle};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CommsSender {
    client_id: String,
    control: Arc<WorkerControl>,
}

impl CommsSender {
    pub fn new(client_id: &str) -> Self {
        CommsSender {
            client_id: client_id.to_string(),
            control: WorkerControl::new("sender"),
        }
    }

    pub fn start(
        &self,
        state: Arc<ClientState>,
        writer: NetworkWriter,
        comms: Weak<ClientComms>,
    ) -> io::Result<()> {
        let client_id = self.client_id.clone();
        self.control.start(
            format!("flowlink-snd-{}", self.client_id),
            move |handle| run(handle, client_id, state, writer, comms),
        )?;
        Ok(())
    }

    /// The session engine must already be disconnected, otherwise the sender
    /// stays parked waiting for work until the timeout.
    pub fn stop(&self) {
        self.control.stop(Some(STOP_TIMEOUT));
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }
}

fn run(
    handle: WorkerHandle,
    client_id: String,
    state: Arc<ClientState>,
    mut writer: NetworkWriter,
    comms: Weak<ClientComms>,
) {
    let version = state.mqtt_version();
    while handle.is_running() {
        let Some(packet) = state.get() else {
            break;
        };
        let token = state.token_for_outbound(&packet);
        let written = {
            // an ack for this packet waits until notify_sent has run
            let _io = token.as_ref().map(|t| t.io_guard());
            packet
                .to_bytes(version)
                .map_err(MqttClientError::from)
                .and_then(|bytes| {
                    writer.write_all(&bytes)?;
                    writer.flush()?;
                    trace!(client_id = %client_id, packet = packet.name(), id = ?packet.packet_id(), len = bytes.len(), "sent");
                    Ok(())
                })
                .map(|()| state.notify_sent(&packet))
        };
        if let Err(e) = written {
            warn!(client_id = %client_id, error = %e, packet = packet.name(), "send failed");
            if let Some(comms) = comms.upgrade() {
                comms.shutdown_connection(None, Some(e));
            }
            break;
        }
    }
    debug!(client_id = %client_id, "sender stopped");
}
