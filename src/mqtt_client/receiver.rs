//! Receiver worker: reads packets off the network and feeds them to the
//! session engine.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::comms::ClientComms;
use super::error::MqttClientError;
use super::state::{ClientState, StateEvent};
use super::transport::NetworkReader;
use super::worker::{WorkerControl, WorkerHandle, WorkerState};
use crate::mqtt_serde::parser::stream::MqttStream;
use crate::mqtt_serde::parser::ParseError;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CommsReceiver {
    client_id: String,
    control: Arc<WorkerControl>,
}

impl CommsReceiver {
    pub fn new(client_id: &str) -> Self {
        CommsReceiver {
            client_id: client_id.to_string(),
            control: WorkerControl::new("receiver"),
        }
    }

    pub fn start(
        &self,
        state: Arc<ClientState>,
        reader: NetworkReader,
        comms: Weak<ClientComms>,
    ) -> io::Result<()> {
        let client_id = self.client_id.clone();
        self.control.start(
            format!("flowlink-rcv-{}", self.client_id),
            move |handle| run(handle, client_id, state, reader, comms),
        )?;
        Ok(())
    }

    /// The network must be closed first so that a pending read returns.
    pub fn stop(&self) {
        self.control.stop(Some(STOP_TIMEOUT));
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// True while blocked in a network read.
    pub fn is_receiving(&self) -> bool {
        self.control.state() == WorkerState::Receiving
    }
}

fn run(
    handle: WorkerHandle,
    client_id: String,
    state: Arc<ClientState>,
    reader: NetworkReader,
    comms: Weak<ClientComms>,
) {
    let mut stream = MqttStream::new(reader, READ_BUFFER_SIZE, state.mqtt_version());
    let mut cause = None;

    while handle.is_running() {
        handle.set_state(WorkerState::Receiving);
        let read = stream.read_packet();
        handle.set_state(WorkerState::Running);

        let packet = match read {
            Ok(Some((packet, consumed))) => {
                trace!(client_id = %client_id, packet = packet.name(), id = ?packet.packet_id(), len = consumed, "received");
                packet
            }
            Ok(None) => {
                cause = Some(MqttClientError::ConnectionLost {
                    reason: "connection closed by server".to_string(),
                });
                break;
            }
            Err(ParseError::IoError(e)) => {
                cause = Some(MqttClientError::from_io_error(e, "read"));
                break;
            }
            Err(e) => {
                cause = Some(MqttClientError::from(e));
                break;
            }
        };

        let event = if packet.is_ack() {
            let token = state.token_store().get_for_packet(&packet);
            // serialises against the sender still finishing this token's write
            let _io = token.as_ref().map(|t| t.io_guard());
            state.notify_received_ack(&packet)
        } else {
            state.notify_received_msg(packet)
        };

        let Some(comms) = comms.upgrade() else {
            break;
        };
        match event {
            Ok(StateEvent::None) => {}
            Ok(StateEvent::Connected { connack, token }) => {
                comms.connect_complete(&connack, token);
            }
            Ok(StateEvent::ConnectFailed { error, token }) => {
                warn!(client_id = %client_id, error = %error, "connect refused");
                comms.shutdown_connection(Some(token), Some(error));
                break;
            }
            Ok(StateEvent::ServerDisconnect(error)) => {
                if let MqttClientError::ServerDisconnected {
                    reason_code,
                    reason_string,
                } = &error
                {
                    comms
                        .callback()
                        .disconnected(*reason_code, reason_string.as_deref());
                }
                cause = Some(error);
                break;
            }
            Err(e) => {
                cause = Some(e);
                break;
            }
        }
    }

    if let Some(cause) = cause {
        if let Some(comms) = comms.upgrade() {
            if comms.is_disconnecting() {
                debug!(client_id = %client_id, reason = %cause, "read ended during shutdown");
            } else {
                warn!(client_id = %client_id, reason = %cause, "connection lost");
                comms.shutdown_connection(None, Some(cause));
            }
        }
    }
    debug!(client_id = %client_id, "receiver stopped");
}
