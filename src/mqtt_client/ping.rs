//! Keep-alive timer. Sleeps for whatever budget the session engine hands
//! back and shuts the connection down when it reports a liveness failure.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error};

use super::comms::ClientComms;
use super::state::ClientState;
use super::worker::{WorkerControl, WorkerHandle};

pub struct Pinger {
    client_id: String,
    control: Arc<WorkerControl>,
}

impl Pinger {
    pub fn new(client_id: &str) -> Self {
        Pinger {
            client_id: client_id.to_string(),
            control: WorkerControl::new("pinger"),
        }
    }

    /// No-op for a zero keep-alive.
    pub fn start(
        &self,
        state: Arc<ClientState>,
        keep_alive: Duration,
        comms: Weak<ClientComms>,
    ) -> io::Result<()> {
        if keep_alive.is_zero() {
            return Ok(());
        }
        let client_id = self.client_id.clone();
        self.control.start(
            format!("flowlink-ping-{}", self.client_id),
            move |handle| run(handle, client_id, state, keep_alive, comms),
        )?;
        Ok(())
    }

    pub fn stop(&self) {
        self.control.stop(None);
    }
}

fn run(
    handle: WorkerHandle,
    client_id: String,
    state: Arc<ClientState>,
    keep_alive: Duration,
    comms: Weak<ClientComms>,
) {
    let mut next = keep_alive;
    while handle.sleep(next) {
        match state.check_for_activity() {
            Ok((_, delay)) => next = delay,
            Err(e) => {
                error!(client_id = %client_id, error = %e, "keep-alive failure");
                if let Some(comms) = comms.upgrade() {
                    comms.shutdown_connection(None, Some(e));
                }
                break;
            }
        }
    }
    debug!(client_id = %client_id, "keep-alive timer stopped");
}
