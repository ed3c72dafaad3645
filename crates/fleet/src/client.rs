use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::FleetError;
use crate::protocol::{Envelope, StatusReply, StatusReport, STATUS};
use crate::reqrep::RequestClient;
use crate::traits::StatusChannel;
use crate::transport::Transport;

/// Default time to wait for the controller's reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`StatusChannel`] to a controller over ZeroMQ.
///
/// The socket is opened on first use and thrown away after a transport
/// failure, so the next heartbeat reconnects from scratch.
pub struct ControllerClient {
    transport: Transport,
    timeout: Duration,
    socket: Mutex<Option<RequestClient>>,
}

impl ControllerClient {
    /// Client that connects lazily on the first heartbeat.
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            socket: Mutex::new(None),
        }
    }

    /// Client that connects now and fails if the controller is unreachable.
    pub async fn connect(transport: Transport, timeout: Duration) -> Result<Self, FleetError> {
        let socket = open(&transport, timeout).await?;
        Ok(Self {
            transport,
            timeout,
            socket: Mutex::new(Some(socket)),
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

#[async_trait]
impl StatusChannel for ControllerClient {
    async fn send_status(&self, report: &StatusReport) -> Result<StatusReply, FleetError> {
        let mut socket = self.socket.lock().await;
        if socket.is_none() {
            debug!(endpoint = %self.transport, "connecting to controller");
            *socket = Some(open(&self.transport, self.timeout).await?);
        }
        let Some(client) = socket.as_ref() else {
            return Err(FleetError::Transport("controller socket unavailable".into()));
        };

        let request = Envelope::new(STATUS, report)?;
        match client.request(request, self.timeout).await {
            Ok(reply) => reply.decode(),
            Err(e) => {
                warn!(endpoint = %self.transport, error = %e, "dropping controller connection");
                *socket = None;
                Err(e)
            }
        }
    }
}

/// Connecting counts against the same budget as a reply.
async fn open(transport: &Transport, timeout: Duration) -> Result<RequestClient, FleetError> {
    tokio::time::timeout(timeout, RequestClient::connect(transport))
        .await
        .map_err(|_| FleetError::Timeout(timeout))?
}
