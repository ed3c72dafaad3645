//! Request/reply over ZeroMQ DEALER/ROUTER sockets.
//!
//! - [`RequestClient`] owns a DEALER socket; replies are matched to callers
//!   by the envelope's `correlation_id`.
//! - [`RequestServer`] owns a ROUTER socket; each request comes with a
//!   [`ReplyToken`] naming the peer to answer.
//!
//! Framing with zeromq-rs 0.4, where ROUTER adds the identity frame on recv
//! and strips it on send:
//! - DEALER sends / receives `[topic, envelope]`
//! - ROUTER receives / sends `[identity, topic, envelope]`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::error::FleetError;
use crate::protocol::Envelope;
use crate::transport::Transport;

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>>;

/// Identity of the DEALER peer a request came from.
#[derive(Debug, Clone)]
pub struct ReplyToken {
    identity: Vec<u8>,
}

/// DEALER client. The socket lives in a background task that multiplexes
/// outgoing requests and incoming replies; dropping the client stops it.
pub struct RequestClient {
    outgoing: mpsc::Sender<ZmqMessage>,
    pending: Pending,
    io_task: tokio::task::JoinHandle<()>,
}

impl RequestClient {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, FleetError> {
        let mut socket = DealerSocket::new();
        socket.connect(&transport.endpoint()).await?;
        info!("connected DEALER socket");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (outgoing, outgoing_rx) = mpsc::channel::<ZmqMessage>(64);
        let io_task = tokio::spawn(Self::io_loop(socket, outgoing_rx, Arc::clone(&pending)));

        Ok(Self {
            outgoing,
            pending,
            io_task,
        })
    }

    async fn io_loop(mut socket: DealerSocket, mut outgoing: mpsc::Receiver<ZmqMessage>, pending: Pending) {
        loop {
            tokio::select! {
                Some(msg) = outgoing.recv() => {
                    if let Err(e) = socket.send(msg).await {
                        warn!(error = %e, "DEALER send failed");
                        break;
                    }
                }
                received = socket.recv() => match received {
                    Ok(msg) => Self::route_reply(&pending, msg).await,
                    Err(e) => {
                        debug!(error = %e, "DEALER recv failed, closing");
                        break;
                    }
                },
                else => break,
            }
        }
        // Waiting callers see their reply channel close instead of timing out.
        pending.lock().await.clear();
    }

    async fn route_reply(pending: &Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>, msg: ZmqMessage) {
        let frames: Vec<_> = msg.iter().skip_while(|f| f.is_empty()).collect();
        let Some(envelope) = frames.get(1) else {
            warn!(frames = frames.len(), "reply without envelope frame");
            return;
        };
        let envelope = match Envelope::from_bytes(envelope) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "undecodable reply envelope");
                return;
            }
        };
        match pending.lock().await.remove(&envelope.correlation_id) {
            Some(tx) => {
                let _ = tx.send(envelope);
            }
            None => debug!(correlation_id = %envelope.correlation_id, "late or unknown reply dropped"),
        }
    }

    /// Send `request` and wait up to `timeout` for the matching reply.
    pub async fn request(&self, request: Envelope, timeout: Duration) -> Result<Envelope, FleetError> {
        let cid = request.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(cid, tx);

        let mut msg = ZmqMessage::from(request.topic.as_str());
        msg.push_back(request.to_bytes()?.into());
        if self.outgoing.send(msg).await.is_err() {
            self.pending.lock().await.remove(&cid);
            return Err(FleetError::Transport("DEALER socket closed".into()));
        }
        debug!(correlation_id = %cid, topic = %request.topic, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FleetError::Transport("connection closed before reply".into())),
            Err(_) => {
                self.pending.lock().await.remove(&cid);
                Err(FleetError::Timeout(timeout))
            }
        }
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

/// ROUTER server answering requests from any number of DEALER clients.
pub struct RequestServer {
    socket: Mutex<RouterSocket>,
}

impl RequestServer {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, FleetError> {
        transport.ensure_ipc_dir()?;
        transport.remove_stale_socket()?;
        let mut socket = RouterSocket::new();
        socket.bind(&transport.endpoint()).await?;
        info!("bound ROUTER socket");
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Wait for the next request from any client.
    pub async fn recv_request(&self) -> Result<(ReplyToken, Envelope), FleetError> {
        let msg = self.socket.lock().await.recv().await?;
        let frames: Vec<_> = msg.iter().collect();
        let Some((identity, rest)) = frames.split_first() else {
            return Err(FleetError::Transport("empty ROUTER message".into()));
        };
        let data: Vec<_> = rest.iter().skip_while(|f| f.is_empty()).collect();
        let Some(envelope) = data.get(1) else {
            return Err(FleetError::Transport(format!(
                "expected [topic, envelope] after identity, got {} frames",
                data.len()
            )));
        };
        let envelope = Envelope::from_bytes(envelope)?;
        debug!(correlation_id = %envelope.correlation_id, topic = %envelope.topic, "request received");
        Ok((
            ReplyToken {
                identity: identity.to_vec(),
            },
            envelope,
        ))
    }

    pub async fn send_reply(&self, token: ReplyToken, reply: Envelope) -> Result<(), FleetError> {
        let mut msg = ZmqMessage::from(token.identity);
        msg.push_back(reply.topic.as_bytes().to_vec().into());
        msg.push_back(reply.to_bytes()?.into());
        self.socket.lock().await.send(msg).await?;
        debug!(correlation_id = %reply.correlation_id, "reply sent");
        Ok(())
    }
}
