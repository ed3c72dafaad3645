use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::protocol::{StatusReply, StatusReport};

/// Engine side of the heartbeat: one upload, one reply.
///
/// [`ControllerClient`](crate::client::ControllerClient) is the ZeroMQ
/// implementation; tests plug in scripted channels.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn send_status(&self, report: &StatusReport) -> Result<StatusReply, FleetError>;
}

#[async_trait]
impl<T: StatusChannel + ?Sized> StatusChannel for Arc<T> {
    async fn send_status(&self, report: &StatusReport) -> Result<StatusReply, FleetError> {
        (**self).send_status(report).await
    }
}

/// Controller side of the heartbeat: decide what an engine does next.
///
/// Scheduling policy lives entirely behind this trait.
#[async_trait]
pub trait StatusHandler: Send + Sync {
    async fn handle(&self, report: StatusReport) -> StatusReply;
}

#[async_trait]
impl<T: StatusHandler + ?Sized> StatusHandler for Arc<T> {
    async fn handle(&self, report: StatusReport) -> StatusReply {
        (**self).handle(report).await
    }
}
