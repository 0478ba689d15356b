//! Client side of the cursor protocol.
//!
//! [`StreamClient`] speaks to a server through any [`StreamTransport`]: the
//! WebSocket transport in [`crate::ws_client`], or [`InProcessTransport`] when
//! the client and server share a process.

use std::{future::Future, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    control_plane::ControlPlane,
    error::StreamError,
    protocol::{parse_subscribe_response, StreamCommand, StreamDelivery, SubscribeAck},
    subscriptions::DeliveryQueue,
    types::{Cursor, StreamScope},
    workspace::{SnapshotPayload, WorkspaceMutation},
};

/// One request/response round trip. Deliveries for subscriptions arrive out
/// of band on the channel the transport was created with.
pub trait StreamTransport: Send + Sync {
    fn request(&self, command: StreamCommand) -> impl Future<Output = Result<Value, StreamError>> + Send;
}

pub struct StreamClient<T> {
    transport: T,
}

impl<T: StreamTransport> StreamClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribe to `scope`. With `after_cursor = None` the subscription starts
    /// from now; otherwise every event after that cursor is replayed first.
    pub async fn subscribe(
        &self,
        scope: &StreamScope,
        after_cursor: Option<Cursor>,
    ) -> Result<SubscribeAck, StreamError> {
        let response = self
            .transport
            .request(StreamCommand::subscribe(scope, after_cursor))
            .await?;
        parse_subscribe_response(&response)
    }

    /// Best-effort: failures are logged and discarded.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let command = StreamCommand::Unsubscribe {
            subscription_id: subscription_id.to_string(),
        };
        if let Err(error) = self.transport.request(command).await {
            tracing::debug!(
                target = "agent_mux::client",
                subscription = %subscription_id,
                error = %error,
                "unsubscribe failed"
            );
        }
    }

    /// The observed stream's current cursor, read by opening and immediately
    /// closing a from-now subscription. A missing or non-numeric cursor in the
    /// response yields `None`; a missing subscription id is an error.
    pub async fn read_observed_stream_cursor_baseline(
        &self,
        scope: &StreamScope,
    ) -> Result<Option<Cursor>, StreamError> {
        let mut scope = scope.clone();
        scope.conversation_id = None;
        let ack = self.subscribe(&scope, None).await?;
        self.unsubscribe(&ack.subscription_id).await;
        Ok(ack.cursor)
    }

    pub async fn load_snapshot(&self, scope: &StreamScope) -> Result<SnapshotPayload, StreamError> {
        let response = self.transport.request(StreamCommand::snapshot(scope)).await?;
        serde_json::from_value(response).map_err(|error| StreamError::InvalidResponse(error.to_string()))
    }

    pub async fn mutate(&self, mutations: Vec<WorkspaceMutation>) -> Result<Value, StreamError> {
        self.transport
            .request(StreamCommand::Mutate { mutations })
            .await
    }
}

/// Transport that calls straight into a [`ControlPlane`] in the same process.
/// Dropping it releases every subscription it opened.
pub struct InProcessTransport {
    plane: Arc<ControlPlane>,
    queue: DeliveryQueue,
    owner: String,
}

impl InProcessTransport {
    pub fn connect(plane: Arc<ControlPlane>) -> (Self, mpsc::Receiver<StreamDelivery>) {
        let (queue, deliveries) = plane.delivery_channel();
        let transport = Self {
            plane,
            queue,
            owner: format!("local_{}", Uuid::new_v4().simple()),
        };
        (transport, deliveries)
    }
}

impl StreamTransport for InProcessTransport {
    fn request(&self, command: StreamCommand) -> impl Future<Output = Result<Value, StreamError>> + Send {
        self.plane
            .handle_command(command, &self.queue, Some(self.owner.as_str()))
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        self.plane.subscriptions().unsubscribe_owner(&self.owner);
    }
}
