//! WebSocket implementation of [`StreamTransport`].
//!
//! One socket carries every request and every subscription. A writer task owns
//! the sink half; a reader task routes `stream.response` frames to the waiting
//! request by `requestId` and forwards `stream.event` frames to the delivery
//! channel handed out by [`WsTransport::connect`].

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message,
};

use crate::{
    error::{StreamError, TransportError},
    protocol::{encode_request, ServerFrame, StreamCommand, StreamDelivery},
    stream_client::StreamTransport,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingReply = oneshot::Sender<Result<Value, StreamError>>;
type PendingTable = Arc<Mutex<HashMap<String, PendingReply>>>;

pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingTable,
    next_request: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to a server's `/ws` endpoint. `api_key`, when set, is sent as a
    /// bearer token. Deliveries are buffered up to `queue` frames; a full queue
    /// applies backpressure to the socket.
    pub async fn connect(
        url: &str,
        api_key: Option<&str>,
        queue: usize,
    ) -> Result<(Self, mpsc::Receiver<StreamDelivery>), TransportError> {
        let mut request = url.into_client_request()?;
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(tungstenite::Error::from)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(target = "agent_mux::ws", url = %url, "stream socket connected");
        let (mut write, mut read) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(error) = write.send(message).await {
                    tracing::warn!(target = "agent_mux::ws", error = %error, "ws write error");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let pending: PendingTable = Arc::default();
        let (deliveries_tx, deliveries) = mpsc::channel(queue.max(1));
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let frame = match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => frame,
                            Err(error) => {
                                tracing::debug!(
                                    target = "agent_mux::ws",
                                    error = %error,
                                    "ignoring unrecognized frame"
                                );
                                continue;
                            }
                        };
                        if let Some(delivery) = dispatch_frame(frame, &reader_pending) {
                            // A dropped receiver only discards events; responses
                            // must keep flowing.
                            let _ = deliveries_tx.send(delivery).await;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(
                            target = "agent_mux::ws",
                            reason = ?frame.as_ref().map(|f| f.reason.to_string()),
                            "server closed stream socket"
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(target = "agent_mux::ws", error = %error, "ws read error");
                        break;
                    }
                }
            }
            // Dropping the waiters resolves them as closed.
            reader_pending.lock().clear();
            tracing::debug!(target = "agent_mux::ws", "stream socket closed");
        });

        Ok((
            Self {
                outbound,
                pending,
                next_request: AtomicU64::new(1),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                reader,
                writer,
            },
            deliveries,
        ))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.outbound.is_closed()
    }

    fn send_request(
        &self,
        command: &StreamCommand,
    ) -> Result<(String, oneshot::Receiver<Result<Value, StreamError>>), StreamError> {
        let request_id = format!("req_{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        let frame = encode_request(&request_id, command).map_err(TransportError::from)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), reply_tx);
        if self.outbound.send(Message::Text(frame.to_string())).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::Closed.into());
        }
        Ok((request_id, reply_rx))
    }
}

impl StreamTransport for WsTransport {
    fn request(&self, command: StreamCommand) -> impl Future<Output = Result<Value, StreamError>> + Send {
        let sent = self.send_request(&command);
        let pending = self.pending.clone();
        let request_timeout = self.request_timeout;
        async move {
            let (request_id, reply) = sent?;
            match tokio::time::timeout(request_timeout, reply).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::Closed.into()),
                Err(_) => {
                    pending.lock().remove(&request_id);
                    tracing::warn!(
                        target = "agent_mux::ws",
                        request_id = %request_id,
                        kind = command.kind(),
                        "request timed out"
                    );
                    Err(TransportError::Timeout.into())
                }
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Complete the waiter for a response frame, or hand back an event frame.
fn dispatch_frame(frame: ServerFrame, pending: &PendingTable) -> Option<StreamDelivery> {
    match frame {
        ServerFrame::Event(delivery) => Some(delivery),
        ServerFrame::Response {
            request_id,
            ok,
            result,
            error,
        } => {
            let waiter = request_id.and_then(|id| pending.lock().remove(&id));
            let Some(waiter) = waiter else {
                tracing::debug!(target = "agent_mux::ws", "response for unknown request");
                return None;
            };
            let outcome = if ok {
                Ok(result.unwrap_or(Value::Null))
            } else {
                let error = error.unwrap_or_else(|| crate::protocol::ProtocolError {
                    code: "server_error".into(),
                    message: "request failed".into(),
                });
                Err(StreamError::Server {
                    code: error.code,
                    message: error.message,
                })
            };
            let _ = waiter.send(outcome);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::{dispatch_frame, PendingTable};
    use crate::{
        error::StreamError,
        protocol::{ProtocolError, ServerFrame, StreamDelivery},
    };

    fn table() -> PendingTable {
        Arc::new(Mutex::default())
    }

    #[test]
    fn responses_resolve_their_waiter() {
        let pending = table();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("req_1".into(), tx);

        let frame = ServerFrame::ok(Some("req_1".into()), json!({"removed": true}));
        assert!(dispatch_frame(frame, &pending).is_none());
        assert!(pending.lock().is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"removed": true}));
    }

    #[test]
    fn error_responses_become_server_errors() {
        let pending = table();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("req_2".into(), tx);

        let frame = ServerFrame::error(
            Some("req_2".into()),
            ProtocolError {
                code: "unknown_conversation".into(),
                message: "unknown conversation: c9".into(),
            },
        );
        dispatch_frame(frame, &pending);
        match rx.try_recv().unwrap() {
            Err(StreamError::Server { code, .. }) => assert_eq!(code, "unknown_conversation"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn events_pass_through_and_stray_responses_are_ignored() {
        let pending = table();
        let delivery = StreamDelivery {
            subscription_id: "sub_1".into(),
            cursor: 3,
            event: json!({"type": "task-deleted", "taskId": "t1"}),
        };
        assert_eq!(
            dispatch_frame(ServerFrame::Event(delivery.clone()), &pending),
            Some(delivery)
        );
        assert!(dispatch_frame(ServerFrame::ok(Some("nobody".into()), json!({})), &pending).is_none());
        assert!(dispatch_frame(ServerFrame::ok(None, json!({})), &pending).is_none());
    }
}
