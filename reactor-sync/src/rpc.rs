//! RPC channel: one protocol message per call.

use crate::channel::{Channel, PullBatch};
use crate::error::{ChannelCause, ChannelError, ErrorSource};
use crate::transport::Transport;
use async_trait::async_trait;
use reactor_types::{
    Acknowledge, Cursor, DriveId, ListenerFilter, ListenerId, Message, PullStrands, PushAck,
    PushStrands, RegisterListener, Strand,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Registration {
    drive_id: DriveId,
    filter: ListenerFilter,
    listener_id: Option<ListenerId>,
}

/// Talks to a remote [`SyncService`](reactor_server::SyncService) through a
/// [`Transport`].
pub struct RpcChannel {
    remote: String,
    origin: String,
    transport: Arc<dyn Transport>,
    pull_limit: u32,
    registration: Mutex<Option<Registration>>,
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("remote", &self.remote)
            .field("origin", &self.origin)
            .field("endpoint", &self.transport.endpoint())
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Channel to `remote`. `origin` is the name the remote knows this
    /// reactor by; it tags pushed strands.
    pub fn new(remote: impl Into<String>, origin: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            remote: remote.into(),
            origin: origin.into(),
            transport,
            pull_limit: 0,
            registration: Mutex::new(None),
        }
    }

    /// Strands per pull; 0 lets the remote decide.
    pub fn with_pull_limit(mut self, limit: u32) -> Self {
        self.pull_limit = limit;
        self
    }

    /// Pull from a listener registered earlier.
    ///
    /// If the remote forgets it, a new one is registered for `drive_id`
    /// and `filter`.
    pub async fn use_listener(&self, listener_id: ListenerId, drive_id: DriveId, filter: ListenerFilter) {
        *self.registration.lock().await = Some(Registration {
            drive_id,
            filter,
            listener_id: Some(listener_id),
        });
    }

    /// Ask the remote for a pull-responder listener on `drive_id`, with
    /// existing history queued for the first pull.
    pub async fn register_listener(
        &self,
        drive_id: DriveId,
        filter: ListenerFilter,
    ) -> Result<ListenerId, ChannelError> {
        let mut registration = self.registration.lock().await;
        let listener_id = self.register(&drive_id, &filter).await?;
        *registration = Some(Registration {
            drive_id,
            filter,
            listener_id: Some(listener_id),
        });
        Ok(listener_id)
    }

    /// Listener currently pulled from.
    pub async fn listener_id(&self) -> Option<ListenerId> {
        self.registration
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.listener_id)
    }

    async fn register(&self, drive_id: &DriveId, filter: &ListenerFilter) -> Result<ListenerId, ChannelError> {
        let response = self
            .call(Message::RegisterListener(RegisterListener {
                drive_id: drive_id.clone(),
                filter: filter.clone(),
                backfill: true,
            }))
            .await?;
        match response {
            Message::ListenerRegistered(registered) => {
                tracing::info!(remote = %self.remote, listener = %registered.listener_id, "registered remote listener");
                Ok(registered.listener_id)
            }
            other => Err(unexpected("ListenerRegistered", &other)),
        }
    }

    async fn call(&self, request: Message) -> Result<Message, ChannelError> {
        let rpc = |cause: crate::error::TransportError| ChannelError::new(ErrorSource::Rpc, cause);

        let body = request.to_bytes().map_err(|e| rpc(e.into()))?;
        let bytes = self.transport.request(body).await.map_err(rpc)?;
        match Message::from_bytes(&bytes).map_err(|e| rpc(e.into()))? {
            Message::Error(error) => Err(ChannelError::new(
                ErrorSource::Remote,
                ChannelCause::Rejected {
                    code: error.code,
                    message: error.message,
                },
            )),
            response => Ok(response),
        }
    }

    async fn pull_from(&self, listener_id: ListenerId, since: Cursor) -> Result<PullBatch, ChannelError> {
        let response = self
            .call(Message::PullStrands(PullStrands {
                listener_id,
                since,
                limit: self.pull_limit,
            }))
            .await?;
        match response {
            Message::PullResponse(page) => Ok(PullBatch {
                strands: page.strands,
                next_cursor: page.next_cursor,
                has_more: page.has_more,
            }),
            other => Err(unexpected("PullResponse", &other)),
        }
    }
}

fn unexpected(expected: &'static str, actual: &Message) -> ChannelError {
    ChannelError::new(
        ErrorSource::Rpc,
        ChannelCause::UnexpectedResponse {
            expected,
            actual: actual.kind(),
        },
    )
}

#[async_trait]
impl Channel for RpcChannel {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn push(&self, strands: Vec<Strand>) -> Result<PushAck, ChannelError> {
        let count = strands.len();
        let response = self
            .call(Message::PushStrands(PushStrands {
                origin: self.origin.clone(),
                strands,
            }))
            .await?;
        match response {
            Message::PushAck(ack) => {
                tracing::debug!(remote = %self.remote, strands = count, all_applied = ack.all_applied(), "pushed strands");
                Ok(ack)
            }
            other => Err(unexpected("PushAck", &other)),
        }
    }

    /// Pull after `cursor`.
    ///
    /// When the remote no longer knows the listener, a new one is
    /// registered and the batch starts from its beginning; `cursor` belongs
    /// to the old listener and is ignored.
    async fn pull(&self, cursor: Cursor) -> Result<PullBatch, ChannelError> {
        let mut registration = self.registration.lock().await;
        let Some(current) = registration.as_mut() else {
            return Err(ChannelError::new(ErrorSource::Rpc, ChannelCause::NotRegistered));
        };
        let Some(listener_id) = current.listener_id else {
            return Err(ChannelError::new(ErrorSource::Rpc, ChannelCause::NotRegistered));
        };

        match self.pull_from(listener_id, cursor).await {
            Err(e) if e.is_unknown_listener() => {
                tracing::info!(remote = %self.remote, listener = %listener_id, "listener not found on remote, re-registering");
                current.listener_id = None;
                let fresh = self.register(&current.drive_id, &current.filter).await?;
                current.listener_id = Some(fresh);
                self.pull_from(fresh, Cursor::zero()).await
            }
            result => result,
        }
    }

    async fn acknowledge(&self, cursor: Cursor) -> Result<(), ChannelError> {
        let listener_id = self
            .listener_id()
            .await
            .ok_or_else(|| ChannelError::new(ErrorSource::Rpc, ChannelCause::NotRegistered))?;
        let response = self
            .call(Message::Acknowledge(Acknowledge { listener_id, cursor }))
            .await?;
        match response {
            Message::Acknowledged(_) => Ok(()),
            other => Err(unexpected("Acknowledged", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use reactor_types::{
        Acknowledged, ErrorCode, ErrorResponse, ListenerRegistered, PullResponse, StrandResult,
        StrandStatus, DocumentId,
    };

    fn channel(transport: &MockTransport) -> RpcChannel {
        RpcChannel::new("peer", "me", Arc::new(transport.clone()))
    }

    fn empty_page(next: u64) -> Message {
        Message::PullResponse(PullResponse {
            strands: vec![],
            next_cursor: Cursor::new(next),
            has_more: false,
        })
    }

    #[tokio::test]
    async fn register_then_pull_and_ack() {
        let transport = MockTransport::new();
        let listener_id = ListenerId::new();
        transport
            .queue_message(&Message::ListenerRegistered(ListenerRegistered { listener_id }))
            .unwrap();
        transport.queue_message(&empty_page(4)).unwrap();
        transport
            .queue_message(&Message::Acknowledged(Acknowledged { cursor: Cursor::new(4) }))
            .unwrap();

        let rpc = channel(&transport);
        assert_eq!(
            rpc.register_listener(DriveId::from("drive"), ListenerFilter::default())
                .await
                .unwrap(),
            listener_id
        );
        let batch = rpc.pull(Cursor::new(2)).await.unwrap();
        assert_eq!(batch.next_cursor, Cursor::new(4));
        rpc.acknowledge(batch.next_cursor).await.unwrap();

        let sent = transport.sent_messages();
        assert!(matches!(&sent[0], Message::RegisterListener(r) if r.backfill));
        assert_eq!(
            sent[1],
            Message::PullStrands(PullStrands {
                listener_id,
                since: Cursor::new(2),
                limit: 0,
            })
        );
        assert_eq!(
            sent[2],
            Message::Acknowledge(Acknowledge {
                listener_id,
                cursor: Cursor::new(4),
            })
        );
    }

    #[tokio::test]
    async fn pull_without_listener_fails() {
        let rpc = channel(&MockTransport::new());
        let err = rpc.pull(Cursor::zero()).await.unwrap_err();
        assert!(matches!(err.cause, ChannelCause::NotRegistered));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn forgotten_listener_is_registered_again() {
        let transport = MockTransport::new();
        let fresh = ListenerId::new();
        transport
            .queue_message(&Message::Error(ErrorResponse {
                code: ErrorCode::UnknownListener,
                message: "gone".into(),
            }))
            .unwrap();
        transport
            .queue_message(&Message::ListenerRegistered(ListenerRegistered { listener_id: fresh }))
            .unwrap();
        transport.queue_message(&empty_page(1)).unwrap();

        let rpc = channel(&transport);
        rpc.use_listener(ListenerId::new(), DriveId::from("drive"), ListenerFilter::default())
            .await;
        let batch = rpc.pull(Cursor::new(7)).await.unwrap();

        assert_eq!(batch.next_cursor, Cursor::new(1));
        assert_eq!(rpc.listener_id().await, Some(fresh));
        assert_eq!(
            transport.sent_messages()[2],
            Message::PullStrands(PullStrands {
                listener_id: fresh,
                since: Cursor::zero(),
                limit: 0,
            })
        );
    }

    #[tokio::test]
    async fn push_sends_origin_and_returns_ack() {
        let transport = MockTransport::new();
        let ack = PushAck {
            results: vec![StrandResult {
                document_id: DocumentId::from("doc"),
                scope: "global".into(),
                branch: "main".into(),
                status: StrandStatus::Applied { revision: Some(0) },
            }],
        };
        transport.queue_message(&Message::PushAck(ack.clone())).unwrap();

        let rpc = channel(&transport);
        assert_eq!(rpc.push(vec![]).await.unwrap(), ack);
        assert!(matches!(
            &transport.sent_messages()[0],
            Message::PushStrands(p) if p.origin == "me"
        ));
    }

    #[tokio::test]
    async fn errors_are_tagged_by_source() {
        let transport = MockTransport::new();
        transport.fail_next("connection refused");
        transport
            .queue_message(&Message::Error(ErrorResponse {
                code: ErrorCode::BadRequest,
                message: "bad".into(),
            }))
            .unwrap();
        transport.queue_message(&empty_page(0)).unwrap();

        let rpc = channel(&transport);
        let transport_err = rpc.push(vec![]).await.unwrap_err();
        assert_eq!(transport_err.source, ErrorSource::Rpc);
        assert!(transport_err.is_transport());

        let rejected = rpc.push(vec![]).await.unwrap_err();
        assert_eq!(rejected.source, ErrorSource::Remote);
        assert!(!rejected.is_retryable());

        let wrong = rpc.push(vec![]).await.unwrap_err();
        assert!(matches!(
            wrong.cause,
            ChannelCause::UnexpectedResponse {
                expected: "PushAck",
                actual: "PullResponse"
            }
        ));
    }
}
