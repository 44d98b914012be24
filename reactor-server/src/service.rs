//! Sync service: answers protocol messages from remote channels.
//!
//! One request, one response. Transport (HTTP, loopback) is the caller's
//! business; errors go back as [`Message::Error`].

use crate::events::{EmitterError, SubscriptionToken};
use crate::reactor::Reactor;
use dashmap::DashMap;
use reactor_types::{
    Acknowledge, Acknowledged, ErrorCode, ErrorResponse, ListenerId, ListenerRegistered, Message,
    PullResponse, PullStrands, PushAck, PushStrands, RegisterListener, StrandResult, StrandStatus,
};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Serves remote pulls, pushes and acknowledgements against a reactor.
pub struct SyncService {
    reactor: Arc<Reactor>,
    /// Tokens of listeners created on behalf of remotes.
    tokens: DashMap<ListenerId, SubscriptionToken>,
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("remote_listeners", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Serve requests against `reactor`.
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            reactor,
            tokens: DashMap::new(),
        }
    }

    /// The reactor being served.
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Answer one request.
    pub async fn handle(&self, request: Message) -> Message {
        self.reactor
            .metrics()
            .sync_requests
            .fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();

        let response = match request {
            Message::RegisterListener(req) => self.register_listener(req).await,
            Message::PullStrands(req) => self.pull(req).await,
            Message::PushStrands(req) => self.push(req).await,
            Message::Acknowledge(req) => self.acknowledge(req),
            other => Err(error(
                ErrorCode::BadRequest,
                format!("{} is not a request", other.kind()),
            )),
        };

        response.unwrap_or_else(|e| {
            tracing::debug!(request = kind, code = ?e.code, message = %e.message, "sync request failed");
            Message::Error(e)
        })
    }

    /// Decode a MessagePack request, answer it and encode the response.
    pub async fn handle_bytes(&self, body: &[u8]) -> Vec<u8> {
        let response = match Message::from_bytes(body) {
            Ok(request) => self.handle(request).await,
            Err(e) => Message::Error(error(ErrorCode::BadRequest, e.to_string())),
        };
        match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode sync response");
                // An ErrorResponse holds only a code and a string.
                Message::Error(error(ErrorCode::Internal, "response encoding failed".into()))
                    .to_bytes()
                    .unwrap_or_default()
            }
        }
    }

    /// Drop a listener created for a remote. Returns false if unknown.
    pub fn release(&self, listener_id: &ListenerId) -> bool {
        match self.tokens.remove(listener_id) {
            Some((_, token)) => self.reactor.emitter().unregister(token),
            None => false,
        }
    }

    async fn register_listener(&self, req: RegisterListener) -> Result<Message, ErrorResponse> {
        let mut filter = req.filter;
        filter.drive_id = Some(req.drive_id);

        let subscription = self
            .reactor
            .emitter()
            .register_pull_responder(filter, req.backfill)
            .await
            .map_err(emitter_error)?;
        let listener_id = subscription.listener_id;
        self.tokens.insert(listener_id, subscription.token);
        tracing::info!(listener = %listener_id, backfill = req.backfill, "remote listener registered");

        Ok(Message::ListenerRegistered(ListenerRegistered { listener_id }))
    }

    async fn pull(&self, req: PullStrands) -> Result<Message, ErrorResponse> {
        let emitter = self.reactor.emitter();
        // Hand out what committed during the debounce window too.
        emitter.flush().await;
        let page = emitter
            .pull(&req.listener_id, req.since, req.limit)
            .map_err(emitter_error)?;

        Ok(Message::PullResponse(PullResponse {
            strands: page.strands,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        }))
    }

    async fn push(&self, req: PushStrands) -> Result<Message, ErrorResponse> {
        let mut results = Vec::with_capacity(req.strands.len());

        for strand in req.strands {
            let document_id = strand.document_id.clone();
            let scope = strand.scope.clone();
            let branch = strand.branch.clone();

            let status = match self.reactor.apply_strand(strand, &req.origin).await {
                Ok(_) => {
                    let revision = self
                        .reactor
                        .storage()
                        .current_revision(&document_id, &scope, &branch)
                        .await
                        .map_err(|e| error(ErrorCode::Internal, e.to_string()))?;
                    StrandStatus::Applied { revision }
                }
                // The pusher retries the whole batch; applied strands are
                // skipped the second time.
                Err(e) if e.is_transient() || e.is_aborted() => {
                    return Err(error(ErrorCode::Internal, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(origin = %req.origin, document = %document_id, error = %e, "rejected pushed strand");
                    StrandStatus::Rejected {
                        reason: e.to_string(),
                    }
                }
            };
            results.push(StrandResult {
                document_id,
                scope,
                branch,
                status,
            });
        }

        Ok(Message::PushAck(PushAck { results }))
    }

    fn acknowledge(&self, req: Acknowledge) -> Result<Message, ErrorResponse> {
        let cursor = self
            .reactor
            .emitter()
            .acknowledge(&req.listener_id, req.cursor)
            .map_err(emitter_error)?;
        Ok(Message::Acknowledged(Acknowledged { cursor }))
    }
}

fn error(code: ErrorCode, message: String) -> ErrorResponse {
    ErrorResponse { code, message }
}

fn emitter_error(err: EmitterError) -> ErrorResponse {
    let code = match err {
        EmitterError::UnknownListener(_) => ErrorCode::UnknownListener,
        EmitterError::NotPullResponder(_) => ErrorCode::BadRequest,
        EmitterError::Delivery(_) | EmitterError::Storage(_) => ErrorCode::Internal,
    };
    error(code, err.to_string())
}
