//! Mock transport for testing.
//!
//! Allows queueing responses and capturing sent messages for verification.

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use reactor_types::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Mock transport for testing.
///
/// Answers requests from a queue; an empty queue answers
/// [`TransportError::Closed`]. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    sent: Vec<Vec<u8>>,
    responses: VecDeque<Result<Vec<u8>, String>>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next request with `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn queue_message(&self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.to_bytes()?;
        self.lock().responses.push_back(Ok(bytes));
        Ok(())
    }

    /// Fail the next request.
    pub fn fail_next(&self, error: &str) {
        self.lock().responses.push_back(Err(error.to_string()));
    }

    /// Every request sent so far, decoded. Undecodable requests are skipped.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.lock()
            .sent
            .iter()
            .filter_map(|bytes| Message::from_bytes(bytes).ok())
            .collect()
    }

    /// Responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.lock().responses.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();
        inner.sent.push(body);
        match inner.responses.pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(error)) => Err(TransportError::Request(error)),
            None => Err(TransportError::Closed),
        }
    }

    fn endpoint(&self) -> &str {
        "mock"
    }
}
