//! Transmitters: what a listener does with a delivered batch.

use async_trait::async_trait;
use reactor_types::{Cursor, Strand};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use super::EmitterError;

/// Receives strands pushed by the emitter.
#[async_trait]
pub trait StrandHandler: Send + Sync {
    /// Handle one delivery. Strands are in commit order.
    ///
    /// On error the batch is kept and delivered again after the next
    /// debounce window.
    async fn on_strands(&self, strands: Vec<Strand>) -> Result<(), EmitterError>;
}

/// How a listener receives strands.
#[derive(Clone)]
pub enum Transmitter {
    /// Call a handler with every batch.
    Push(Arc<dyn StrandHandler>),
    /// Queue batches until a remote pulls them.
    PullResponder,
}

impl Transmitter {
    /// The kind, without the handler.
    pub fn kind(&self) -> TransmitterKind {
        match self {
            Transmitter::Push(_) => TransmitterKind::Push,
            Transmitter::PullResponder => TransmitterKind::PullResponder,
        }
    }
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transmitter::{:?}", self.kind())
    }
}

/// Transmitter kind, for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterKind {
    /// Push callback
    Push,
    /// Pull responder
    PullResponder,
}

/// One page of a pull responder's outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PullPage {
    /// Strands after the requested cursor, oldest first
    pub strands: Vec<Strand>,
    /// Cursor of the last returned strand, or the requested cursor when
    /// nothing was returned
    pub next_cursor: Cursor,
    /// Whether entries remain after this page
    pub has_more: bool,
}

/// Delivered strands waiting for a remote to pull and acknowledge them.
///
/// Every strand gets its own cursor, increasing from 1.
#[derive(Debug, Default)]
pub(crate) struct PullOutbox {
    entries: VecDeque<(Cursor, Strand)>,
    last: Cursor,
}

impl PullOutbox {
    pub(crate) fn push(&mut self, strands: Vec<Strand>) {
        for strand in strands {
            self.last = self.last.next();
            self.entries.push_back((self.last, strand));
        }
    }

    pub(crate) fn page(&self, since: Cursor, limit: usize) -> PullPage {
        let mut after = self
            .entries
            .iter()
            .filter(|(cursor, _)| *cursor > since)
            .peekable();

        let mut strands = Vec::new();
        let mut next_cursor = since;
        while strands.len() < limit {
            match after.next() {
                Some((cursor, strand)) => {
                    next_cursor = *cursor;
                    strands.push(strand.clone());
                }
                None => break,
            }
        }
        PullPage {
            strands,
            next_cursor,
            has_more: after.peek().is_some(),
        }
    }

    /// Drop entries up to and including `cursor`. Returns the highest
    /// cursor trimmed so far.
    pub(crate) fn acknowledge(&mut self, cursor: Cursor) -> Cursor {
        while self
            .entries
            .front()
            .is_some_and(|(entry, _)| *entry <= cursor)
        {
            self.entries.pop_front();
        }
        cursor.min(self.last)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
