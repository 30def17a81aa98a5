//! Outbound message queue
//!
//! Producers anywhere in the process enqueue envelopes; the session's send
//! loop drains them while connected. Messages older than the queue's
//! maximum age are discarded unsent.

use chrono::{DateTime, TimeDelta, Utc};
use futures::{Sink, SinkExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Envelope, OutboundMessage, TransportError};

/// Age after which an unsent message is dropped
pub const DEFAULT_MAX_AGE_SECS: i64 = 5 * 60;

/// Result of one drain step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing queued
    Empty,
    /// Head message was written to the sink
    Sent,
    /// Head message was stale and dropped
    Discarded,
}

/// FIFO of outbound messages, safe to share between tasks
#[derive(Debug)]
pub struct OutboundQueue {
    messages: Mutex<VecDeque<OutboundMessage>>,
    next_id: AtomicU64,
    max_age: TimeDelta,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    /// Empty queue discarding messages older than five minutes
    pub fn new() -> Self {
        Self::with_max_age(TimeDelta::seconds(DEFAULT_MAX_AGE_SECS))
    }

    /// Empty queue with a different staleness limit
    pub fn with_max_age(max_age: TimeDelta) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            max_age,
        }
    }

    /// Enqueue a message stamped with the current time; returns its id
    pub fn enqueue(&self, envelope: Envelope, prepend: bool) -> u64 {
        self.enqueue_at(envelope, prepend, Utc::now())
    }

    /// Enqueue a message with an explicit timestamp
    pub fn enqueue_at(&self, envelope: Envelope, prepend: bool, timestamp: DateTime<Utc>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = OutboundMessage {
            id,
            timestamp,
            envelope,
        };
        let mut messages = self.lock();
        if prepend {
            messages.push_front(message);
        } else {
            messages.push_back(message);
        }
        id
    }

    /// Append a message
    pub fn push(&self, envelope: Envelope) -> u64 {
        self.enqueue(envelope, false)
    }

    /// Put a message at the head of the queue
    pub fn push_front(&self, envelope: Envelope) -> u64 {
        self.enqueue(envelope, true)
    }

    /// Append a `{type, parameters}` message for this controller's folder
    pub fn send(&self, message_type: &str, parameters: Value) -> u64 {
        self.push(Envelope::new(message_type, parameters))
    }

    /// Ask the server to send an email
    pub fn send_email(&self, email_addresses: &str, subject: &str, body: &str) -> u64 {
        self.send(
            "send_email",
            json!({"emailAddresses": email_addresses, "subject": subject, "body": body}),
        )
    }

    /// Ask the server to send a text message
    pub fn send_sms(&self, phone_numbers: &str, message: &str) -> u64 {
        self.send(
            "send_text_message",
            json!({"phoneNumbers": phone_numbers, "message": message}),
        )
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Message types currently queued, head first
    pub fn pending_types(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|m| m.envelope.message_type.clone())
            .collect()
    }

    /// Copy of the queued messages, head first
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.lock().iter().cloned().collect()
    }

    /// Send or discard the head message.
    ///
    /// The head is copied out under the lock and removed by id afterwards, so
    /// a message prepended while the send is in flight stays queued. On a
    /// send error the head is kept for the next connection.
    pub async fn drain_one<S>(
        &self,
        sink: &mut S,
        now: DateTime<Utc>,
    ) -> Result<DrainOutcome, TransportError>
    where
        S: Sink<Envelope, Error = TransportError> + Unpin + ?Sized,
    {
        let head = match self.lock().front() {
            Some(m) => m.clone(),
            None => return Ok(DrainOutcome::Empty),
        };

        if now - head.timestamp > self.max_age {
            tracing::debug!(
                "discarding stale {} message from {}",
                head.envelope.message_type,
                head.timestamp
            );
            self.remove(head.id);
            return Ok(DrainOutcome::Discarded);
        }

        sink.send(head.envelope.clone()).await?;
        self.remove(head.id);
        Ok(DrainOutcome::Sent)
    }

    fn remove(&self, id: u64) {
        let mut messages = self.lock();
        if let Some(pos) = messages.iter().position(|m| m.id == id) {
            messages.remove(pos);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OutboundMessage>> {
        // queue contents stay consistent even if a holder panicked
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}
