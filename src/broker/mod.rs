//! Queue backends implementing the delivery contract.
//!
//! A [`Broker`] stores accepted messages durably, hands them out in bounded batches with a
//! visibility window, and relocates messages that keep failing to a per-queue dead-letter
//! holding area. The contract is the same for every backend:
//!
//! - `send` returns only once the message is stored, and never waits on processing
//! - `receive` hides each returned message for the queue's visibility timeout and mints a
//!   fresh [`ReceiptHandle`] for it
//! - a message whose receive count has reached `max_receive_count` is moved to the
//!   dead-letter area by the next `receive` instead of being delivered again
//! - only the current receipt handle can `delete` (acknowledge) or `release` (fail early)
//!   a message
//! - messages older than the retention window are discarded, acknowledged or not

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::{
    error::Error,
    message::{DeadLetter, Delivery, MessageAttributes, MessageId, ReceiptHandle, SendReceipt},
    queue::{QueuePolicy, QueueStatistics},
};

pub mod memory;
pub mod sqlite;


pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

pub trait Broker: Send + Sync + 'static {
    /// Declares a queue and its dead-letter area. Declaring an existing queue replaces its
    /// policy and keeps its messages.
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        policy: QueuePolicy,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Stores a message. The body is kept byte-for-byte.
    fn send<'a>(
        &'a self,
        queue: &'a str,
        body: Bytes,
        attributes: MessageAttributes,
    ) -> BoxFuture<'a, Result<SendReceipt, Error>>;

    /// Claims up to `max_messages` visible messages, at most
    /// [`MAX_RECEIVE_MESSAGES`](crate::queue::MAX_RECEIVE_MESSAGES) per call.
    fn receive<'a>(
        &'a self,
        queue: &'a str,
        max_messages: usize,
    ) -> BoxFuture<'a, Result<Vec<Delivery>, Error>>;

    /// Acknowledges a delivery, removing the message for good.
    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt: &'a ReceiptHandle,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Ends a delivery early, making the message visible again right away.
    fn release<'a>(
        &'a self,
        queue: &'a str,
        receipt: &'a ReceiptHandle,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Vec<DeadLetter>, Error>>;

    /// Moves a dead letter back to the primary queue with a clean receive count.
    fn redrive<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>>;

    fn discard<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>>;

    /// Discards every message past its retention window, returning how many were dropped.
    fn expire(&self) -> BoxFuture<'_, Result<u64, Error>>;

    fn statistics(&self) -> BoxFuture<'_, Result<Vec<QueueStatistics>, Error>>;
}

pub(crate) fn check_body(body: &[u8]) -> Result<(), Error> {
    if body.len() > crate::message::MAX_BODY_BYTES {
        return Err(Error::PayloadTooLarge {
            size: body.len(),
            limit: crate::message::MAX_BODY_BYTES,
        });
    }
    Ok(())
}

pub(crate) fn receive_limit(max_messages: usize) -> usize {
    max_messages.clamp(1, crate::queue::MAX_RECEIVE_MESSAGES)
}
